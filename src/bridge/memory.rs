use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::{Broker, BrokerError, BrokerMessage, Subscription, topic_matches};

/// In-process broker. Every instance sharing one `MemoryBroker` behaves like
/// a separate server process attached to the same pub/sub backend.
#[derive(Debug)]
pub struct MemoryBroker {
    tx: broadcast::Sender<BrokerMessage>,
    buffer_size: usize,
    available: AtomicBool,
}

impl MemoryBroker {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            tx: broadcast::channel(buffer_size).0,
            buffer_size,
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: publishes fail until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker disabled".to_owned()));
        }

        // no subscribers is not an error
        let _ = self.tx.send(BrokerMessage {
            topic: topic.to_owned(),
            payload,
        });
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        let mut rx = self.tx.subscribe();
        let (out_tx, out_rx) = mpsc::channel(self.buffer_size);
        let pattern = pattern.to_owned();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = out_tx.closed() => break,
                    message = rx.recv() => message,
                };

                match message {
                    Ok(message) => {
                        if topic_matches(&pattern, &message.topic) && out_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%pattern, skipped, "broker subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(out_rx)
    }
}
