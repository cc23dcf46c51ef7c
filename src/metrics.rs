use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-local delivery counters.
#[derive(Debug, Default)]
pub struct Metrics {
    messages_ingested: AtomicU64,
    events_published: AtomicU64,
    publish_failures: AtomicU64,
    events_delivered: AtomicU64,
    consumers_dropped: AtomicU64,
    frames_rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_ingested: u64,
    pub events_published: u64,
    pub publish_failures: u64,
    pub events_delivered: u64,
    pub consumers_dropped: u64,
    pub frames_rejected: u64,
}

impl Metrics {
    pub fn message_ingested(&self) {
        self.messages_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_delivered(&self, count: usize) {
        self.events_delivered.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn consumer_dropped(&self) {
        self.consumers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_ingested: self.messages_ingested.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            consumers_dropped: self.consumers_dropped.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
        }
    }
}
