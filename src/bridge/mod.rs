//! Cross-instance propagation.
//!
//! Every room event and presence change is published to the broker and
//! delivered to local sessions only when it comes back through a
//! subscription. That round trip is the single delivery path, so a client
//! connected to the publishing instance sees each event exactly once.

mod memory;

pub use memory::MemoryBroker;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    db::{RoomId, WorkspaceId},
    hub::{Hub, Scope},
    metrics::Metrics,
    presence::PresenceView,
    protocol::{Payload, PresenceUpdate, ServerEvent},
};

pub const ROOM_PREFIX: &str = "room:";
pub const PRESENCE_PREFIX: &str = "presence:";
pub const ROOM_PATTERN: &str = "room:*";
pub const PRESENCE_PATTERN: &str = "presence:*";

pub fn room_topic(room_id: RoomId) -> String {
    format!("{ROOM_PREFIX}{room_id}")
}

pub fn presence_topic(workspace_id: WorkspaceId) -> String {
    format!("{PRESENCE_PREFIX}{workspace_id}")
}

fn topic_id(prefix: &str, topic: &str) -> Option<Uuid> {
    topic.strip_prefix(prefix).and_then(|id| Uuid::parse_str(id).ok())
}

/// A trailing `*` matches by prefix; anything else must match exactly.
pub(crate) fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("subscription closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: String,
}

pub type Subscription = mpsc::Receiver<BrokerMessage>;

/// Shared publish/subscribe backend.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError>;

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, BrokerError>;
}

/// Outbound half of the bridge. Failures are logged and counted, never
/// returned: by the time anything is published it is already durable.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    metrics: Arc<Metrics>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, metrics: Arc<Metrics>) -> Self {
        Self { broker, metrics }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub async fn publish_room(&self, room_id: RoomId, event: &ServerEvent) -> bool {
        self.publish(room_topic(room_id), event).await
    }

    pub async fn publish_presence(&self, workspace_id: WorkspaceId, update: &PresenceUpdate) -> bool {
        self.publish(presence_topic(workspace_id), update).await
    }

    async fn publish<T: Serialize>(&self, topic: String, event: &T) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(%topic, error = %err, "failed to encode event");
                return false;
            }
        };

        match self.broker.publish(&topic, payload).await {
            Ok(()) => {
                self.metrics.event_published();
                true
            }
            Err(err) => {
                self.metrics.publish_failed();
                warn!(%topic, error = %err, "broker publish failed");
                false
            }
        }
    }
}

/// Inbound half: one long-lived task per topic pattern.
pub struct Bridge {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Subscriptions are in place when this returns.
    pub async fn start(
        broker: Arc<dyn Broker>,
        hub: Arc<Hub>,
        view: Arc<PresenceView>,
    ) -> Result<Self, BrokerError> {
        let rooms = broker.psubscribe(ROOM_PATTERN).await?;
        let presence = broker.psubscribe(PRESENCE_PATTERN).await?;
        let shutdown = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(room_loop(rooms, hub.clone(), shutdown.clone())),
            tokio::spawn(presence_loop(presence, hub, view, shutdown.clone())),
        ];
        info!("pub/sub bridge started");

        Ok(Self { shutdown, tasks })
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("pub/sub bridge stopped");
    }
}

async fn room_loop(mut subscription: Subscription, hub: Arc<Hub>, shutdown: CancellationToken) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = subscription.recv() => message,
        };
        let Some(message) = message else {
            error!("room subscription closed");
            break;
        };
        deliver_room_event(&hub, message);
    }
}

async fn presence_loop(
    mut subscription: Subscription,
    hub: Arc<Hub>,
    view: Arc<PresenceView>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = subscription.recv() => message,
        };
        let Some(message) = message else {
            error!("presence subscription closed");
            break;
        };
        deliver_presence_event(&hub, &view, message);
    }
}

pub(crate) fn deliver_room_event(hub: &Hub, message: BrokerMessage) -> usize {
    let Some(room_id) = topic_id(ROOM_PREFIX, &message.topic) else {
        warn!(topic = %message.topic, "room event on unexpected topic");
        return 0;
    };
    let event = match serde_json::from_str::<ServerEvent>(&message.payload) {
        Ok(event) => event,
        Err(err) => {
            warn!(%room_id, error = %err, "dropping undecodable room event");
            return 0;
        }
    };

    if let ServerEvent::ParticipantRemoved { user_id, room_id: removed_from } = event {
        if removed_from != room_id {
            warn!(%room_id, %removed_from, "removal for another room");
            return 0;
        }
        let closed = hub.disconnect(Scope::Room(room_id), user_id);
        info!(%room_id, %user_id, closed, "closed sessions of removed participant");
    }

    let delivered = hub.broadcast_to_room(room_id, Payload::from(message.payload));
    debug!(%room_id, delivered, "room event fanned out");
    delivered
}

/// Folds an instance's report into the local view. Watchers only hear about
/// cluster-wide changes. Never re-publishes.
pub(crate) fn deliver_presence_event(hub: &Hub, view: &PresenceView, message: BrokerMessage) -> usize {
    let Some(workspace_id) = topic_id(PRESENCE_PREFIX, &message.topic) else {
        warn!(topic = %message.topic, "presence event on unexpected topic");
        return 0;
    };

    let update = match serde_json::from_str::<PresenceUpdate>(&message.payload) {
        Ok(update) if update.workspace_id == workspace_id => update,
        Ok(update) => {
            warn!(%workspace_id, other = %update.workspace_id, "presence report for another workspace");
            return 0;
        }
        Err(err) => {
            warn!(%workspace_id, error = %err, "dropping undecodable presence event");
            return 0;
        }
    };

    let Some(status) = view.apply(&update) else {
        debug!(
            %workspace_id,
            user_id = %update.user_id,
            instance_id = %update.instance_id,
            "presence report left status unchanged"
        );
        return 0;
    };

    let event = ServerEvent::UserStatus {
        user_id: update.user_id,
        workspace_id,
        status,
        online_count: view.online_count(workspace_id),
    };
    match event.to_payload() {
        Ok(payload) => hub.broadcast_presence(workspace_id, payload),
        Err(err) => {
            error!(%workspace_id, error = %err, "failed to encode status");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::PresenceStatus,
        presence::PresenceTracker,
        repo::SqliteRepository,
        session::SessionHandle,
    };

    #[test]
    fn patterns_match_by_prefix() {
        let room = Uuid::now_v7();
        assert!(topic_matches(ROOM_PATTERN, &room_topic(room)));
        assert!(!topic_matches(ROOM_PATTERN, &presence_topic(room)));
        assert!(topic_matches("room:abc", "room:abc"));
        assert!(!topic_matches("room:abc", "room:abcd"));
        assert_eq!(topic_id(ROOM_PREFIX, &room_topic(room)), Some(room));
        assert_eq!(topic_id(ROOM_PREFIX, "room:nope"), None);
    }

    async fn hub_with(broker: Arc<MemoryBroker>) -> Arc<Hub> {
        let metrics = Arc::new(Metrics::default());
        let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
        let publisher = Publisher::new(broker, metrics.clone());
        Arc::new(Hub::new(Arc::new(PresenceTracker::new(repo, publisher)), metrics))
    }

    #[tokio::test]
    async fn room_events_reach_every_instance_once() {
        let broker = Arc::new(MemoryBroker::new(64));
        let (hub_a, hub_b) = (hub_with(broker.clone()).await, hub_with(broker.clone()).await);
        let bridge_a = Bridge::start(broker.clone(), hub_a.clone(), Arc::new(PresenceView::new())).await.unwrap();
        let bridge_b = Bridge::start(broker.clone(), hub_b.clone(), Arc::new(PresenceView::new())).await.unwrap();

        let (ws, room) = (Uuid::now_v7(), Uuid::now_v7());
        let (a, mut rx_a) = SessionHandle::new(Uuid::now_v7(), ws, Scope::Room(room), 8);
        let (b, mut rx_b) = SessionHandle::new(Uuid::now_v7(), ws, Scope::Room(room), 8);
        hub_a.register(&a).await;
        hub_b.register(&b).await;

        let event = ServerEvent::UserTyping { user_id: a.user_id, room_id: room };
        let publisher = Publisher::new(broker.clone(), Arc::new(Metrics::default()));
        assert!(publisher.publish_room(room, &event).await);

        for rx in [&mut rx_a, &mut rx_b] {
            let payload = rx.recv().await.unwrap();
            assert_eq!(serde_json::from_str::<ServerEvent>(payload.as_str()).unwrap(), event);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        bridge_a.shutdown().await;
        bridge_b.shutdown().await;
    }

    fn report(instance_id: Uuid, workspace_id: WorkspaceId, user_id: Uuid, status: PresenceStatus) -> BrokerMessage {
        let update = PresenceUpdate { instance_id, user_id, workspace_id, status, online_count: 1 };
        BrokerMessage { topic: presence_topic(workspace_id), payload: serde_json::to_string(&update).unwrap() }
    }

    #[tokio::test]
    async fn presence_events_update_view_without_republishing() {
        let broker = Arc::new(MemoryBroker::new(64));
        let hub = hub_with(broker.clone()).await;
        let view = PresenceView::new();
        let mut all = broker.psubscribe(PRESENCE_PATTERN).await.unwrap();

        let (ws, user, instance) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        let (watcher, mut rx) = SessionHandle::new(Uuid::now_v7(), ws, Scope::Presence(ws), 8);
        hub.register(&watcher).await;
        // the watcher's own online announcement
        all.recv().await.unwrap();

        assert_eq!(deliver_presence_event(&hub, &view, report(instance, ws, user, PresenceStatus::Online)), 1);
        assert_eq!(view.status(ws, user), PresenceStatus::Online);
        assert_eq!(
            serde_json::from_str::<ServerEvent>(rx.recv().await.unwrap().as_str()).unwrap(),
            ServerEvent::UserStatus { user_id: user, workspace_id: ws, status: PresenceStatus::Online, online_count: 1 }
        );

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(all.try_recv().is_err());
    }

    #[tokio::test]
    async fn watchers_only_hear_cluster_wide_changes() {
        let broker = Arc::new(MemoryBroker::new(64));
        let hub = hub_with(broker).await;
        let view = PresenceView::new();

        let (ws, user) = (Uuid::now_v7(), Uuid::now_v7());
        let (x, y) = (Uuid::now_v7(), Uuid::now_v7());
        let (watcher, mut rx) = SessionHandle::new(Uuid::now_v7(), ws, Scope::Presence(ws), 8);
        hub.register(&watcher).await;

        assert_eq!(deliver_presence_event(&hub, &view, report(x, ws, user, PresenceStatus::Online)), 1);
        assert_eq!(deliver_presence_event(&hub, &view, report(y, ws, user, PresenceStatus::Online)), 0);
        // the user is still connected through x
        assert_eq!(deliver_presence_event(&hub, &view, report(y, ws, user, PresenceStatus::Offline)), 0);
        assert_eq!(view.status(ws, user), PresenceStatus::Online);

        assert_eq!(deliver_presence_event(&hub, &view, report(x, ws, user, PresenceStatus::Offline)), 1);

        let statuses: Vec<_> = [rx.recv().await.unwrap(), rx.recv().await.unwrap()]
            .iter()
            .map(|payload| match serde_json::from_str::<ServerEvent>(payload.as_str()).unwrap() {
                ServerEvent::UserStatus { status, .. } => status,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(statuses, vec![PresenceStatus::Online, PresenceStatus::Offline]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removal_closes_the_participants_room_sessions() {
        let broker = Arc::new(MemoryBroker::new(64));
        let hub = hub_with(broker).await;
        let (ws, room, other_room) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        let (alice, bob) = (Uuid::now_v7(), Uuid::now_v7());

        let (a, mut rx_a) = SessionHandle::new(alice, ws, Scope::Room(room), 8);
        let (b, _rx_b) = SessionHandle::new(bob, ws, Scope::Room(room), 8);
        let (b_elsewhere, mut rx_elsewhere) = SessionHandle::new(bob, ws, Scope::Room(other_room), 8);
        for s in [&a, &b, &b_elsewhere] {
            hub.register(s).await;
        }

        let removed = ServerEvent::ParticipantRemoved { user_id: bob, room_id: room };
        let message = BrokerMessage { topic: room_topic(room), payload: removed.to_json().unwrap() };
        assert_eq!(deliver_room_event(&hub, message), 1);

        assert!(b.is_closed());
        assert_eq!(hub.scope_sessions(Scope::Room(room)), vec![a.id]);
        assert_eq!(hub.user_sessions(bob), vec![b_elsewhere.id]);
        assert!(!b_elsewhere.is_closed());
        assert_eq!(serde_json::from_str::<ServerEvent>(rx_a.recv().await.unwrap().as_str()).unwrap(), removed);
        assert!(rx_elsewhere.try_recv().is_err());

        // later room traffic no longer reaches the removed session
        let typing = ServerEvent::UserTyping { user_id: alice, room_id: room }.to_json().unwrap();
        assert_eq!(deliver_room_event(&hub, BrokerMessage { topic: room_topic(room), payload: typing }), 1);
    }

    #[tokio::test]
    async fn malformed_broker_messages_are_dropped() {
        let broker = Arc::new(MemoryBroker::new(64));
        let hub = hub_with(broker).await;
        let view = PresenceView::new();
        let room = Uuid::now_v7();

        let garbage = BrokerMessage { topic: room_topic(room), payload: "{oops".into() };
        assert_eq!(deliver_room_event(&hub, garbage), 0);

        let wrong_topic = BrokerMessage { topic: "room:not-a-uuid".into(), payload: "{}".into() };
        assert_eq!(deliver_room_event(&hub, wrong_topic), 0);

        let typing = ServerEvent::UserTyping { user_id: room, room_id: room }.to_json().unwrap();
        let wrong_kind = BrokerMessage { topic: presence_topic(room), payload: typing };
        assert_eq!(deliver_presence_event(&hub, &view, wrong_kind), 0);
    }

    #[tokio::test]
    async fn publish_failure_is_reported_not_raised() {
        let broker = Arc::new(MemoryBroker::new(8));
        let metrics = Arc::new(Metrics::default());
        let publisher = Publisher::new(broker.clone(), metrics.clone());
        broker.set_available(false);

        assert!(!publisher.publish_room(Uuid::now_v7(), &ServerEvent::Pong).await);
        assert_eq!(metrics.snapshot().publish_failures, 1);
        assert_eq!(metrics.snapshot().events_published, 0);
    }
}
