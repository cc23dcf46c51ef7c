//! Online/offline status derived from live sessions.
//!
//! [`PresenceTracker`] holds the authoritative per-process reference sets and
//! announces this instance's view of each user. [`PresenceView`] folds the
//! announcements of every instance into the cluster-wide status that clients
//! on this instance read from.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    bridge::Publisher,
    db::{PresenceStatus, SessionId, UserId, WorkspaceId},
    protocol::PresenceUpdate,
    repo::ChatRepository,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Online,
    Offline,
    Unchanged,
}

type LiveSessions = HashMap<WorkspaceId, HashMap<UserId, HashSet<SessionId>>>;

/// Last status announced for one user, held while persisting and publishing
/// so announcements leave in the order the live sets changed.
type Gate = Arc<tokio::sync::Mutex<PresenceStatus>>;

pub struct PresenceTracker {
    instance_id: Uuid,
    live: Mutex<LiveSessions>,
    gates: Mutex<HashMap<(WorkspaceId, UserId), Gate>>,
    store: Arc<dyn ChatRepository>,
    publisher: Publisher,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn ChatRepository>, publisher: Publisher) -> Self {
        Self {
            instance_id: Uuid::now_v7(),
            live: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            store,
            publisher,
        }
    }

    /// Identifies this process in presence reports.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Adds a live session. Announces `online` on the first one.
    pub async fn mark_online(
        &self,
        user_id: UserId,
        workspace_id: WorkspaceId,
        session_id: SessionId,
    ) -> Transition {
        let came_online = {
            let mut live = self.live.lock();
            let sessions = live
                .entry(workspace_id)
                .or_default()
                .entry(user_id)
                .or_default();
            let was_empty = sessions.is_empty();
            sessions.insert(session_id) && was_empty
        };

        if !came_online {
            return Transition::Unchanged;
        }
        self.announce(user_id, workspace_id).await;
        Transition::Online
    }

    /// Drops a live session. Announces `offline` when it was the last one.
    /// Unknown sessions are ignored, which makes repeated calls harmless.
    pub async fn mark_offline(
        &self,
        user_id: UserId,
        workspace_id: WorkspaceId,
        session_id: SessionId,
    ) -> Transition {
        let went_offline = {
            let mut live = self.live.lock();
            let Some(users) = live.get_mut(&workspace_id) else {
                return Transition::Unchanged;
            };
            let Some(sessions) = users.get_mut(&user_id) else {
                return Transition::Unchanged;
            };

            let removed = sessions.remove(&session_id);
            let now_empty = sessions.is_empty();
            if now_empty {
                users.remove(&user_id);
                if users.is_empty() {
                    live.remove(&workspace_id);
                }
            }
            removed && now_empty
        };

        if !went_offline {
            return Transition::Unchanged;
        }
        self.announce(user_id, workspace_id).await;
        Transition::Offline
    }

    /// Refreshes the stored `online` status for a session that is already
    /// counted. Never adds a reference.
    pub async fn heartbeat(&self, user_id: UserId, workspace_id: WorkspaceId, session_id: SessionId) {
        if !self.holds(user_id, workspace_id, session_id) {
            debug!(%session_id, %user_id, "heartbeat from unregistered session ignored");
            return;
        }

        let gate = self.gate(workspace_id, user_id);
        {
            let _turn = gate.lock().await;
            // an offline write queued ahead of us must not be overwritten
            if self.holds(user_id, workspace_id, session_id) {
                self.persist(user_id, workspace_id, PresenceStatus::Online).await;
            }
        }
        self.retire_gate(workspace_id, user_id, &gate);
    }

    pub fn is_online(&self, user_id: UserId, workspace_id: WorkspaceId) -> bool {
        self.connection_count(user_id, workspace_id) > 0
    }

    pub fn connection_count(&self, user_id: UserId, workspace_id: WorkspaceId) -> usize {
        self.live
            .lock()
            .get(&workspace_id)
            .and_then(|users| users.get(&user_id))
            .map_or(0, HashSet::len)
    }

    /// Users with at least one live session, recomputed from the live sets.
    pub fn online_count(&self, workspace_id: WorkspaceId) -> usize {
        self.live
            .lock()
            .get(&workspace_id)
            .map_or(0, |users| users.values().filter(|s| !s.is_empty()).count())
    }

    pub fn online_users(&self, workspace_id: WorkspaceId) -> Vec<UserId> {
        self.live
            .lock()
            .get(&workspace_id)
            .map(|users| users.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Sum of live sessions across every workspace.
    pub fn total_connections(&self) -> usize {
        self.live
            .lock()
            .values()
            .flat_map(HashMap::values)
            .map(HashSet::len)
            .sum()
    }

    fn holds(&self, user_id: UserId, workspace_id: WorkspaceId, session_id: SessionId) -> bool {
        self.live
            .lock()
            .get(&workspace_id)
            .and_then(|users| users.get(&user_id))
            .is_some_and(|sessions| sessions.contains(&session_id))
    }

    fn gate(&self, workspace_id: WorkspaceId, user_id: UserId) -> Gate {
        self.gates
            .lock()
            .entry((workspace_id, user_id))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(PresenceStatus::Offline)))
            .clone()
    }

    /// Publishes whatever the live sets say now, not what the caller saw.
    /// Whoever takes the gate last reads the latest state, so the final
    /// stored and published status always matches the live sets.
    async fn announce(&self, user_id: UserId, workspace_id: WorkspaceId) {
        let gate = self.gate(workspace_id, user_id);
        let status = {
            let mut announced = gate.lock().await;
            let (status, online_count) = {
                let live = self.live.lock();
                let users = live.get(&workspace_id);
                let online = users
                    .and_then(|users| users.get(&user_id))
                    .is_some_and(|sessions| !sessions.is_empty());
                let status = if online { PresenceStatus::Online } else { PresenceStatus::Offline };
                (status, users.map_or(0, |users| users.values().filter(|s| !s.is_empty()).count()))
            };

            if *announced != status {
                info!(%user_id, %workspace_id, status = status.as_str(), "presence changed");
                self.persist(user_id, workspace_id, status).await;

                let update = PresenceUpdate {
                    instance_id: self.instance_id,
                    user_id,
                    workspace_id,
                    status,
                    online_count,
                };
                self.publisher.publish_presence(workspace_id, &update).await;
                *announced = status;
            }
            status
        };

        if status == PresenceStatus::Offline {
            self.retire_gate(workspace_id, user_id, &gate);
        }
    }

    /// Drops an idle gate whose user was last announced offline. A fresh
    /// gate starts out offline, so nothing is lost.
    fn retire_gate(&self, workspace_id: WorkspaceId, user_id: UserId, gate: &Gate) {
        let mut gates = self.gates.lock();
        let key = (workspace_id, user_id);
        let idle = gates.get(&key).is_some_and(|current| Arc::ptr_eq(current, gate))
            && Arc::strong_count(gate) == 2
            && gate
                .try_lock()
                .is_ok_and(|announced| *announced == PresenceStatus::Offline);
        if idle {
            gates.remove(&key);
        }
    }

    async fn persist(&self, user_id: UserId, workspace_id: WorkspaceId, status: PresenceStatus) {
        if let Err(err) = self
            .store
            .upsert_presence(user_id, workspace_id, status, OffsetDateTime::now_utc())
            .await
        {
            warn!(%user_id, %workspace_id, error = %err, "failed to persist presence");
        }
    }
}

/// Cluster-wide status assembled from every instance's reports.
///
/// A user is online while at least one instance reports a live session.
#[derive(Default)]
pub struct PresenceView {
    online: RwLock<HashMap<WorkspaceId, HashMap<UserId, HashSet<Uuid>>>>,
}

impl PresenceView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one instance's report. Returns the user's new status when the
    /// cluster-wide status changed.
    pub fn apply(&self, update: &PresenceUpdate) -> Option<PresenceStatus> {
        let mut online = self.online.write();
        match update.status {
            PresenceStatus::Online => {
                let instances = online
                    .entry(update.workspace_id)
                    .or_default()
                    .entry(update.user_id)
                    .or_default();
                let was_offline = instances.is_empty();
                (instances.insert(update.instance_id) && was_offline).then_some(PresenceStatus::Online)
            }
            PresenceStatus::Offline => {
                let users = online.get_mut(&update.workspace_id)?;
                let instances = users.get_mut(&update.user_id)?;
                if !instances.remove(&update.instance_id) || !instances.is_empty() {
                    return None;
                }
                users.remove(&update.user_id);
                if users.is_empty() {
                    online.remove(&update.workspace_id);
                }
                Some(PresenceStatus::Offline)
            }
        }
    }

    pub fn status(&self, workspace_id: WorkspaceId, user_id: UserId) -> PresenceStatus {
        let online = self
            .online
            .read()
            .get(&workspace_id)
            .is_some_and(|users| users.contains_key(&user_id));
        if online {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }

    pub fn snapshot(&self, workspace_id: WorkspaceId) -> Vec<UserId> {
        self.online
            .read()
            .get(&workspace_id)
            .map(|users| users.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn online_count(&self, workspace_id: WorkspaceId) -> usize {
        self.online.read().get(&workspace_id).map_or(0, HashMap::len)
    }
}
