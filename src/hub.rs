//! Process-local directory of live sessions, indexed by scope and by user.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::{
    db::{RoomId, SessionId, UserId, WorkspaceId},
    metrics::Metrics,
    presence::{PresenceTracker, Transition},
    protocol::Payload,
    session::SessionHandle,
};

/// What a session is attached to.
///
/// Presence-only sessions have no room; they are keyed by their workspace
/// so both kinds live in the same registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Room(RoomId),
    Presence(WorkspaceId),
}

#[derive(Default)]
struct Registry {
    by_scope: HashMap<Scope, HashMap<SessionId, SessionHandle>>,
    by_user: HashMap<UserId, HashMap<SessionId, SessionHandle>>,
}

impl Registry {
    fn insert(&mut self, session: &SessionHandle) {
        self.by_scope
            .entry(session.scope)
            .or_default()
            .insert(session.id, session.clone());
        self.by_user
            .entry(session.user_id)
            .or_default()
            .insert(session.id, session.clone());
    }

    /// Removes from both indexes. Returns whether anything was present.
    fn remove(&mut self, session: &SessionHandle) -> bool {
        let mut removed = false;

        if let Some(sessions) = self.by_scope.get_mut(&session.scope) {
            removed |= sessions.remove(&session.id).is_some();
            if sessions.is_empty() {
                self.by_scope.remove(&session.scope);
            }
        }
        if let Some(sessions) = self.by_user.get_mut(&session.user_id) {
            removed |= sessions.remove(&session.id).is_some();
            if sessions.is_empty() {
                self.by_user.remove(&session.user_id);
            }
        }

        removed
    }
}

pub struct Hub {
    registry: RwLock<Registry>,
    presence: Arc<PresenceTracker>,
    metrics: Arc<Metrics>,
}

impl Hub {
    pub fn new(presence: Arc<PresenceTracker>, metrics: Arc<Metrics>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            presence,
            metrics,
        }
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub async fn register(&self, session: &SessionHandle) -> Transition {
        self.registry.write().insert(session);
        debug!(
            session_id = %session.id,
            user_id = %session.user_id,
            scope = ?session.scope,
            "session registered"
        );

        self.presence
            .mark_online(session.user_id, session.workspace_id, session.id)
            .await
    }

    /// Idempotent. The presence tracker decides whether this was the user's
    /// last session in the workspace.
    pub async fn unregister(&self, session: &SessionHandle) -> Transition {
        session.close();
        let removed = self.registry.write().remove(session);
        if removed {
            debug!(
                session_id = %session.id,
                user_id = %session.user_id,
                "session unregistered"
            );
        }

        self.presence
            .mark_offline(session.user_id, session.workspace_id, session.id)
            .await
    }

    pub fn broadcast_to_room(&self, room_id: RoomId, payload: Payload) -> usize {
        self.broadcast(Scope::Room(room_id), payload)
    }

    pub fn broadcast_presence(&self, workspace_id: WorkspaceId, payload: Payload) -> usize {
        self.broadcast(Scope::Presence(workspace_id), payload)
    }

    /// Non-blocking fan-out. A session whose queue is full is closed and
    /// evicted instead of stalling the others. Returns the number of
    /// sessions the payload was queued for.
    pub fn broadcast(&self, scope: Scope, payload: Payload) -> usize {
        let (delivered, dead) = {
            let registry = self.registry.read();
            match registry.by_scope.get(&scope) {
                Some(sessions) => offer(sessions.values(), &payload),
                None => return 0,
            }
        };

        self.finish_delivery(delivered, dead)
    }

    /// Same delivery discipline as [`Hub::broadcast`], across every session
    /// the user holds.
    pub fn send_to_user(&self, user_id: UserId, payload: Payload) -> usize {
        let (delivered, dead) = {
            let registry = self.registry.read();
            match registry.by_user.get(&user_id) {
                Some(sessions) => offer(sessions.values(), &payload),
                None => return 0,
            }
        };

        self.finish_delivery(delivered, dead)
    }

    /// Closes and evicts the user's sessions in one scope. Each session's
    /// own teardown still releases its presence reference.
    pub fn disconnect(&self, scope: Scope, user_id: UserId) -> usize {
        let mut registry = self.registry.write();
        let targets: Vec<SessionHandle> = registry
            .by_scope
            .get(&scope)
            .map(|sessions| {
                sessions
                    .values()
                    .filter(|session| session.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for session in &targets {
            session.close();
            registry.remove(session);
        }
        targets.len()
    }

    fn finish_delivery(&self, delivered: usize, dead: Vec<SessionHandle>) -> usize {
        self.metrics.events_delivered(delivered);
        if !dead.is_empty() {
            let mut registry = self.registry.write();
            for session in &dead {
                registry.remove(session);
                self.metrics.consumer_dropped();
            }
        }
        delivered
    }

    pub fn session_count(&self) -> usize {
        self.registry.read().by_user.values().map(HashMap::len).sum()
    }

    pub fn scope_sessions(&self, scope: Scope) -> Vec<SessionId> {
        self.registry
            .read()
            .by_scope
            .get(&scope)
            .map(|sessions| sessions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn user_sessions(&self, user_id: UserId) -> Vec<SessionId> {
        self.registry
            .read()
            .by_user
            .get(&user_id)
            .map(|sessions| sessions.keys().copied().collect())
            .unwrap_or_default()
    }
}

fn offer<'a>(
    sessions: impl Iterator<Item = &'a SessionHandle>,
    payload: &Payload,
) -> (usize, Vec<SessionHandle>) {
    let mut delivered = 0;
    let mut dead = Vec::new();

    for session in sessions {
        match session.try_send(payload.clone()) {
            Ok(()) => delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!(
                    session_id = %session.id,
                    user_id = %session.user_id,
                    "outbound queue full, dropping consumer"
                );
                session.close();
                dead.push(session.clone());
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %session.id, "outbound queue closed");
                session.close();
                dead.push(session.clone());
            }
        }
    }

    (delivered, dead)
}
