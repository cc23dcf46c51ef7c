//! One live duplex connection.
//!
//! A session runs two loops over its split socket. The outbound loop drains
//! a bounded queue and sends a ping every `ping_period`; the inbound loop
//! decodes frames and pushes its read deadline forward on every frame it
//! receives, pongs included. Either loop ending cancels the other, and the
//! session then unregisters itself from the hub.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::ws::{Message, WebSocket},
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::Instant,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    AppState, ChatError,
    db::{PresenceStatus, SessionId, UserId, WorkspaceId},
    hub::Scope,
    protocol::{ClientFrame, Payload, ServerEvent},
};

/// The hub's reference to a session: identity plus the sending side of its
/// outbound queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub user_id: UserId,
    pub workspace_id: WorkspaceId,
    pub scope: Scope,
    tx: mpsc::Sender<Payload>,
    closed: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        user_id: UserId,
        workspace_id: WorkspaceId,
        scope: Scope,
        queue: usize,
    ) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(queue);
        let handle = Self {
            id: Uuid::now_v7(),
            user_id,
            workspace_id,
            scope,
            tx,
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn try_send(&self, payload: Payload) -> Result<(), TrySendError<Payload>> {
        if self.closed.is_cancelled() {
            return Err(TrySendError::Closed(payload));
        }
        self.tx.try_send(payload)
    }

    /// Queues an event for this session only.
    pub fn send_event(&self, event: &ServerEvent) -> bool {
        let payload = match event.to_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "failed to encode event");
                return false;
            }
        };
        match self.try_send(payload) {
            Ok(()) => true,
            Err(_) => {
                debug!(session_id = %self.id, "dropping direct event for unavailable session");
                false
            }
        }
    }

    /// Closes the queue. Both loops observe this on their next wait.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

/// What the upgrade checks established about a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionGrant {
    pub user_id: UserId,
    pub workspace_id: WorkspaceId,
    pub scope: Scope,
}

pub async fn serve(socket: WebSocket, state: AppState, grant: SessionGrant) {
    let (sink, stream) = socket.split();
    run(sink, stream, state, grant).await;
}

async fn run<S, R>(sink: S, stream: R, state: AppState, grant: SessionGrant)
where
    S: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let (session, outbound) = SessionHandle::new(
        grant.user_id,
        grant.workspace_id,
        grant.scope,
        state.config.outbound_queue,
    );
    state.hub.register(&session).await;
    info!(
        session_id = %session.id,
        user_id = %session.user_id,
        scope = ?session.scope,
        "session opened"
    );

    if let Scope::Presence(workspace_id) = session.scope {
        let online = state.presence_view.snapshot(workspace_id);
        let online_count = online.len();
        for user_id in online {
            session.send_event(&ServerEvent::UserStatus {
                user_id,
                workspace_id,
                status: PresenceStatus::Online,
                online_count,
            });
        }
    }

    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        session.closed.clone(),
        state.config.ping_period(),
    ));
    read_loop(stream, &state, &session, state.config.pong_wait).await;

    session.close();
    let _ = writer.await;
    state.hub.unregister(&session).await;
    info!(session_id = %session.id, user_id = %session.user_id, "session closed");
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Payload>,
    closed: CancellationToken,
    ping_period: Duration,
) where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let mut ping = tokio::time::interval_at(Instant::now() + ping_period, ping_period);

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            payload = outbound.recv() => {
                let Some(payload) = payload else { break };
                if let Err(err) = sink.send(Message::Text(payload)).await {
                    debug!(error = %err, "write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(err) = sink.send(Message::Ping(Bytes::new())).await {
                    debug!(error = %err, "ping failed");
                    break;
                }
            }
        }
    }

    closed.cancel();
    let _ = sink.send(Message::Close(None)).await;
}

async fn read_loop<R>(
    mut stream: R,
    state: &AppState,
    session: &SessionHandle,
    pong_wait: Duration,
) where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let next = tokio::select! {
            _ = session.closed() => break,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };
        let message = match next {
            Err(_) => {
                info!(session_id = %session.id, "read deadline elapsed");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(session_id = %session.id, error = %err, "read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };
        deadline = Instant::now() + pong_wait;

        match message {
            Message::Text(text) => dispatch(state, session, text.as_str().as_bytes()).await,
            Message::Binary(data) => dispatch(state, session, &data).await,
            // pings are answered by the socket itself
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => {
                debug!(session_id = %session.id, ?frame, "client closed");
                break;
            }
        }
    }
}

async fn dispatch(state: &AppState, session: &SessionHandle, raw: &[u8]) {
    let frame = match serde_json::from_slice::<ClientFrame>(raw) {
        Ok(frame) => frame,
        Err(err) => {
            state.metrics.frame_rejected();
            debug!(session_id = %session.id, error = %err, "undecodable frame");
            session.send_event(&ServerEvent::error("INVALID_FRAME", err.to_string()));
            return;
        }
    };

    if let Err(err) = handle_frame(state, session, frame).await {
        state.metrics.frame_rejected();
        match &err {
            ChatError::Storage(_) | ChatError::Auth(_) => {
                warn!(session_id = %session.id, error = %err, "frame failed")
            }
            _ => debug!(session_id = %session.id, error = %err, "frame rejected"),
        }
        session.send_event(&ServerEvent::error(err.code(), err.client_message()));
    }
}

async fn handle_frame(
    state: &AppState,
    session: &SessionHandle,
    frame: ClientFrame,
) -> Result<(), ChatError> {
    let user_id = session.user_id;

    match (session.scope, frame) {
        (Scope::Room(room_id), ClientFrame::Message(draft)) => {
            state.ingest.send(user_id, room_id, draft).await?;
        }
        (Scope::Room(room_id), ClientFrame::TypingStart) => {
            state
                .publisher
                .publish_room(room_id, &ServerEvent::UserTyping { user_id, room_id })
                .await;
        }
        (Scope::Room(room_id), ClientFrame::TypingStop) => {
            state
                .publisher
                .publish_room(room_id, &ServerEvent::UserTypingStop { user_id, room_id })
                .await;
        }
        (Scope::Room(room_id), ClientFrame::ReadMessage { message_id }) => {
            state.rooms.mark_read(user_id, room_id, &message_id).await?;
        }
        (Scope::Room(_), ClientFrame::Heartbeat) => {
            return Err(ChatError::Unsupported(
                "heartbeat is only accepted on presence sessions".to_owned(),
            ));
        }
        (Scope::Presence(workspace_id), ClientFrame::Heartbeat) => {
            state.presence().heartbeat(user_id, workspace_id, session.id).await;
            session.send_event(&ServerEvent::Pong);
        }
        (Scope::Presence(_), _) => {
            return Err(ChatError::Unsupported(
                "presence sessions only accept heartbeat".to_owned(),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::{sink, stream};

    use super::*;
    use crate::{auth::StaticAuth, bridge::MemoryBroker, config::Config, repo::SqliteRepository};

    async fn state() -> AppState {
        let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
        let auth = Arc::new(StaticAuth::new());
        AppState::new(Config::default(), repo, auth.clone(), auth, Arc::new(MemoryBroker::new(64)))
    }

    #[tokio::test]
    async fn write_failure_tears_the_session_down() {
        let state = state().await;
        let (user, workspace) = (Uuid::now_v7(), Uuid::now_v7());
        let grant = SessionGrant {
            user_id: user,
            workspace_id: workspace,
            scope: Scope::Room(Uuid::now_v7()),
        };

        let broken = Box::pin(sink::unfold((), |(), _: Message| async {
            Err::<(), axum::Error>(axum::Error::new(std::io::Error::other("connection reset")))
        }));
        let silent = stream::pending::<Result<Message, axum::Error>>();
        let session = tokio::spawn(run(broken, silent, state.clone(), grant));

        for _ in 0..200 {
            if state.hub.user_sessions(user).len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.presence().is_online(user, workspace));

        assert_eq!(state.hub.send_to_user(user, Payload::from("{}")), 1);
        tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .expect("session outlived its socket")
            .unwrap();

        assert_eq!(state.hub.session_count(), 0);
        assert!(!state.presence().is_online(user, workspace));
    }
}
