//! JSON frames exchanged over the duplex socket and over the broker.

use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{Message, MessageId, MessageKind, PresenceStatus, RoomId, UserId, WorkspaceId};

/// A serialized `ServerEvent`, cheap to clone across many outbound queues.
pub type Payload = Utf8Bytes;

/// Client -> server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Message(MessageDraft),
    TypingStart,
    TypingStop,
    #[serde(rename_all = "camelCase")]
    ReadMessage {
        message_id: String,
    },
    /// Presence sessions only.
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Server -> client. Also the body of every room-topic publication.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    MessageReceived {
        message: Message,
    },
    UserTyping {
        user_id: UserId,
        room_id: RoomId,
    },
    UserTypingStop {
        user_id: UserId,
        room_id: RoomId,
    },
    MessageRead {
        message_id: MessageId,
        user_id: UserId,
        room_id: RoomId,
    },
    UserStatus {
        user_id: UserId,
        workspace_id: WorkspaceId,
        status: PresenceStatus,
        online_count: usize,
    },
    /// Membership was revoked. The removed user's sessions in the room are
    /// closed before the rest of the room sees this.
    ParticipantRemoved {
        user_id: UserId,
        room_id: RoomId,
    },
    Error {
        code: String,
        message: String,
    },
    #[serde(rename = "pong")]
    Pong,
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_payload(&self) -> serde_json::Result<Payload> {
        self.to_json().map(Payload::from)
    }
}

/// Presence report published by one instance about its own sessions.
///
/// Only travels over the broker. Each instance folds the reports into its
/// view and tells its clients when the cluster-wide status changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub instance_id: Uuid,
    pub user_id: UserId,
    pub workspace_id: WorkspaceId,
    pub status: PresenceStatus,
    /// Users with a live session on the reporting instance.
    pub online_count: usize,
}
