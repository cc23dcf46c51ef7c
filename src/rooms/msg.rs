//! Message ingest: membership check, validation, persistence, then exactly
//! one publication. Nothing here writes to the local hub.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    ChatError,
    bridge::Publisher,
    db::{Message, MessageKind, RoomId, UserId},
    metrics::Metrics,
    protocol::{MessageDraft, ServerEvent},
    repo::ChatRepository,
};

pub struct MessageIngest {
    repo: Arc<dyn ChatRepository>,
    publisher: Publisher,
    metrics: Arc<Metrics>,
    max_chars: usize,
}

impl MessageIngest {
    pub fn new(
        repo: Arc<dyn ChatRepository>,
        publisher: Publisher,
        metrics: Arc<Metrics>,
        max_chars: usize,
    ) -> Self {
        Self {
            repo,
            publisher,
            metrics,
            max_chars,
        }
    }

    /// Accepts a client-authored message.
    ///
    /// Membership is checked against storage, not the hub: a participant
    /// without an open session may still post through other surfaces.
    pub async fn send(
        &self,
        sender_id: UserId,
        room_id: RoomId,
        draft: MessageDraft,
    ) -> Result<Message, ChatError> {
        if self.repo.find_room(room_id).await?.is_none() {
            return Err(ChatError::not_found("room not found"));
        }
        if !self.repo.is_participant(room_id, sender_id).await? {
            return Err(ChatError::forbidden("not a participant of this room"));
        }

        let message = self.validate(sender_id, room_id, draft)?;
        self.commit(message).await
    }

    /// Records a membership change in the room's log. The actor is stored as
    /// the author.
    pub async fn post_system(
        &self,
        room_id: RoomId,
        actor_id: UserId,
        content: impl Into<String>,
    ) -> Result<Message, ChatError> {
        let message = Message {
            id: Uuid::now_v7(),
            room_id,
            sender_id: actor_id,
            content: content.into(),
            kind: MessageKind::System,
            file_url: None,
            file_name: None,
            file_size: None,
            created_at: OffsetDateTime::now_utc(),
            deleted: false,
        };
        self.commit(message).await
    }

    fn validate(
        &self,
        sender_id: UserId,
        room_id: RoomId,
        draft: MessageDraft,
    ) -> Result<Message, ChatError> {
        let MessageDraft {
            content,
            message_type,
            file_url,
            file_name,
            file_size,
        } = draft;

        let (content, file_url, file_name, file_size) = match message_type {
            MessageKind::Text => {
                let content = content.trim();
                if content.is_empty() {
                    return Err(ChatError::validation("message content is empty"));
                }
                if content.chars().count() > self.max_chars {
                    return Err(ChatError::validation(format!(
                        "message exceeds {} characters",
                        self.max_chars
                    )));
                }
                (content.to_owned(), None, None, None)
            }
            MessageKind::File => {
                let file_url = file_url.filter(|url| !url.trim().is_empty());
                let file_name = file_name.filter(|name| !name.trim().is_empty());
                let (Some(file_url), Some(file_name)) = (file_url, file_name) else {
                    return Err(ChatError::validation("file messages need fileUrl and fileName"));
                };
                // stored as a signed 64-bit column
                if file_size.is_some_and(|size| i64::try_from(size).is_err()) {
                    return Err(ChatError::validation("fileSize is out of range"));
                }
                (content.trim().to_owned(), Some(file_url), Some(file_name), file_size)
            }
            MessageKind::System => {
                return Err(ChatError::validation("system messages cannot be sent by clients"));
            }
        };

        Ok(Message {
            id: Uuid::now_v7(),
            room_id,
            sender_id,
            content,
            kind: message_type,
            file_url,
            file_name,
            file_size,
            created_at: OffsetDateTime::now_utc(),
            deleted: false,
        })
    }

    async fn commit(&self, message: Message) -> Result<Message, ChatError> {
        self.repo.create_message(&message).await?;

        if let Err(err) = self.repo.touch_room(message.room_id, message.created_at).await {
            warn!(room_id = %message.room_id, error = %err, "failed to touch room");
        }
        self.metrics.message_ingested();
        info!(
            message_id = %message.id,
            room_id = %message.room_id,
            sender_id = %message.sender_id,
            kind = message.kind.as_str(),
            "message ingested"
        );

        // durable by now; a failed publish is recovered by catch-up reads
        let event = ServerEvent::MessageReceived {
            message: message.clone(),
        };
        self.publisher.publish_room(message.room_id, &event).await;

        Ok(message)
    }
}
