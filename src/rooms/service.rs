//! Room lifecycle, membership and history.
//!
//! The chat server's HTTP API calls these operations; that API lives in the
//! embedding application, not in this crate. Sockets reach only
//! [`ChatService::mark_read`] (`READ_MESSAGE`). Removing a participant also
//! closes their open sessions in the room on every instance.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::{
    ChatError,
    auth::WorkspaceAuthorizer,
    bridge::Publisher,
    db::{ChatRoom, Message, MessageId, Participant, RoomId, UserId, WorkspaceId},
    protocol::ServerEvent,
    repo::{ChatRepository, NewRoom},
    rooms::msg::MessageIngest,
};

pub const MAX_HISTORY: u32 = 100;

/// Room lifecycle and membership rules.
pub struct ChatService {
    repo: Arc<dyn ChatRepository>,
    authorizer: Arc<dyn WorkspaceAuthorizer>,
    ingest: Arc<MessageIngest>,
    publisher: Publisher,
}

impl ChatService {
    pub fn new(
        repo: Arc<dyn ChatRepository>,
        authorizer: Arc<dyn WorkspaceAuthorizer>,
        ingest: Arc<MessageIngest>,
        publisher: Publisher,
    ) -> Self {
        Self {
            repo,
            authorizer,
            ingest,
            publisher,
        }
    }

    pub async fn create_room(
        &self,
        creator_id: UserId,
        workspace_id: WorkspaceId,
        participants: Vec<UserId>,
    ) -> Result<ChatRoom, ChatError> {
        if !self.authorizer.is_member(creator_id, workspace_id).await? {
            return Err(ChatError::forbidden("not a member of this workspace"));
        }

        let mut others: Vec<UserId> = Vec::with_capacity(participants.len());
        for user_id in participants {
            if user_id == creator_id || others.contains(&user_id) {
                continue;
            }
            if !self.authorizer.is_member(user_id, workspace_id).await? {
                return Err(ChatError::validation(format!(
                    "user {user_id} is not a member of this workspace"
                )));
            }
            others.push(user_id);
        }

        let room = self
            .repo
            .create_room(NewRoom {
                workspace_id,
                creator_id,
                participants: others,
            })
            .await?;
        info!(room_id = %room.id, %creator_id, %workspace_id, "room created");
        Ok(room)
    }

    /// Any participant may invite another workspace member.
    pub async fn add_participant(
        &self,
        actor_id: UserId,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Participant, ChatError> {
        let room = self.room_for(actor_id, room_id).await?;
        if !self.authorizer.is_member(user_id, room.workspace_id).await? {
            return Err(ChatError::validation(format!(
                "user {user_id} is not a member of this workspace"
            )));
        }

        let already = self.repo.is_participant(room_id, user_id).await?;
        let participant = self.repo.add_participant(room_id, user_id).await?;
        if !already {
            self.ingest
                .post_system(room_id, actor_id, format!("{user_id} joined the room"))
                .await?;
        }
        Ok(participant)
    }

    /// Participants may leave; the creator may remove anyone but themselves.
    pub async fn remove_participant(
        &self,
        actor_id: UserId,
        room_id: RoomId,
        target_id: UserId,
    ) -> Result<(), ChatError> {
        let room = self.find_room(room_id).await?;
        if target_id == room.creator_id {
            return Err(ChatError::forbidden(
                "the creator cannot leave; delete the room instead",
            ));
        }
        if actor_id != target_id && actor_id != room.creator_id {
            return Err(ChatError::forbidden("only the creator can remove others"));
        }

        if !self.repo.remove_participant(room_id, target_id).await? {
            return Err(ChatError::not_found("not a participant of this room"));
        }
        info!(%room_id, user_id = %target_id, %actor_id, "participant removed");
        self.publisher
            .publish_room(room_id, &ServerEvent::ParticipantRemoved { user_id: target_id, room_id })
            .await;

        let note = if actor_id == target_id {
            format!("{target_id} left the room")
        } else {
            format!("{target_id} was removed from the room")
        };
        self.ingest.post_system(room_id, actor_id, note).await?;
        Ok(())
    }

    pub async fn delete_room(&self, actor_id: UserId, room_id: RoomId) -> Result<(), ChatError> {
        let room = self.find_room(room_id).await?;
        if room.creator_id != actor_id {
            return Err(ChatError::forbidden("only the creator can delete the room"));
        }

        self.repo.soft_delete_room(room_id).await?;
        info!(%room_id, "room deleted");
        Ok(())
    }

    pub async fn delete_message(
        &self,
        actor_id: UserId,
        message_id: MessageId,
    ) -> Result<(), ChatError> {
        let message = self
            .repo
            .find_message(message_id)
            .await?
            .ok_or_else(|| ChatError::not_found("message not found"))?;
        if message.sender_id != actor_id {
            return Err(ChatError::forbidden("only the author can delete a message"));
        }

        self.repo.soft_delete_message(message_id).await?;
        Ok(())
    }

    /// Catch-up read, newest first.
    pub async fn history(
        &self,
        actor_id: UserId,
        room_id: RoomId,
        before: Option<OffsetDateTime>,
        limit: u32,
    ) -> Result<Vec<Message>, ChatError> {
        self.room_for(actor_id, room_id).await?;
        let limit = limit.clamp(1, MAX_HISTORY);
        Ok(self.repo.list_messages(room_id, before, limit).await?)
    }

    /// Handles a `READ_MESSAGE` frame from a room session.
    pub async fn mark_read(
        &self,
        user_id: UserId,
        room_id: RoomId,
        raw_message_id: &str,
    ) -> Result<(), ChatError> {
        let message_id = Uuid::parse_str(raw_message_id)
            .map_err(|_| ChatError::InvalidId(raw_message_id.to_owned()))?;
        let message = self
            .repo
            .find_message(message_id)
            .await?
            .filter(|message| message.room_id == room_id)
            .ok_or_else(|| ChatError::not_found("message not found in this room"))?;

        self.repo
            .update_last_read(room_id, user_id, OffsetDateTime::now_utc())
            .await?;

        let event = ServerEvent::MessageRead {
            message_id: message.id,
            user_id,
            room_id,
        };
        self.publisher.publish_room(room_id, &event).await;
        Ok(())
    }

    async fn find_room(&self, room_id: RoomId) -> Result<ChatRoom, ChatError> {
        self.repo
            .find_room(room_id)
            .await?
            .ok_or_else(|| ChatError::not_found("room not found"))
    }

    /// The room, if `actor_id` currently participates in it.
    async fn room_for(&self, actor_id: UserId, room_id: RoomId) -> Result<ChatRoom, ChatError> {
        let room = self.find_room(room_id).await?;
        if !room.participants.contains(&actor_id) {
            return Err(ChatError::forbidden("not a participant of this room"));
        }
        Ok(room)
    }
}
