//! Persistence boundary for rooms, participants, messages and presence.
//!
//! The real-time core only talks to storage through [`ChatRepository`].

mod sqlite;

pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::db::{
    ChatRoom, Message, MessageId, Participant, PresenceStatus, RoomId, UserId, WorkspaceId,
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("value out of range: {0}")]
    OutOfRange(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug, Clone)]
pub struct NewRoom {
    pub workspace_id: WorkspaceId,
    pub creator_id: UserId,
    /// Excludes the creator, who is always added first.
    pub participants: Vec<UserId>,
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn create_room(&self, new: NewRoom) -> RepoResult<ChatRoom>;

    /// Soft-deleted rooms are reported as absent.
    async fn find_room(&self, room_id: RoomId) -> RepoResult<Option<ChatRoom>>;

    async fn soft_delete_room(&self, room_id: RoomId) -> RepoResult<()>;

    async fn touch_room(&self, room_id: RoomId, at: OffsetDateTime) -> RepoResult<()>;

    /// Adding an existing participant is a no-op returning the stored record.
    async fn add_participant(&self, room_id: RoomId, user_id: UserId) -> RepoResult<Participant>;

    /// Returns whether a membership was removed.
    async fn remove_participant(&self, room_id: RoomId, user_id: UserId) -> RepoResult<bool>;

    async fn list_participants(&self, room_id: RoomId) -> RepoResult<Vec<Participant>>;

    async fn is_participant(&self, room_id: RoomId, user_id: UserId) -> RepoResult<bool>;

    async fn update_last_read(
        &self,
        room_id: RoomId,
        user_id: UserId,
        at: OffsetDateTime,
    ) -> RepoResult<()>;

    async fn create_message(&self, message: &Message) -> RepoResult<()>;

    /// Soft-deleted messages are reported as absent.
    async fn find_message(&self, message_id: MessageId) -> RepoResult<Option<Message>>;

    async fn soft_delete_message(&self, message_id: MessageId) -> RepoResult<()>;

    /// Newest first, strictly older than `before` when given.
    async fn list_messages(
        &self,
        room_id: RoomId,
        before: Option<OffsetDateTime>,
        limit: u32,
    ) -> RepoResult<Vec<Message>>;

    async fn upsert_presence(
        &self,
        user_id: UserId,
        workspace_id: WorkspaceId,
        status: PresenceStatus,
        at: OffsetDateTime,
    ) -> RepoResult<()>;

    async fn find_presence(
        &self,
        user_id: UserId,
        workspace_id: WorkspaceId,
    ) -> RepoResult<Option<(PresenceStatus, OffsetDateTime)>>;
}
