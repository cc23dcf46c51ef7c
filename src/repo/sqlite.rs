use async_trait::async_trait;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::{
    ChatRoom, Message, MessageId, MessageKind, Participant, PresenceStatus, RoomId, UserId,
    WorkspaceId,
};

use super::{ChatRepository, NewRoom, RepoError, RepoResult};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS rooms (
        uuid TEXT PRIMARY KEY NOT NULL,
        workspace_id TEXT NOT NULL,
        creator_id TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS participants (
        room_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        joined_at TEXT NOT NULL,
        last_read_at TEXT,
        PRIMARY KEY (room_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY NOT NULL,
        room_id TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        content TEXT NOT NULL,
        message_type TEXT NOT NULL,
        file_url TEXT,
        file_name TEXT,
        file_size INTEGER,
        created_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS messages_room_created ON messages (room_id, created_at)",
    "CREATE TABLE IF NOT EXISTS presence (
        user_id TEXT NOT NULL,
        workspace_id TEXT NOT NULL,
        status TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (user_id, workspace_id)
    )",
];

type MessageRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<i64>,
    OffsetDateTime,
    bool,
);

const MESSAGE_COLUMNS: &str =
    "id,room_id,sender_id,content,message_type,file_url,file_name,file_size,created_at,is_deleted";

#[derive(Clone)]
pub struct SqliteRepository {
    db_pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn connect(url: &str) -> RepoResult<Self> {
        let db_pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await?;
        let repo = Self::new(db_pool);
        repo.migrate().await?;
        Ok(repo)
    }

    /// A private in-memory database. One connection that never idles out,
    /// otherwise the database would vanish with it.
    pub async fn in_memory() -> RepoResult<Self> {
        let db_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let repo = Self::new(db_pool);
        repo.migrate().await?;
        Ok(repo)
    }

    pub async fn migrate(&self) -> RepoResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.db_pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db_pool
    }

    async fn participant_ids(&self, room_id: RoomId) -> RepoResult<Vec<UserId>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT user_id FROM participants WHERE room_id=? ORDER BY rowid")
                .bind(room_id.to_string())
                .fetch_all(&self.db_pool)
                .await?;
        rows.iter().map(|(id,)| parse_id(id)).collect()
    }
}

fn parse_id(raw: &str) -> RepoResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| RepoError::Corrupt(format!("bad uuid {raw:?}: {err}")))
}

fn message_from_row(
    (id, room_id, sender_id, content, kind, file_url, file_name, file_size, created_at, deleted): MessageRow,
) -> RepoResult<Message> {
    Ok(Message {
        id: parse_id(&id)?,
        room_id: parse_id(&room_id)?,
        sender_id: parse_id(&sender_id)?,
        content,
        kind: MessageKind::parse(&kind)
            .ok_or_else(|| RepoError::Corrupt(format!("bad message type {kind:?}")))?,
        file_url,
        file_name,
        file_size: file_size.map(|size| size.max(0) as u64),
        created_at,
        deleted,
    })
}

#[async_trait]
impl ChatRepository for SqliteRepository {
    async fn create_room(&self, new: NewRoom) -> RepoResult<ChatRoom> {
        let id = Uuid::now_v7();
        let now = OffsetDateTime::now_utc();

        let mut tx = self.db_pool.begin().await?;
        sqlx::query(
            "INSERT INTO rooms (uuid,workspace_id,creator_id,created_at,updated_at) VALUES (?,?,?,?,?)",
        )
        .bind(id.to_string())
        .bind(new.workspace_id.to_string())
        .bind(new.creator_id.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut participants = vec![new.creator_id];
        for user_id in new.participants {
            if !participants.contains(&user_id) {
                participants.push(user_id);
            }
        }
        for user_id in &participants {
            sqlx::query("INSERT OR IGNORE INTO participants (room_id,user_id,joined_at) VALUES (?,?,?)")
                .bind(id.to_string())
                .bind(user_id.to_string())
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(ChatRoom {
            id,
            workspace_id: new.workspace_id,
            creator_id: new.creator_id,
            participants,
            deleted: false,
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_room(&self, room_id: RoomId) -> RepoResult<Option<ChatRoom>> {
        let row: Option<(String, String, OffsetDateTime, OffsetDateTime)> = sqlx::query_as(
            "SELECT workspace_id,creator_id,created_at,updated_at FROM rooms WHERE uuid=? AND is_deleted=0",
        )
        .bind(room_id.to_string())
        .fetch_optional(&self.db_pool)
        .await?;

        let Some((workspace_id, creator_id, created_at, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(ChatRoom {
            id: room_id,
            workspace_id: parse_id(&workspace_id)?,
            creator_id: parse_id(&creator_id)?,
            participants: self.participant_ids(room_id).await?,
            deleted: false,
            created_at,
            updated_at,
        }))
    }

    async fn soft_delete_room(&self, room_id: RoomId) -> RepoResult<()> {
        sqlx::query("UPDATE rooms SET is_deleted=1, updated_at=? WHERE uuid=?")
            .bind(OffsetDateTime::now_utc())
            .bind(room_id.to_string())
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    async fn touch_room(&self, room_id: RoomId, at: OffsetDateTime) -> RepoResult<()> {
        sqlx::query("UPDATE rooms SET updated_at=? WHERE uuid=?")
            .bind(at)
            .bind(room_id.to_string())
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    async fn add_participant(&self, room_id: RoomId, user_id: UserId) -> RepoResult<Participant> {
        sqlx::query("INSERT OR IGNORE INTO participants (room_id,user_id,joined_at) VALUES (?,?,?)")
            .bind(room_id.to_string())
            .bind(user_id.to_string())
            .bind(OffsetDateTime::now_utc())
            .execute(&self.db_pool)
            .await?;

        let (joined_at, last_read_at): (OffsetDateTime, Option<OffsetDateTime>) = sqlx::query_as(
            "SELECT joined_at,last_read_at FROM participants WHERE room_id=? AND user_id=?",
        )
        .bind(room_id.to_string())
        .bind(user_id.to_string())
        .fetch_one(&self.db_pool)
        .await?;

        Ok(Participant { room_id, user_id, joined_at, last_read_at })
    }

    async fn remove_participant(&self, room_id: RoomId, user_id: UserId) -> RepoResult<bool> {
        let result = sqlx::query("DELETE FROM participants WHERE room_id=? AND user_id=?")
            .bind(room_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.db_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_participants(&self, room_id: RoomId) -> RepoResult<Vec<Participant>> {
        let rows: Vec<(String, OffsetDateTime, Option<OffsetDateTime>)> = sqlx::query_as(
            "SELECT user_id,joined_at,last_read_at FROM participants WHERE room_id=? ORDER BY rowid",
        )
        .bind(room_id.to_string())
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|(user_id, joined_at, last_read_at)| {
                Ok(Participant {
                    room_id,
                    user_id: parse_id(&user_id)?,
                    joined_at,
                    last_read_at,
                })
            })
            .collect()
    }

    async fn is_participant(&self, room_id: RoomId, user_id: UserId) -> RepoResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM participants WHERE room_id=? AND user_id=?")
                .bind(room_id.to_string())
                .bind(user_id.to_string())
                .fetch_optional(&self.db_pool)
                .await?;
        Ok(row.is_some())
    }

    async fn update_last_read(
        &self,
        room_id: RoomId,
        user_id: UserId,
        at: OffsetDateTime,
    ) -> RepoResult<()> {
        sqlx::query("UPDATE participants SET last_read_at=? WHERE room_id=? AND user_id=?")
            .bind(at)
            .bind(room_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    async fn create_message(&self, message: &Message) -> RepoResult<()> {
        let file_size = message
            .file_size
            .map(i64::try_from)
            .transpose()
            .map_err(|_| RepoError::OutOfRange(format!("file size {:?}", message.file_size)))?;

        sqlx::query(
            "INSERT INTO messages (id,room_id,sender_id,content,message_type,file_url,file_name,file_size,created_at) \
             VALUES (?,?,?,?,?,?,?,?,?)",
        )
        .bind(message.id.to_string())
        .bind(message.room_id.to_string())
        .bind(message.sender_id.to_string())
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(&message.file_url)
        .bind(&message.file_name)
        .bind(file_size)
        .bind(message.created_at)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn find_message(&self, message_id: MessageId) -> RepoResult<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id=? AND is_deleted=0"
        ))
        .bind(message_id.to_string())
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(message_from_row).transpose()
    }

    async fn soft_delete_message(&self, message_id: MessageId) -> RepoResult<()> {
        sqlx::query("UPDATE messages SET is_deleted=1 WHERE id=?")
            .bind(message_id.to_string())
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    async fn list_messages(
        &self,
        room_id: RoomId,
        before: Option<OffsetDateTime>,
        limit: u32,
    ) -> RepoResult<Vec<Message>> {
        let rows: Vec<MessageRow> = match before {
            Some(before) => {
                sqlx::query_as(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE room_id=? AND is_deleted=0 AND created_at<? \
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(room_id.to_string())
                .bind(before)
                .bind(limit as i64)
                .fetch_all(&self.db_pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE room_id=? AND is_deleted=0 \
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(room_id.to_string())
                .bind(limit as i64)
                .fetch_all(&self.db_pool)
                .await?
            }
        };

        rows.into_iter().map(message_from_row).collect()
    }

    async fn upsert_presence(
        &self,
        user_id: UserId,
        workspace_id: WorkspaceId,
        status: PresenceStatus,
        at: OffsetDateTime,
    ) -> RepoResult<()> {
        sqlx::query(
            "INSERT INTO presence (user_id,workspace_id,status,updated_at) VALUES (?,?,?,?) \
             ON CONFLICT (user_id,workspace_id) DO UPDATE SET status=excluded.status, updated_at=excluded.updated_at",
        )
        .bind(user_id.to_string())
        .bind(workspace_id.to_string())
        .bind(status.as_str())
        .bind(at)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn find_presence(
        &self,
        user_id: UserId,
        workspace_id: WorkspaceId,
    ) -> RepoResult<Option<(PresenceStatus, OffsetDateTime)>> {
        let row: Option<(String, OffsetDateTime)> = sqlx::query_as(
            "SELECT status,updated_at FROM presence WHERE user_id=? AND workspace_id=?",
        )
        .bind(user_id.to_string())
        .bind(workspace_id.to_string())
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(|(status, at)| {
            PresenceStatus::parse(&status)
                .map(|status| (status, at))
                .ok_or_else(|| RepoError::Corrupt(format!("bad presence status {status:?}")))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message(room_id: RoomId, sender_id: UserId, content: &str) -> Message {
        Message {
            id: Uuid::now_v7(),
            room_id,
            sender_id,
            content: content.to_owned(),
            kind: MessageKind::Text,
            file_url: None,
            file_name: None,
            file_size: None,
            created_at: OffsetDateTime::now_utc(),
            deleted: false,
        }
    }

    #[tokio::test]
    async fn creator_is_first_participant_and_duplicates_collapse() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let creator = Uuid::now_v7();
        let other = Uuid::now_v7();

        let room = repo
            .create_room(NewRoom {
                workspace_id: Uuid::now_v7(),
                creator_id: creator,
                participants: vec![other, creator, other],
            })
            .await
            .unwrap();

        assert_eq!(room.participants, vec![creator, other]);
        let found = repo.find_room(room.id).await.unwrap().unwrap();
        assert_eq!(found.participants, vec![creator, other]);
        assert!(repo.is_participant(room.id, other).await.unwrap());
    }

    #[tokio::test]
    async fn soft_deleted_rows_are_hidden() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let creator = Uuid::now_v7();
        let room = repo
            .create_room(NewRoom {
                workspace_id: Uuid::now_v7(),
                creator_id: creator,
                participants: vec![],
            })
            .await
            .unwrap();

        let message = text_message(room.id, creator, "hi");
        repo.create_message(&message).await.unwrap();
        let stored = repo.find_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "hi");
        assert_eq!(stored.sender_id, creator);

        repo.soft_delete_message(message.id).await.unwrap();
        assert!(repo.find_message(message.id).await.unwrap().is_none());

        repo.soft_delete_room(room.id).await.unwrap();
        assert!(repo.find_room(room.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_sizes_beyond_the_column_are_refused() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let (room, sender) = (Uuid::now_v7(), Uuid::now_v7());

        let mut message = text_message(room, sender, "");
        message.kind = MessageKind::File;
        message.file_size = Some(u64::MAX);
        assert!(matches!(
            repo.create_message(&message).await,
            Err(RepoError::OutOfRange(_))
        ));
        assert!(repo.find_message(message.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn history_is_newest_first_and_pages_backwards() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let creator = Uuid::now_v7();
        let room = repo
            .create_room(NewRoom {
                workspace_id: Uuid::now_v7(),
                creator_id: creator,
                participants: vec![],
            })
            .await
            .unwrap();

        let mut sent = Vec::new();
        for (i, content) in ["one", "two", "three"].into_iter().enumerate() {
            let mut message = text_message(room.id, creator, content);
            message.created_at += time::Duration::seconds(i as i64);
            repo.create_message(&message).await.unwrap();
            sent.push(message);
        }

        let page = repo.list_messages(room.id, None, 2).await.unwrap();
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["three", "two"]);

        let older = repo
            .list_messages(room.id, Some(page[1].created_at), 10)
            .await
            .unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].content, "one");
    }

    #[tokio::test]
    async fn presence_upsert_overwrites() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let (user, workspace) = (Uuid::now_v7(), Uuid::now_v7());
        let now = OffsetDateTime::now_utc();

        repo.upsert_presence(user, workspace, PresenceStatus::Online, now).await.unwrap();
        repo.upsert_presence(user, workspace, PresenceStatus::Offline, now).await.unwrap();

        let (status, _) = repo.find_presence(user, workspace).await.unwrap().unwrap();
        assert_eq!(status, PresenceStatus::Offline);
    }
}
