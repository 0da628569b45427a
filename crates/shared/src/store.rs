//! Message store access
//!
//! The chat CRUD service owns these tables; the real-time layer reads participants,
//! appends messages and maintains read state through the [`MessageStore`] trait.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;

use crate::error::{ChatError, ChatResult};
use crate::types::{
    Chat, ChatId, ChatUnread, HistoryCursor, Message, MessageId, MessageRead, NewMessage,
    RecordedRead, UserId,
};

/// Durable chat state consumed by the real-time layer
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fetch a chat by id
    async fn chat(&self, chat_id: ChatId) -> ChatResult<Option<Chat>>;

    /// Whether `user_id` currently holds an active participant row in `chat_id`
    async fn is_active_participant(&self, chat_id: ChatId, user_id: UserId) -> ChatResult<bool>;

    /// Persist a message and bump the chat's `updated_at` in one unit of work.
    /// Returns the message exactly as stored.
    async fn insert_message(&self, new_message: NewMessage) -> ChatResult<Message>;

    /// Messages before the cursor (or the newest ones), oldest first
    async fn messages_before(
        &self,
        chat_id: ChatId,
        before: Option<HistoryCursor>,
        limit: i64,
    ) -> ChatResult<Vec<Message>>;

    /// Advance the participant's watermark to `at` unless it is already newer.
    /// Returns the effective watermark, or `NotFound` for non-participants.
    async fn mark_read(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        at: OffsetDateTime,
    ) -> ChatResult<OffsetDateTime>;

    /// Messages by other users newer than the participant's watermark
    async fn unread_count(&self, chat_id: ChatId, user_id: UserId) -> ChatResult<u64>;

    /// Unread count for every active chat of the user
    async fn unread_counts_for_user(&self, user_id: UserId) -> ChatResult<Vec<ChatUnread>>;

    /// Chat a message belongs to
    async fn message_chat_id(&self, message_id: MessageId) -> ChatResult<Option<ChatId>>;

    /// Record an explicit receipt. A repeat keeps the first `read_at`.
    async fn acknowledge_message(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: OffsetDateTime,
    ) -> ChatResult<RecordedRead>;

    /// Receipts for a message, oldest first
    async fn message_reads(&self, message_id: MessageId) -> ChatResult<Vec<MessageRead>>;

    /// Cheap connectivity check for readiness checks
    async fn ping(&self) -> ChatResult<()>;
}

// =============================================================================
// PostgreSQL implementation
// =============================================================================

/// [`MessageStore`] backed by the shared PostgreSQL database
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct UnreadRow {
    chat_id: ChatId,
    unread_count: i64,
}

const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, content, message_type, file_url, file_name, file_size, created_at, updated_at, deleted_at";

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn chat(&self, chat_id: ChatId) -> ChatResult<Option<Chat>> {
        let chat = sqlx::query_as::<_, Chat>(
            r#"
            SELECT id, workspace_id, project_id, chat_type, name, created_by, created_at, updated_at
            FROM chats
            WHERE id = $1
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(chat)
    }

    async fn is_active_participant(&self, chat_id: ChatId, user_id: UserId) -> ChatResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
              SELECT 1 FROM chat_participants
              WHERE chat_id = $1 AND user_id = $2 AND is_active
            )
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn insert_message(&self, new_message: NewMessage) -> ChatResult<Message> {
        let message = new_message.into_message(OffsetDateTime::now_utc());
        let mut tx = self.pool.begin().await?;

        let stored = sqlx::query_as::<_, Message>(&format!(
            r#"
            INSERT INTO messages (id, chat_id, sender_id, content, message_type, file_url, file_name, file_size, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(message.id)
        .bind(message.chat_id)
        .bind(message.sender_id)
        .bind(&message.content)
        .bind(message.message_type)
        .bind(&message.file_url)
        .bind(&message.file_name)
        .bind(message.file_size)
        .bind(message.created_at)
        .fetch_one(&mut *tx)
        .await?;

        // Cheap recency signal for chat-list sorting
        sqlx::query("UPDATE chats SET updated_at = $2 WHERE id = $1")
            .bind(stored.chat_id)
            .bind(stored.created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn messages_before(
        &self,
        chat_id: ChatId,
        before: Option<HistoryCursor>,
        limit: i64,
    ) -> ChatResult<Vec<Message>> {
        let mut rows = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE chat_id = $1
              AND deleted_at IS NULL
              AND (
                $2::timestamptz IS NULL
                OR created_at < $2
                OR ($3::uuid IS NOT NULL AND created_at = $2 AND id < $3)
              )
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#
        ))
        .bind(chat_id)
        .bind(before.map(|c| c.created_at))
        .bind(before.and_then(|c| c.message_id))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        Ok(rows)
    }

    async fn mark_read(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        at: OffsetDateTime,
    ) -> ChatResult<OffsetDateTime> {
        let advanced = sqlx::query_scalar::<_, OffsetDateTime>(
            r#"
            UPDATE chat_participants
            SET last_read_at = $3
            WHERE chat_id = $1 AND user_id = $2 AND is_active
              AND (last_read_at IS NULL OR last_read_at < $3)
            RETURNING last_read_at
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(watermark) = advanced {
            return Ok(watermark);
        }

        // Either not a participant, or the stored watermark is already newer
        let current = sqlx::query_scalar::<_, Option<OffsetDateTime>>(
            "SELECT last_read_at FROM chat_participants WHERE chat_id = $1 AND user_id = $2 AND is_active",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match current {
            Some(Some(watermark)) => Ok(watermark),
            Some(None) => Err(ChatError::Persistence(
                "last_read_at was not advanced".to_string(),
            )),
            None => Err(ChatError::NotFound(format!(
                "participant {user_id} in chat {chat_id}"
            ))),
        }
    }

    async fn unread_count(&self, chat_id: ChatId, user_id: UserId) -> ChatResult<u64> {
        let row = sqlx::query_as::<_, UnreadRow>(
            r#"
            SELECT p.chat_id, COUNT(m.id) AS unread_count
            FROM chat_participants p
            LEFT JOIN messages m
              ON m.chat_id = p.chat_id
             AND m.sender_id <> p.user_id
             AND m.deleted_at IS NULL
             AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at)
            WHERE p.chat_id = $1 AND p.user_id = $2 AND p.is_active
            GROUP BY p.chat_id
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("participant {user_id} in chat {chat_id}")))?;

        Ok(row.unread_count.max(0) as u64)
    }

    async fn unread_counts_for_user(&self, user_id: UserId) -> ChatResult<Vec<ChatUnread>> {
        let rows = sqlx::query_as::<_, UnreadRow>(
            r#"
            SELECT p.chat_id, COUNT(m.id) AS unread_count
            FROM chat_participants p
            LEFT JOIN messages m
              ON m.chat_id = p.chat_id
             AND m.sender_id <> p.user_id
             AND m.deleted_at IS NULL
             AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at)
            WHERE p.user_id = $1 AND p.is_active
            GROUP BY p.chat_id
            ORDER BY p.chat_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ChatUnread {
                chat_id: r.chat_id,
                unread_count: r.unread_count.max(0) as u64,
            })
            .collect())
    }

    async fn message_chat_id(&self, message_id: MessageId) -> ChatResult<Option<ChatId>> {
        let chat_id = sqlx::query_scalar::<_, ChatId>(
            "SELECT chat_id FROM messages WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(chat_id)
    }

    async fn acknowledge_message(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: OffsetDateTime,
    ) -> ChatResult<RecordedRead> {
        // The no-op update makes RETURNING yield the stored row on conflict;
        // xmax is 0 only for a freshly inserted tuple
        let recorded = sqlx::query_as::<_, RecordedRead>(
            r#"
            INSERT INTO message_reads (message_id, user_id, read_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (message_id, user_id)
              DO UPDATE SET read_at = message_reads.read_at
            RETURNING read_at, (xmax = 0) AS newly_read
            "#,
        )
        .bind(message_id)
        .bind(user_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(recorded)
    }

    async fn message_reads(&self, message_id: MessageId) -> ChatResult<Vec<MessageRead>> {
        let reads = sqlx::query_as::<_, MessageRead>(
            r#"
            SELECT message_id, user_id, read_at
            FROM message_reads
            WHERE message_id = $1
            ORDER BY read_at ASC
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(reads)
    }

    async fn ping(&self) -> ChatResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{ChatType, MessageType, WorkspaceId};

    async fn setup() -> (PgMessageStore, ChatId, UserId, UserId) {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = crate::db::create_pool(&url, 2).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let chat_id = ChatId::new();
        let alice = UserId::new();
        let bob = UserId::new();

        sqlx::query(
            "INSERT INTO chats (id, workspace_id, chat_type, created_by) VALUES ($1, $2, $3, $4)",
        )
        .bind(chat_id)
        .bind(WorkspaceId::new())
        .bind(ChatType::Dm)
        .bind(alice)
        .execute(&pool)
        .await
        .unwrap();

        for user in [alice, bob] {
            sqlx::query("INSERT INTO chat_participants (chat_id, user_id) VALUES ($1, $2)")
                .bind(chat_id)
                .bind(user)
                .execute(&pool)
                .await
                .unwrap();
        }

        (PgMessageStore::new(pool), chat_id, alice, bob)
    }

    fn text(chat_id: ChatId, sender_id: UserId, content: &str) -> NewMessage {
        NewMessage {
            chat_id,
            sender_id,
            content: content.to_string(),
            message_type: MessageType::Text,
            file_url: None,
            file_name: None,
            file_size: None,
        }
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_unread_follows_watermark() {
        let (store, chat_id, alice, bob) = setup().await;

        store.insert_message(text(chat_id, alice, "hi")).await.unwrap();
        assert_eq!(store.unread_count(chat_id, bob).await.unwrap(), 1);
        assert_eq!(store.unread_count(chat_id, alice).await.unwrap(), 0);

        store.mark_read(chat_id, bob, OffsetDateTime::now_utc()).await.unwrap();
        assert_eq!(store.unread_count(chat_id, bob).await.unwrap(), 0);

        store.insert_message(text(chat_id, alice, "there")).await.unwrap();
        assert_eq!(store.unread_count(chat_id, bob).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_mark_read_never_moves_backward() {
        let (store, chat_id, _alice, bob) = setup().await;
        let now = OffsetDateTime::now_utc();

        let first = store.mark_read(chat_id, bob, now).await.unwrap();
        let stale = store
            .mark_read(chat_id, bob, now - time::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(first, stale);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_acknowledge_is_idempotent() {
        let (store, chat_id, alice, bob) = setup().await;
        let message = store.insert_message(text(chat_id, alice, "hi")).await.unwrap();

        let first_at = OffsetDateTime::now_utc();
        let first = store.acknowledge_message(message.id, bob, first_at).await.unwrap();
        assert!(first.newly_read);

        let repeat = store
            .acknowledge_message(message.id, bob, first_at + time::Duration::minutes(1))
            .await
            .unwrap();
        assert!(!repeat.newly_read);
        assert_eq!(repeat.read_at, first.read_at);
        assert_eq!(store.message_reads(message.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_history_is_oldest_first() {
        let (store, chat_id, alice, _bob) = setup().await;
        let first = store.insert_message(text(chat_id, alice, "one")).await.unwrap();
        let second = store.insert_message(text(chat_id, alice, "two")).await.unwrap();

        let history = store.messages_before(chat_id, None, 50).await.unwrap();
        assert_eq!(history.iter().map(|m| m.id).collect::<Vec<_>>(), vec![first.id, second.id]);

        let older = store
            .messages_before(chat_id, Some(HistoryCursor::before(&second)), 50)
            .await
            .unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].id, first.id);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_history_pages_through_equal_timestamps() {
        let (store, chat_id, alice, _bob) = setup().await;
        for i in 0..4 {
            store.insert_message(text(chat_id, alice, &i.to_string())).await.unwrap();
        }
        sqlx::query("UPDATE messages SET created_at = date_trunc('second', now()) WHERE chat_id = $1")
            .bind(chat_id)
            .execute(&store.pool)
            .await
            .unwrap();

        let newest = store.messages_before(chat_id, None, 2).await.unwrap();
        let older = store
            .messages_before(chat_id, Some(HistoryCursor::before(&newest[0])), 10)
            .await
            .unwrap();

        let mut seen: Vec<MessageId> = older.iter().chain(&newest).map(|m| m.id).collect();
        assert_eq!(seen.len(), 4);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }
}
