//! Unread counts and read state
//!
//! Everything here is computed from the message store on demand; nothing is
//! cached in process.

use std::sync::Arc;
use teamhub_shared::{
    ChatError, ChatId, ChatResult, HistoryCursor, Message, MessageId, MessageRead, MessageStore,
    UnreadSummary, UserId,
};
use time::OffsetDateTime;

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 200;

/// Result of an explicit per-message acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub chat_id: ChatId,
    pub read_at: OffsetDateTime,
    /// False when the receipt already existed
    pub newly_read: bool,
}

#[derive(Clone)]
pub struct ReadStateEngine {
    store: Arc<dyn MessageStore>,
}

impl ReadStateEngine {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Advance the participant's last-read watermark to now.
    ///
    /// Never moves backwards: returns the effective watermark, which is the stored
    /// one if it was already newer.
    pub async fn mark_read(&self, chat_id: ChatId, user_id: UserId) -> ChatResult<OffsetDateTime> {
        let watermark = self
            .store
            .mark_read(chat_id, user_id, OffsetDateTime::now_utc())
            .await?;

        tracing::debug!(chat_id = %chat_id, user_id = %user_id, "Marked chat read");
        Ok(watermark)
    }

    pub async fn unread_count(&self, chat_id: ChatId, user_id: UserId) -> ChatResult<u64> {
        self.store.unread_count(chat_id, user_id).await
    }

    pub async fn unread_summary(&self, user_id: UserId) -> ChatResult<UnreadSummary> {
        let chats = self.store.unread_counts_for_user(user_id).await?;
        Ok(UnreadSummary::from_chats(chats))
    }

    /// Record an explicit "seen" receipt. Idempotent: a repeat reports the
    /// original `read_at`.
    pub async fn acknowledge_message(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> ChatResult<Acknowledgement> {
        let chat_id = self.participant_chat_of(message_id, user_id).await?;
        let recorded = self
            .store
            .acknowledge_message(message_id, user_id, OffsetDateTime::now_utc())
            .await?;

        Ok(Acknowledgement {
            chat_id,
            read_at: recorded.read_at,
            newly_read: recorded.newly_read,
        })
    }

    /// "Seen by" list for a message, visible to participants of its chat
    pub async fn receipts(
        &self,
        message_id: MessageId,
        requester: UserId,
    ) -> ChatResult<Vec<MessageRead>> {
        self.participant_chat_of(message_id, requester).await?;
        self.store.message_reads(message_id).await
    }

    /// Catch-up history, oldest first. `limit` defaults to 50 and is capped at 200.
    pub async fn history(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        before: Option<HistoryCursor>,
        limit: Option<u32>,
    ) -> ChatResult<Vec<Message>> {
        if !self.store.is_active_participant(chat_id, user_id).await? {
            return Err(ChatError::Forbidden);
        }

        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        self.store
            .messages_before(chat_id, before, i64::from(limit))
            .await
    }

    async fn participant_chat_of(&self, message_id: MessageId, user_id: UserId) -> ChatResult<ChatId> {
        let chat_id = self
            .store
            .message_chat_id(message_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;

        if !self.store.is_active_participant(chat_id, user_id).await? {
            return Err(ChatError::Forbidden);
        }
        Ok(chat_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use teamhub_shared::{MemoryMessageStore, MessageType, NewMessage, WorkspaceId};

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

    fn setup() -> (Arc<MemoryMessageStore>, ReadStateEngine, ChatId, UserId, UserId) {
        let store = Arc::new(MemoryMessageStore::new());
        let (alice, bob) = (UserId::new(), UserId::new());
        let chat_id = store.create_chat(WorkspaceId::new(), &[alice, bob]).unwrap();
        let engine = ReadStateEngine::new(store.clone());
        (store, engine, chat_id, alice, bob)
    }

    #[tokio::test]
    async fn test_unread_counts_only_other_senders() {
        let (store, engine, chat_id, alice, bob) = setup();

        store.insert_message(text(chat_id, alice, "one")).await.unwrap();
        store.insert_message(text(chat_id, alice, "two")).await.unwrap();
        store.insert_message(text(chat_id, bob, "mine")).await.unwrap();

        assert_eq!(engine.unread_count(chat_id, bob).await.unwrap(), 2);
        assert_eq!(engine.unread_count(chat_id, alice).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_is_monotonic_and_idempotent() {
        let (store, engine, chat_id, alice, bob) = setup();
        store.insert_message(text(chat_id, alice, "hello")).await.unwrap();

        let first = engine.mark_read(chat_id, bob).await.unwrap();
        assert_eq!(engine.unread_count(chat_id, bob).await.unwrap(), 0);

        let second = engine.mark_read(chat_id, bob).await.unwrap();
        assert!(second >= first);
        assert_eq!(engine.unread_count(chat_id, bob).await.unwrap(), 0);

        // An older watermark written directly never wins
        let stale = first - time::Duration::hours(1);
        let effective = store.mark_read(chat_id, bob, stale).await.unwrap();
        assert_eq!(effective, second);
    }

    #[tokio::test]
    async fn test_messages_after_mark_read_are_unread() {
        let (store, engine, chat_id, alice, bob) = setup();
        store.insert_message(text(chat_id, alice, "before")).await.unwrap();
        engine.mark_read(chat_id, bob).await.unwrap();

        store.insert_message(text(chat_id, alice, "after")).await.unwrap();

        assert_eq!(engine.unread_count(chat_id, bob).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unread_summary_totals_every_chat() {
        let (store, engine, chat_id, alice, bob) = setup();
        let other_chat = store.create_chat(WorkspaceId::new(), &[alice, bob]).unwrap();

        store.insert_message(text(chat_id, alice, "a")).await.unwrap();
        store.insert_message(text(other_chat, alice, "b")).await.unwrap();
        store.insert_message(text(other_chat, alice, "c")).await.unwrap();

        let summary = engine.unread_summary(bob).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.chats.len(), 2);
    }

    #[tokio::test]
    async fn test_mark_read_for_non_participant_is_not_found() {
        let (_store, engine, chat_id, _alice, _bob) = setup();

        let result = engine.mark_read(chat_id, UserId::new()).await;
        assert!(matches!(result, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let (store, engine, chat_id, alice, bob) = setup();
        let message = store.insert_message(text(chat_id, alice, "seen?")).await.unwrap();

        let first = engine.acknowledge_message(message.id, bob).await.unwrap();
        let second = engine.acknowledge_message(message.id, bob).await.unwrap();

        assert_eq!(first.chat_id, chat_id);
        assert!(first.newly_read);
        assert!(!second.newly_read);
        assert_eq!(second.read_at, first.read_at);

        let receipts = engine.receipts(message.id, alice).await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].user_id, bob);
    }

    #[tokio::test]
    async fn test_acknowledge_checks_participation() {
        let (store, engine, chat_id, alice, _bob) = setup();
        let message = store.insert_message(text(chat_id, alice, "private")).await.unwrap();

        assert!(matches!(
            engine.acknowledge_message(message.id, UserId::new()).await,
            Err(ChatError::Forbidden)
        ));
        assert!(matches!(
            engine.acknowledge_message(MessageId::new(), alice).await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_clamps_limit_and_requires_participation() {
        let (store, engine, chat_id, alice, bob) = setup();
        for i in 0..3 {
            store.insert_message(text(chat_id, alice, &i.to_string())).await.unwrap();
        }

        let all = engine.history(chat_id, bob, None, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].content, "0");

        let one = engine.history(chat_id, bob, None, Some(0)).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].content, "2");

        assert!(matches!(
            engine.history(chat_id, UserId::new(), None, None).await,
            Err(ChatError::Forbidden)
        ));

        let older = engine
            .history(chat_id, bob, Some(HistoryCursor::before(&all[2])), None)
            .await
            .unwrap();
        assert_eq!(older.len(), 2);
    }
}
