//! In-memory [`MessageStore`] for tests and single-node development

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use time::{Duration, OffsetDateTime};

use crate::error::{ChatError, ChatResult};
use crate::store::MessageStore;
use crate::types::{
    Chat, ChatId, ChatParticipant, ChatType, ChatUnread, HistoryCursor, Message, MessageId,
    MessageRead, NewMessage, RecordedRead, UserId, WorkspaceId,
};

#[derive(Default)]
struct MemoryState {
    chats: HashMap<ChatId, Chat>,
    participants: Vec<ChatParticipant>,
    messages: Vec<Message>,
    reads: Vec<MessageRead>,
    last_stamp: Option<OffsetDateTime>,
    fail_writes: bool,
}

impl MemoryState {
    /// Strictly increasing timestamps so ordering never depends on clock resolution
    fn stamp(&mut self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn active_participant(&mut self, chat_id: ChatId, user_id: UserId) -> Option<&mut ChatParticipant> {
        self.participants
            .iter_mut()
            .find(|p| p.chat_id == chat_id && p.user_id == user_id && p.is_active)
    }

    fn unread_for(&self, participant: &ChatParticipant) -> u64 {
        self.messages
            .iter()
            .filter(|m| {
                m.chat_id == participant.chat_id
                    && m.sender_id != participant.user_id
                    && m.deleted_at.is_none()
                    && participant.last_read_at.map_or(true, |read| m.created_at > read)
            })
            .count() as u64
    }
}

/// Process-local message store with the same semantics as the Postgres one
#[derive(Default)]
pub struct MemoryMessageStore {
    state: Mutex<MemoryState>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> ChatResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| ChatError::Persistence(format!("store lock poisoned: {e}")))
    }

    /// Create a group chat in `workspace_id` with the given active participants
    pub fn create_chat(&self, workspace_id: WorkspaceId, members: &[UserId]) -> ChatResult<ChatId> {
        let mut state = self.lock()?;
        let now = state.stamp();
        let chat_id = ChatId::new();
        let created_by = members.first().copied().unwrap_or_default();

        state.chats.insert(
            chat_id,
            Chat {
                id: chat_id,
                workspace_id,
                project_id: None,
                chat_type: ChatType::Group,
                name: None,
                created_by,
                created_at: now,
                updated_at: now,
            },
        );
        for user_id in members {
            state.participants.push(ChatParticipant {
                chat_id,
                user_id: *user_id,
                is_active: true,
                joined_at: now,
                last_read_at: None,
            });
        }

        Ok(chat_id)
    }

    /// Deactivate a participant row (user left or was removed)
    pub fn remove_participant(&self, chat_id: ChatId, user_id: UserId) -> ChatResult<()> {
        let mut state = self.lock()?;
        if let Some(participant) = state.active_participant(chat_id, user_id) {
            participant.is_active = false;
        }
        Ok(())
    }

    /// Make every subsequent write fail with a persistence error
    pub fn fail_writes(&self, fail: bool) -> ChatResult<()> {
        self.lock()?.fail_writes = fail;
        Ok(())
    }

    /// Soft-delete a message
    pub fn delete_message(&self, message_id: MessageId) -> ChatResult<()> {
        let mut state = self.lock()?;
        let now = state.stamp();
        if let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) {
            message.deleted_at = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn chat(&self, chat_id: ChatId) -> ChatResult<Option<Chat>> {
        Ok(self.lock()?.chats.get(&chat_id).cloned())
    }

    async fn is_active_participant(&self, chat_id: ChatId, user_id: UserId) -> ChatResult<bool> {
        Ok(self.lock()?.active_participant(chat_id, user_id).is_some())
    }

    async fn insert_message(&self, new_message: NewMessage) -> ChatResult<Message> {
        let mut state = self.lock()?;
        if state.fail_writes {
            return Err(ChatError::Persistence("writes disabled".to_string()));
        }

        let now = state.stamp();
        let message = new_message.into_message(now);
        let chat = state
            .chats
            .get_mut(&message.chat_id)
            .ok_or_else(|| ChatError::NotFound(format!("chat {}", message.chat_id)))?;
        chat.updated_at = now;
        state.messages.push(message.clone());

        Ok(message)
    }

    async fn messages_before(
        &self,
        chat_id: ChatId,
        before: Option<HistoryCursor>,
        limit: i64,
    ) -> ChatResult<Vec<Message>> {
        let state = self.lock()?;
        let mut rows: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| {
                m.chat_id == chat_id
                    && m.deleted_at.is_none()
                    && before.map_or(true, |cursor| cursor.admits(m))
            })
            .cloned()
            .collect();

        rows.sort_by_key(|m| (m.created_at, m.id));
        let skip = rows.len().saturating_sub(limit.max(0) as usize);
        Ok(rows.split_off(skip))
    }

    async fn mark_read(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        at: OffsetDateTime,
    ) -> ChatResult<OffsetDateTime> {
        let mut state = self.lock()?;
        if state.fail_writes {
            return Err(ChatError::Persistence("writes disabled".to_string()));
        }
        if state.last_stamp.map_or(true, |last| at > last) {
            state.last_stamp = Some(at);
        }

        let participant = state
            .active_participant(chat_id, user_id)
            .ok_or_else(|| ChatError::NotFound(format!("participant {user_id} in chat {chat_id}")))?;

        let watermark = match participant.last_read_at {
            Some(current) if current >= at => current,
            _ => at,
        };
        participant.last_read_at = Some(watermark);

        Ok(watermark)
    }

    async fn unread_count(&self, chat_id: ChatId, user_id: UserId) -> ChatResult<u64> {
        let state = self.lock()?;
        let participant = state
            .participants
            .iter()
            .find(|p| p.chat_id == chat_id && p.user_id == user_id && p.is_active)
            .ok_or_else(|| ChatError::NotFound(format!("participant {user_id} in chat {chat_id}")))?;

        Ok(state.unread_for(participant))
    }

    async fn unread_counts_for_user(&self, user_id: UserId) -> ChatResult<Vec<ChatUnread>> {
        let state = self.lock()?;
        let mut chats: Vec<ChatUnread> = state
            .participants
            .iter()
            .filter(|p| p.user_id == user_id && p.is_active)
            .map(|p| ChatUnread {
                chat_id: p.chat_id,
                unread_count: state.unread_for(p),
            })
            .collect();

        chats.sort_by_key(|c| c.chat_id);
        Ok(chats)
    }

    async fn message_chat_id(&self, message_id: MessageId) -> ChatResult<Option<ChatId>> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .find(|m| m.id == message_id && m.deleted_at.is_none())
            .map(|m| m.chat_id))
    }

    async fn acknowledge_message(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: OffsetDateTime,
    ) -> ChatResult<RecordedRead> {
        let mut state = self.lock()?;
        if let Some(existing) = state
            .reads
            .iter()
            .find(|r| r.message_id == message_id && r.user_id == user_id)
        {
            return Ok(RecordedRead {
                read_at: existing.read_at,
                newly_read: false,
            });
        }

        state.reads.push(MessageRead {
            message_id,
            user_id,
            read_at: at,
        });
        Ok(RecordedRead {
            read_at: at,
            newly_read: true,
        })
    }

    async fn message_reads(&self, message_id: MessageId) -> ChatResult<Vec<MessageRead>> {
        let state = self.lock()?;
        let mut reads: Vec<MessageRead> = state
            .reads
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect();

        reads.sort_by_key(|r| r.read_at);
        Ok(reads)
    }

    async fn ping(&self) -> ChatResult<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::MessageType;

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
    async fn test_insert_bumps_chat_updated_at() {
        let store = MemoryMessageStore::new();
        let alice = UserId::new();
        let chat_id = store.create_chat(WorkspaceId::new(), &[alice]).unwrap();
        let before = store.chat(chat_id).await.unwrap().unwrap().updated_at;

        let message = store.insert_message(text(chat_id, alice, "hi")).await.unwrap();

        let chat = store.chat(chat_id).await.unwrap().unwrap();
        assert!(chat.updated_at > before);
        assert_eq!(chat.updated_at, message.created_at);
    }

    #[tokio::test]
    async fn test_deleted_messages_are_not_unread() {
        let store = MemoryMessageStore::new();
        let (alice, bob) = (UserId::new(), UserId::new());
        let chat_id = store.create_chat(WorkspaceId::new(), &[alice, bob]).unwrap();

        let message = store.insert_message(text(chat_id, alice, "oops")).await.unwrap();
        assert_eq!(store.unread_count(chat_id, bob).await.unwrap(), 1);

        store.delete_message(message.id).unwrap();
        assert_eq!(store.unread_count(chat_id, bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_history_respects_limit_and_cursor() {
        let store = MemoryMessageStore::new();
        let alice = UserId::new();
        let chat_id = store.create_chat(WorkspaceId::new(), &[alice]).unwrap();

        let mut sent = Vec::new();
        for i in 0..5 {
            sent.push(store.insert_message(text(chat_id, alice, &i.to_string())).await.unwrap());
        }

        let newest = store.messages_before(chat_id, None, 2).await.unwrap();
        assert_eq!(newest.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec!["3", "4"]);

        let older = store
            .messages_before(chat_id, Some(HistoryCursor::before(&sent[3])), 10)
            .await
            .unwrap();
        assert_eq!(older.len(), 3);
        assert_eq!(older[0].content, "0");
    }

    #[tokio::test]
    async fn test_history_pages_through_equal_timestamps() {
        let store = MemoryMessageStore::new();
        let alice = UserId::new();
        let chat_id = store.create_chat(WorkspaceId::new(), &[alice]).unwrap();

        // Same created_at for every message, as a coarse clock would produce
        let at = OffsetDateTime::now_utc();
        {
            let mut state = store.lock().unwrap();
            for i in 0..5 {
                let message = text(chat_id, alice, &i.to_string()).into_message(at);
                state.messages.push(message);
            }
        }

        let mut pages = Vec::new();
        let mut cursor = None;
        loop {
            let page = store.messages_before(chat_id, cursor, 2).await.unwrap();
            let Some(oldest) = page.first() else { break };
            cursor = Some(HistoryCursor::before(oldest));
            pages.push(page);
        }

        let mut ids: Vec<MessageId> = pages.iter().flatten().map(|m| m.id).collect();
        assert_eq!(ids.len(), 5);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);

        // A timestamp-only cursor skips everything sharing that instant
        let legacy = HistoryCursor {
            created_at: at,
            message_id: None,
        };
        assert!(store.messages_before(chat_id, Some(legacy), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_acknowledgement_keeps_first_read_at() {
        let store = MemoryMessageStore::new();
        let (alice, bob) = (UserId::new(), UserId::new());
        let chat_id = store.create_chat(WorkspaceId::new(), &[alice, bob]).unwrap();
        let message = store.insert_message(text(chat_id, alice, "hi")).await.unwrap();

        let first_at = OffsetDateTime::now_utc();
        let first = store.acknowledge_message(message.id, bob, first_at).await.unwrap();
        assert!(first.newly_read);
        assert_eq!(first.read_at, first_at);

        let repeat = store
            .acknowledge_message(message.id, bob, first_at + Duration::minutes(3))
            .await
            .unwrap();
        assert!(!repeat.newly_read);
        assert_eq!(repeat.read_at, first_at);
    }

    #[tokio::test]
    async fn test_removed_participant_is_inactive() {
        let store = MemoryMessageStore::new();
        let alice = UserId::new();
        let chat_id = store.create_chat(WorkspaceId::new(), &[alice]).unwrap();

        assert!(store.is_active_participant(chat_id, alice).await.unwrap());
        store.remove_participant(chat_id, alice).unwrap();
        assert!(!store.is_active_participant(chat_id, alice).await.unwrap());
        assert!(store.unread_count(chat_id, alice).await.is_err());
    }
}
