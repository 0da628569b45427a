//! Common types used across the TeamHub real-time services

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// Chat ID wrapper
    ChatId
);
id_type!(
    /// User ID wrapper
    UserId
);
id_type!(
    /// Workspace ID wrapper
    WorkspaceId
);
id_type!(
    /// Message ID wrapper
    MessageId
);
id_type!(
    /// WebSocket session ID wrapper (one per socket, not persisted)
    SessionId
);

// =============================================================================
// Enums
// =============================================================================

/// Kind of chat container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatType {
    Dm,
    Group,
    Project,
}

/// Content kind of a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

/// Presence status of a user within a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl FromStr for PresenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "online" => Ok(PresenceStatus::Online),
            "away" => Ok(PresenceStatus::Away),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(format!("unknown presence status: {other}")),
        }
    }
}

// =============================================================================
// Chat Types
// =============================================================================

/// A container for messages among a fixed set of participants
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub workspace_id: WorkspaceId,
    pub project_id: Option<Uuid>,
    pub chat_type: ChatType,
    pub name: Option<String>,
    pub created_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Membership of a user in a chat.
///
/// At most one active row exists per (chat, user); `last_read_at` only moves forward.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ChatParticipant {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_read_at: Option<OffsetDateTime>,
}

/// A persisted chat message. Immutable except for `deleted_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub deleted_at: Option<OffsetDateTime>,
}

/// Input for persisting a new message
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
}

impl NewMessage {
    /// Build the record that will be stored, stamped with `now`
    pub fn into_message(self, now: OffsetDateTime) -> Message {
        Message {
            id: MessageId::new(),
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            content: self.content,
            message_type: self.message_type,
            file_url: self.file_url,
            file_name: self.file_name,
            file_size: self.file_size,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Explicit per-message read receipt ("seen by")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MessageRead {
    pub message_id: MessageId,
    pub user_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: OffsetDateTime,
}

/// Outcome of recording a receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct RecordedRead {
    /// Time of the first acknowledgement, also on repeats
    pub read_at: OffsetDateTime,
    /// False when the receipt already existed
    pub newly_read: bool,
}

/// Keyset position for paging history backwards.
///
/// Ordering is `(created_at, id)`, so messages sharing a timestamp are neither
/// skipped nor repeated across pages. Without an id only strictly older
/// messages are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryCursor {
    pub created_at: OffsetDateTime,
    pub message_id: Option<MessageId>,
}

impl HistoryCursor {
    /// Cursor pointing just before `message`
    pub fn before(message: &Message) -> Self {
        Self {
            created_at: message.created_at,
            message_id: Some(message.id),
        }
    }

    /// Whether `message` sorts strictly before this position
    pub fn admits(&self, message: &Message) -> bool {
        match self.message_id {
            Some(id) => (message.created_at, message.id) < (self.created_at, id),
            None => message.created_at < self.created_at,
        }
    }
}

// =============================================================================
// Read-State Types
// =============================================================================

/// Unread count for one chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUnread {
    pub chat_id: ChatId,
    pub unread_count: u64,
}

/// Unread counts across every active chat of a user (global badge)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadSummary {
    pub total: u64,
    pub chats: Vec<ChatUnread>,
}

impl UnreadSummary {
    pub fn from_chats(chats: Vec<ChatUnread>) -> Self {
        let total = chats.iter().map(|c| c.unread_count).sum();
        Self { total, chats }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_status_parsing() {
        assert_eq!("online".parse::<PresenceStatus>().unwrap(), PresenceStatus::Online);
        assert_eq!("AWAY".parse::<PresenceStatus>().unwrap(), PresenceStatus::Away);
        assert!("busy".parse::<PresenceStatus>().is_err());
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let now = OffsetDateTime::now_utc();
        let message = NewMessage {
            chat_id: ChatId::new(),
            sender_id: UserId::new(),
            content: "hi".to_string(),
            message_type: MessageType::Text,
            file_url: None,
            file_name: None,
            file_size: None,
        }
        .into_message(now);

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["content"], "hi");
        assert_eq!(json["messageType"], "TEXT");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("fileUrl").is_none());
        assert!(json.get("deletedAt").is_none());
    }

    #[test]
    fn test_unread_summary_totals() {
        let summary = UnreadSummary::from_chats(vec![
            ChatUnread { chat_id: ChatId::new(), unread_count: 2 },
            ChatUnread { chat_id: ChatId::new(), unread_count: 5 },
        ]);
        assert_eq!(summary.total, 7);
    }
}
