//! WebSocket frame types and serialization
//!
//! Every frame on the wire is one flat camelCase JSON object discriminated by
//! `type`. Client frames are decoded into [`ClientEvent`] before being acted on;
//! server frames are built with the constructors on [`Frame`].

use serde::{Deserialize, Serialize};
use serde_json::json;
use teamhub_shared::{ChatError, ChatId, ChatResult, Message, MessageId, MessageType, UserId};
use time::OffsetDateTime;

/// Frame discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    // Client-to-server
    Message,
    TypingStart,
    TypingStop,
    ReadMessage,

    // Server-to-client
    MessageReceived,
    UserTyping,
    MessageRead,
    UserJoined,
    UserLeft,
    Error,

    /// Anything this build does not know about
    #[serde(other)]
    Unknown,
}

/// One WebSocket frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Frame {
    fn new(frame_type: FrameType, chat_id: ChatId) -> Self {
        Self {
            frame_type,
            chat_id: Some(chat_id),
            user_id: None,
            user_name: None,
            content: None,
            message_type: None,
            file_url: None,
            file_name: None,
            file_size: None,
            message_id: None,
            timestamp: None,
            payload: None,
        }
    }

    /// A persisted message, as delivered to every participant socket
    pub fn message_received(message: &Message, sender_name: Option<String>) -> Self {
        Self {
            user_id: Some(message.sender_id),
            user_name: sender_name,
            content: Some(message.content.clone()),
            message_type: Some(message.message_type),
            file_url: message.file_url.clone(),
            file_name: message.file_name.clone(),
            file_size: message.file_size,
            message_id: Some(message.id),
            timestamp: Some(message.created_at),
            payload: serde_json::to_value(message).ok(),
            ..Self::new(FrameType::MessageReceived, message.chat_id)
        }
    }

    pub fn user_typing(
        chat_id: ChatId,
        user_id: UserId,
        user_name: Option<String>,
        is_typing: bool,
    ) -> Self {
        Self {
            user_id: Some(user_id),
            user_name,
            timestamp: Some(OffsetDateTime::now_utc()),
            payload: Some(json!({ "isTyping": is_typing })),
            ..Self::new(FrameType::UserTyping, chat_id)
        }
    }

    pub fn message_read(
        chat_id: ChatId,
        user_id: UserId,
        message_id: Option<MessageId>,
        read_at: OffsetDateTime,
    ) -> Self {
        Self {
            user_id: Some(user_id),
            message_id,
            timestamp: Some(read_at),
            ..Self::new(FrameType::MessageRead, chat_id)
        }
    }

    pub fn user_joined(chat_id: ChatId, user_id: UserId, user_name: Option<String>) -> Self {
        Self {
            user_id: Some(user_id),
            user_name,
            timestamp: Some(OffsetDateTime::now_utc()),
            ..Self::new(FrameType::UserJoined, chat_id)
        }
    }

    pub fn user_left(chat_id: ChatId, user_id: UserId, user_name: Option<String>) -> Self {
        Self {
            user_id: Some(user_id),
            user_name,
            timestamp: Some(OffsetDateTime::now_utc()),
            ..Self::new(FrameType::UserLeft, chat_id)
        }
    }

    /// Error reported to a single socket
    pub fn error(chat_id: ChatId, code: &str, message: &str) -> Self {
        Self {
            timestamp: Some(OffsetDateTime::now_utc()),
            payload: Some(json!({ "code": code, "message": message })),
            ..Self::new(FrameType::Error, chat_id)
        }
    }

    /// Parse a text frame received from a client
    pub fn decode(text: &str) -> ChatResult<Self> {
        serde_json::from_str(text).map_err(|e| ChatError::MalformedFrame(e.to_string()))
    }

    pub fn encode(&self) -> ChatResult<String> {
        serde_json::to_string(self).map_err(|e| ChatError::MalformedFrame(e.to_string()))
    }
}

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Actions a client can request on its chat socket
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Send a new message
    Message {
        content: String,
        message_type: MessageType,
        file_url: Option<String>,
        file_name: Option<String>,
        file_size: Option<i64>,
    },

    TypingStart,
    TypingStop,

    /// Mark the chat read, optionally acknowledging one message
    ReadMessage { message_id: Option<MessageId> },
}

impl ClientEvent {
    /// Interpret a decoded frame received on the socket bound to `chat_id`.
    ///
    /// Returns `None` for frames a client may not send (server types, unknown types).
    pub fn from_frame(frame: Frame, chat_id: ChatId) -> ChatResult<Option<Self>> {
        if frame.chat_id.is_some_and(|id| id != chat_id) {
            return Err(ChatError::MalformedFrame(
                "chatId does not match the connection".to_string(),
            ));
        }

        let event = match frame.frame_type {
            FrameType::Message => Some(ClientEvent::Message {
                content: frame.content.unwrap_or_default(),
                message_type: frame.message_type.unwrap_or_default(),
                file_url: frame.file_url,
                file_name: frame.file_name,
                file_size: frame.file_size,
            }),
            FrameType::TypingStart => Some(ClientEvent::TypingStart),
            FrameType::TypingStop => Some(ClientEvent::TypingStop),
            FrameType::ReadMessage => Some(ClientEvent::ReadMessage {
                message_id: frame.message_id,
            }),
            FrameType::MessageReceived
            | FrameType::UserTyping
            | FrameType::MessageRead
            | FrameType::UserJoined
            | FrameType::UserLeft
            | FrameType::Error
            | FrameType::Unknown => None,
        };

        Ok(event)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use teamhub_shared::NewMessage;

    #[test]
    fn test_client_message_frame() {
        let chat_id = ChatId::new();
        let json = format!(r#"{{"type":"MESSAGE","chatId":"{chat_id}","content":"hello"}}"#);

        let frame = Frame::decode(&json).unwrap();
        let event = ClientEvent::from_frame(frame, chat_id).unwrap();

        assert_eq!(
            event,
            Some(ClientEvent::Message {
                content: "hello".to_string(),
                message_type: MessageType::Text,
                file_url: None,
                file_name: None,
                file_size: None,
            })
        );
    }

    #[test]
    fn test_unknown_and_server_types_are_ignored() {
        let chat_id = ChatId::new();

        let unknown = Frame::decode(r#"{"type":"SELF_DESTRUCT"}"#).unwrap();
        assert_eq!(unknown.frame_type, FrameType::Unknown);
        assert_eq!(ClientEvent::from_frame(unknown, chat_id).unwrap(), None);

        let spoofed = Frame::decode(r#"{"type":"USER_JOINED"}"#).unwrap();
        assert_eq!(ClientEvent::from_frame(spoofed, chat_id).unwrap(), None);
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(matches!(
            Frame::decode("not json"),
            Err(ChatError::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::decode(r#"{"content":"no type"}"#),
            Err(ChatError::MalformedFrame(_))
        ));

        let other_chat = Frame::decode(&format!(
            r#"{{"type":"TYPING_START","chatId":"{}"}}"#,
            ChatId::new()
        ))
        .unwrap();
        assert!(ClientEvent::from_frame(other_chat, ChatId::new()).is_err());
    }

    #[test]
    fn test_message_received_serialization() {
        let message = NewMessage {
            chat_id: ChatId::new(),
            sender_id: UserId::new(),
            content: "hi".to_string(),
            message_type: MessageType::Text,
            file_url: None,
            file_name: None,
            file_size: None,
        }
        .into_message(OffsetDateTime::UNIX_EPOCH);

        let json: serde_json::Value =
            serde_json::from_str(&Frame::message_received(&message, None).encode().unwrap()).unwrap();

        assert_eq!(json["type"], "MESSAGE_RECEIVED");
        assert_eq!(json["messageId"], message.id.to_string());
        assert_eq!(json["messageType"], "TEXT");
        assert_eq!(json["timestamp"], "1970-01-01T00:00:00Z");
        assert_eq!(json["payload"]["content"], "hi");
        assert!(json.get("fileUrl").is_none());
    }

    #[test]
    fn test_typing_and_error_payloads() {
        let chat_id = ChatId::new();

        let typing = serde_json::to_value(Frame::user_typing(chat_id, UserId::new(), None, true)).unwrap();
        assert_eq!(typing["type"], "USER_TYPING");
        assert_eq!(typing["payload"]["isTyping"], true);

        let error = serde_json::to_value(Frame::error(chat_id, "PERSISTENCE_ERROR", "try again")).unwrap();
        assert_eq!(error["type"], "ERROR");
        assert_eq!(error["payload"]["code"], "PERSISTENCE_ERROR");
    }
}
