//! Error types for the chat delivery layer

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Invalid, expired or unverifiable token
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Valid user, but not an active participant of the chat
    #[error("Not a participant of this chat")]
    Forbidden,

    /// Client frame could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Message store write or read failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Publish/subscribe or presence backend unreachable
    #[error("Bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ChatError::NotFound("row not found".to_string()),
            other => ChatError::Persistence(other.to_string()),
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
