//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use teamhub_shared::ChatError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Auth(reason) => {
                tracing::debug!(reason = %reason, "Rejected credentials");
                ApiError::InvalidToken
            }
            ChatError::Forbidden => ApiError::Forbidden,
            ChatError::NotFound(_) => ApiError::NotFound,
            ChatError::Validation(msg) | ChatError::MalformedFrame(msg) => ApiError::Validation(msg),
            ChatError::Persistence(msg) => {
                tracing::error!(error = %msg, "Persistence error");
                ApiError::Database(msg)
            }
            ChatError::BusUnavailable(msg) => {
                tracing::warn!(error = %msg, "Real-time backend unavailable");
                ApiError::ServiceUnavailable
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
