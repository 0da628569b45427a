//! Chat read-state and history routes

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use teamhub_shared::{ChatId, ChatUnread, HistoryCursor, Message, MessageId, UnreadSummary};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    /// RFC 3339 `createdAt` of the oldest message already held
    pub before: Option<String>,
    /// Id of that message; pages through messages sharing its timestamp
    pub before_id: Option<MessageId>,
    /// Page size (default 50, max 200)
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub chat_id: ChatId,
    /// Oldest first
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastReadResponse {
    pub chat_id: ChatId,
    #[serde(with = "time::serde::rfc3339")]
    pub last_read_at: OffsetDateTime,
}

// =============================================================================
// Handlers
// =============================================================================

/// Catch-up history for a chat
pub async fn history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(chat_id): Path<ChatId>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let created_at = query
        .before
        .as_deref()
        .map(|raw| OffsetDateTime::parse(raw, &Rfc3339))
        .transpose()
        .map_err(|_| ApiError::BadRequest("before must be an RFC 3339 timestamp".to_string()))?;

    let before = match (created_at, query.before_id) {
        (Some(created_at), message_id) => Some(HistoryCursor {
            created_at,
            message_id,
        }),
        (None, Some(_)) => {
            return Err(ApiError::BadRequest(
                "beforeId requires before".to_string(),
            ))
        }
        (None, None) => None,
    };

    let messages = state
        .read_state()
        .history(chat_id, user.user_id, before, query.limit)
        .await?;

    Ok(Json(HistoryResponse { chat_id, messages }))
}

/// Unread count for one chat
pub async fn unread_count(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(chat_id): Path<ChatId>,
) -> ApiResult<Json<ChatUnread>> {
    let unread_count = state.read_state().unread_count(chat_id, user.user_id).await?;
    Ok(Json(ChatUnread {
        chat_id,
        unread_count,
    }))
}

/// Unread counts across every chat of the caller
pub async fn unread_summary(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<UnreadSummary>> {
    let summary = state.read_state().unread_summary(user.user_id).await?;
    Ok(Json(summary))
}

/// Mark the chat read up to now
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(chat_id): Path<ChatId>,
) -> ApiResult<Json<LastReadResponse>> {
    let last_read_at = state.manager.mark_read(chat_id, user.user_id).await?;
    Ok(Json(LastReadResponse {
        chat_id,
        last_read_at,
    }))
}
