//! Per-message read receipts

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde::Serialize;
use teamhub_shared::{ChatId, MessageId, MessageRead};
use time::OffsetDateTime;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeResponse {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: OffsetDateTime,
    /// False if the message had already been acknowledged
    pub newly_read: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptsResponse {
    pub message_id: MessageId,
    pub reads: Vec<MessageRead>,
}

/// Acknowledge a message and broadcast MESSAGE_READ to its chat
pub async fn acknowledge(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(message_id): Path<MessageId>,
) -> ApiResult<Json<AcknowledgeResponse>> {
    let ack = state
        .manager
        .acknowledge_message(message_id, user.user_id)
        .await?;

    Ok(Json(AcknowledgeResponse {
        message_id,
        chat_id: ack.chat_id,
        read_at: ack.read_at,
        newly_read: ack.newly_read,
    }))
}

/// "Seen by" list
pub async fn receipts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(message_id): Path<MessageId>,
) -> ApiResult<Json<ReceiptsResponse>> {
    let reads = state.read_state().receipts(message_id, user.user_id).await?;
    Ok(Json(ReceiptsResponse { message_id, reads }))
}
