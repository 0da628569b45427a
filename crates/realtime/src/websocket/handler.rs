//! WebSocket handler for Axum
//!
//! Authenticates before the upgrade, then runs one reader and one writer task
//! per socket until either side closes.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use teamhub_shared::{ChatError, ChatId};

use super::connection::CloseReason;
use super::manager::ConnectionManager;
use crate::auth::{bearer_token, AuthUser};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Time the writer gets to flush a close frame after the reader stops
const WRITER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: Option<String>,
}

/// Upgrade `GET /ws/chats/{chat_id}`.
///
/// The token comes from `?token=` (browsers cannot set headers on WebSocket
/// requests) or an `Authorization: Bearer` header. Invalid tokens get a 401
/// before any upgrade happens.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Query(params): Query<WebSocketQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let token = params
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers))
        .ok_or(ApiError::Unauthorized)?;

    let user = state.manager.authenticate(token).await.map_err(|e| {
        tracing::warn!(chat_id = %chat_id, error = %e, "WebSocket auth failed");
        ApiError::from(e)
    })?;

    tracing::info!(chat_id = %chat_id, user_id = %user.user_id, "WebSocket connection upgrade requested");

    let manager = state.manager.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, chat_id, user, manager)))
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: Cow::Borrowed(reason.reason()),
    }))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, chat_id: ChatId, user: AuthUser, manager: ConnectionManager) {
    let (mut sender, mut receiver) = socket.split();

    let (conn, mut rx) = match manager.connect(chat_id, &user).await {
        Ok(registered) => registered,
        Err(e) => {
            let reason = match e {
                ChatError::Forbidden | ChatError::NotFound(_) => CloseReason::Forbidden,
                ChatError::BusUnavailable(_) if manager.is_shutting_down() => CloseReason::Shutdown,
                _ => CloseReason::Internal,
            };
            tracing::warn!(
                chat_id = %chat_id,
                user_id = %user.user_id,
                error = %e,
                code = reason.code(),
                "Rejecting WebSocket connection"
            );
            let _ = sender.send(close_message(reason)).await;
            return;
        }
    };
    let session_id = conn.session_id;

    // Spawn task to send frames to client
    let writer_conn = Arc::clone(&conn);
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_conn.closed() => break,
                next = rx.recv() => match next {
                    Some(text) => {
                        if sender.send(Message::Text(text.to_string())).await.is_err() {
                            break; // Connection closed
                        }
                    }
                    None => break,
                },
            }
        }

        if let Some(reason) = writer_conn.close_reason() {
            let _ = sender.send(close_message(reason)).await;
        }
        let _ = sender.close().await;
    });

    // Handle incoming frames
    loop {
        tokio::select! {
            _ = conn.closed() => break,
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = manager.receive(&conn, &text).await {
                        tracing::debug!(session_id = %session_id, error = %e, "Frame handling stopped the connection");
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(session_id = %session_id, "WebSocket closed by client");
                    break;
                }
                Some(Ok(_)) => {} // Ping/pong are handled by axum; binary is not part of the protocol
                Some(Err(e)) => {
                    tracing::debug!(session_id = %session_id, error = %e, "WebSocket read error");
                    break;
                }
            },
        }
    }

    manager.disconnect(&conn).await;

    if tokio::time::timeout(WRITER_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
}
