//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub instance_id: String,
    pub active_connections: usize,
    pub active_chats: usize,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    // Check database connectivity
    let db_status = match state.store.ping().await {
        Ok(()) => "healthy".to_string(),
        Err(_) => "unhealthy".to_string(),
    };

    let overall_status = if db_status == "healthy" && !state.manager.is_shutting_down() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let stats = state.manager.stats();

    (
        overall_status,
        Json(HealthResponse {
            status: if overall_status == StatusCode::OK {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: db_status,
            instance_id: state.manager.instance_id().to_string(),
            active_connections: stats.active_connections,
            active_chats: stats.active_chats,
        }),
    )
}

/// Liveness check (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness check (not ready while draining or without a database)
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.manager.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match state.store.ping().await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
