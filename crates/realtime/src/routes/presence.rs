//! Workspace presence routes

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use teamhub_shared::{PresenceStatus, WorkspaceId};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    presence::PresenceEntry,
    state::AppState,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceListResponse {
    pub workspace_id: WorkspaceId,
    pub users: Vec<PresenceEntry>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePresenceRequest {
    /// "online" or "away"
    pub status: String,
}

/// Users ONLINE or AWAY in the workspace
pub async fn list_online(
    State(state): State<AppState>,
    Extension(_user): Extension<AuthUser>,
    Path(workspace_id): Path<WorkspaceId>,
) -> ApiResult<Json<PresenceListResponse>> {
    let users = state.presence().list_online(workspace_id).await?;
    Ok(Json(PresenceListResponse {
        workspace_id,
        users,
    }))
}

/// Set the caller's own status (the client idle timer reports AWAY here)
pub async fn update_presence(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(workspace_id): Path<WorkspaceId>,
    Json(req): Json<UpdatePresenceRequest>,
) -> ApiResult<Json<PresenceEntry>> {
    let status: PresenceStatus = req
        .status
        .parse()
        .map_err(|_| ApiError::Validation("status must be online or away".to_string()))?;

    if status == PresenceStatus::Offline {
        return Err(ApiError::Validation(
            "offline is derived from connections and cannot be set".to_string(),
        ));
    }
    state
        .presence()
        .update_status(user.user_id, workspace_id, status)
        .await?;

    tracing::info!(user_id = %user.user_id, workspace_id = %workspace_id, status = status.as_str(), "User presence updated");

    let entry = state
        .presence()
        .list_online(workspace_id)
        .await?
        .into_iter()
        .find(|e| e.user_id == user.user_id)
        .ok_or(ApiError::Internal)?;
    Ok(Json(entry))
}
