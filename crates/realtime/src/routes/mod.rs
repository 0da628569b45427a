//! API routes

pub mod chats;
pub mod health;
pub mod messages;
pub mod presence;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{auth::require_auth, state::AppState, websocket::ws_handler};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Protected API routes (bearer token resolved by the auth service)
    let api_v1_routes = Router::new()
        // Chats
        .route("/chats/:chat_id/messages", get(chats::history))
        .route("/chats/:chat_id/unread", get(chats::unread_count))
        .route("/chats/:chat_id/lastRead", put(chats::mark_read))
        .route("/unread", get(chats::unread_summary))
        // Receipts
        .route("/messages/:message_id/read", post(messages::acknowledge))
        .route("/messages/:message_id/reads", get(messages::receipts))
        // Presence
        .route(
            "/workspaces/:workspace_id/presence",
            get(presence::list_online).put(presence::update_presence),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // WebSocket routes (auth handled in handler via query parameter or header)
    let websocket_routes = Router::new().route("/ws/chats/:chat_id", get(ws_handler));

    Router::new()
        .merge(health_routes)
        .merge(websocket_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
