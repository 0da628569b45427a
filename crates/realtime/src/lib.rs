//! TeamHub Real-Time Delivery
//!
//! WebSocket connection management, cross-instance pub/sub fan-out,
//! workspace presence and read-state for TeamHub chats.

pub mod auth;
pub mod config;
pub mod error;
pub mod presence;
pub mod pubsub;
pub mod read_state;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
