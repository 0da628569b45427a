//! WebSocket support for real-time chat
//!
//! # Architecture
//!
//! - **Connection**: one authenticated socket bound to one chat
//! - **Room**: chat-keyed registry and local fan-out
//! - **Manager**: connection lifecycle, client frames, bus and presence hand-off
//! - **Handler**: Axum WebSocket route handler
//! - **Events**: wire frame definitions

pub mod connection;
pub mod events;
pub mod handler;
pub mod manager;
pub mod room;

pub use handler::ws_handler;
pub use manager::{ConnectionManager, ManagerSettings, ManagerStats};
