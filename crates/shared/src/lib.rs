//! TeamHub Shared Types and Utilities
//!
//! Types, errors and message-store access shared by the real-time chat services.

pub mod db;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod store;
pub mod types;

pub use db::*;
pub use error::*;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryMessageStore;
pub use store::{MessageStore, PgMessageStore};
pub use types::*;
