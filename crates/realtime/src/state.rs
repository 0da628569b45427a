//! Shared application state

use std::sync::Arc;
use teamhub_shared::MessageStore;

use crate::auth::TokenValidator;
use crate::presence::PresenceTracker;
use crate::read_state::ReadStateEngine;
use crate::websocket::ConnectionManager;

/// State handed to every route
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub validator: Arc<dyn TokenValidator>,
    pub manager: ConnectionManager,
}

impl AppState {
    pub fn new(
        store: Arc<dyn MessageStore>,
        validator: Arc<dyn TokenValidator>,
        manager: ConnectionManager,
    ) -> Self {
        Self {
            store,
            validator,
            manager,
        }
    }

    pub fn read_state(&self) -> &ReadStateEngine {
        self.manager.read_state()
    }

    pub fn presence(&self) -> &PresenceTracker {
        self.manager.presence()
    }
}
