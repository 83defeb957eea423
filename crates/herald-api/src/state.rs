//! Application state.

use herald_core::Clock;
use herald_db::JobStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub clock: Arc<dyn Clock>,
    /// Cap stamped on jobs enqueued through the API.
    pub max_attempts: i32,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, max_attempts: i32) -> Self {
        Self {
            store,
            clock,
            max_attempts,
        }
    }
}
