//! Application state

use std::sync::Arc;

use cuenty_engine::Engine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}
