//! Application state for the API server.

use trawl_proxy::ProxyManager;

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Capture proxy lifecycle manager.
    pub manager: ProxyManager,
}

impl AppState {
    /// Creates application state around `manager`.
    pub fn new(manager: ProxyManager) -> Self {
        Self { manager }
    }
}
