//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::bridge::BridgeHandle;
use crate::config::Config;
use crate::registry::PortRegistry;
use crate::ssh::Connector;

/// Shared application state for the gru server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Entry point into the session bridge task.
    pub bridge: BridgeHandle,
    /// Opens SSH shells for `POST /`.
    pub connector: Arc<Connector>,
    /// Redis-backed proxy port registry.
    pub registry: Arc<PortRegistry>,
}
