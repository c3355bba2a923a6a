//! Health and diagnostics endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` - liveness probe.
///
/// Returns status, uptime, version and the number of live sessions.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.bridge.count().await;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "mode": state.config.server.mode.as_str(),
    }))
}

/// `GET /debug` - every live session with its creation arguments (never the
/// password). 404 unless `server.debug` is set.
pub async fn debug(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.config.server.debug {
        return Err(StatusCode::NOT_FOUND);
    }
    let snapshot = state.bridge.snapshot().await;
    Ok(Json(json!(snapshot)))
}
