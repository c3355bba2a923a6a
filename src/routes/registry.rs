//! Port registry endpoints for proxied hosts.
//!
//! - `GET    /port`              - a free local port for a new proxy
//! - `POST   /register`          - store host metadata under its `port`
//! - `DELETE /deregister/{port}` - drop an entry
//! - `GET    /genhosts`          - every registered entry
//! - `GET    /clean`             - evict entries whose port is closed

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::error;

use crate::registry::{self, RegistryError};
use crate::AppState;

fn reject(e: &RegistryError) -> (StatusCode, Json<Value>) {
    let (status, code) = match e {
        RegistryError::InvalidEntry(_) => (StatusCode::BAD_REQUEST, "INVALID_ENTRY"),
        RegistryError::Redis(_) => (StatusCode::SERVICE_UNAVAILABLE, "REGISTRY_UNAVAILABLE"),
    };
    if status.is_server_error() {
        error!("{e}");
    }
    (status, Json(json!({"error": e.to_string(), "code": code})))
}

/// `GET /port`
pub async fn free_port() -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let port = registry::find_free_port().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string(), "code": "IO_ERROR"})),
        )
    })?;
    Ok(Json(json!({"port": port})))
}

/// `POST /register`
pub async fn register(
    State(state): State<AppState>,
    Json(entry): Json<Value>,
) -> Result<&'static str, (StatusCode, Json<Value>)> {
    state
        .registry
        .register(&entry)
        .await
        .map_err(|e| reject(&e))?;
    Ok("")
}

/// `DELETE /deregister/{port}`
pub async fn deregister(
    State(state): State<AppState>,
    Path(port): Path<String>,
) -> Result<&'static str, (StatusCode, Json<Value>)> {
    state
        .registry
        .deregister(&port)
        .await
        .map_err(|e| reject(&e))?;
    Ok("")
}

/// `GET /genhosts`
pub async fn hosts(State(state): State<AppState>) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let hosts = state.registry.hosts().await.map_err(|e| reject(&e))?;
    Ok(Json(Value::Array(
        hosts.into_iter().map(|(_, entry)| entry).collect(),
    )))
}

/// `GET /clean`
pub async fn clean(State(state): State<AppState>) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let alive = state.registry.clean().await.map_err(|e| reject(&e))?;
    Ok(Json(Value::Array(alive)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_statuses() {
        let (status, body) = reject(&RegistryError::InvalidEntry("no port".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0["code"], "INVALID_ENTRY");

        let (status, _) = reject(&RegistryError::Redis("refused".to_string()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_free_port_shape() {
        let Json(body) = free_port().await.unwrap();
        assert!(body["port"].as_u64().is_some_and(|p| p > 0));
    }
}
