//! `POST /` - log into a host and open a shell session.
//!
//! ```json
//! {"hostname": "10.0.0.5", "port": 22, "username": "root", "password": "..."}
//! ```
//!
//! `hostname` defaults to `localhost` (hosts reached through a proxy port
//! only send the port). `port` may be a number or a numeric string. The
//! optional `?term=` query picks the PTY `TERM`.
//!
//! The response is always `{"id", "status", "encoding"}`: `id` and
//! `encoding` on success, `status` with the reason on failure. The browser
//! then attaches with `GET /ws?id=<id>`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::bridge::NewSession;
use crate::ssh::LoginArgs;
use crate::AppState;

#[derive(Deserialize)]
pub struct LoginQuery {
    pub term: Option<String>,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct LoginResponse {
    pub id: Option<String>,
    pub status: Option<String>,
    pub encoding: Option<String>,
}

impl LoginResponse {
    fn failed(status: String) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message, "code": "INVALID_ARGUMENT"})),
    )
}

fn required_str<'a>(body: &'a Value, field: &str) -> Result<&'a str, (StatusCode, Json<Value>)> {
    match body.get(field) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(bad_request(&format!("{field} must be a string"))),
        None => Err(bad_request(&format!("Missing argument {field}"))),
    }
}

/// Validate the login body.
pub fn parse_login(body: &Value) -> Result<LoginArgs, (StatusCode, Json<Value>)> {
    if !body.is_object() {
        return Err(bad_request("Body must be a JSON object"));
    }
    let hostname = match body.get("hostname") {
        None | Some(Value::Null) => "localhost",
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim(),
        Some(_) => return Err(bad_request("hostname must be a non-empty string")),
    };
    let port = match body.get("port") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        None => return Err(bad_request("Missing argument port")),
        Some(_) => None,
    }
    .and_then(|p| u16::try_from(p).ok())
    .filter(|&p| p > 0)
    .ok_or_else(|| bad_request("Invalid port"))?;

    let username = required_str(body, "username")?;
    if username.is_empty() {
        return Err(bad_request("Empty username"));
    }
    let password = required_str(body, "password")?;

    Ok(LoginArgs {
        hostname: hostname.to_string(),
        port,
        username: username.to_string(),
        password: password.to_string(),
    })
}

pub async fn create_session(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    Json(body): Json<Value>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<Value>)> {
    let args = parse_login(&body)?;
    let term = query
        .term
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| state.config.ssh.default_term.clone());

    let login = match state.connector.open_shell(&args, &term).await {
        Ok(login) => login,
        Err(e) => {
            error!("Login to {}:{} failed: {e}", args.hostname, args.port);
            // The proxy behind this port is gone; drop its stale entry.
            if e.is_unreachable() && state.config.server.mode != "term" {
                if let Err(e) = state.registry.deregister(&args.port.to_string()).await {
                    warn!("Could not drop registry entry for port {}: {e}", args.port);
                }
            }
            return Ok(Json(LoginResponse::failed(e.to_string())));
        }
    };

    let encoding = login.encoding.clone();
    let session = NewSession::new(Box::new(login.channel), args.endpoint())
        .username(args.username.as_str())
        .encoding(encoding.as_str())
        .transport(login.connection);
    match state.bridge.create(session).await {
        Ok(id) => {
            info!(
                "Session {id} ready for {}@{}:{} ({encoding})",
                args.username, args.hostname, args.port
            );
            Ok(Json(LoginResponse {
                id: Some(id),
                status: None,
                encoding: Some(encoding),
            }))
        }
        Err(e) => Ok(Json(LoginResponse::failed(e.to_string()))),
    }
}
