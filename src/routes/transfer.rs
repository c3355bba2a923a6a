//! File transfer over a session's SSH connection.
//!
//! - `POST /upload?minion=<id>&file=<name>` - body is URL-safe base64;
//!   the decoded bytes are appended to `/tmp/<name>` on the remote host.
//!   Large files are sent as several requests with the same name.
//! - `GET /download?minion=<id>&filepath=<path>` - streams the remote file
//!   as an attachment.
//!
//! Both run on their own SSH channels, so the interactive shell is never
//! touched.

use std::fmt;
use std::io;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use russh::ChannelMsg;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::ssh::SshConnection;
use crate::util::{basename, shell_quote};
use crate::AppState;

/// URL-safe alphabet, padding optional.
const UPLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const UPLOAD_DIR: &str = "/tmp";

#[derive(Debug)]
pub enum TransferError {
    /// No live session with this id.
    UnknownSession(String),
    InvalidName(String),
    Decode(String),
    NotFound(String),
    /// The SSH side failed.
    Remote(String),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSession(id) => write!(f, "Session {id} not found"),
            Self::InvalidName(name) => write!(f, "Invalid file name: {name}"),
            Self::Decode(e) => write!(f, "Body is not valid base64: {e}"),
            Self::NotFound(path) => write!(f, "Not found: {path}"),
            Self::Remote(e) => write!(f, "Remote command failed: {e}"),
        }
    }
}

impl From<russh::Error> for TransferError {
    fn from(e: russh::Error) -> Self {
        Self::Remote(e.to_string())
    }
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::UnknownSession(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
            Self::InvalidName(_) => (StatusCode::BAD_REQUEST, "INVALID_NAME"),
            Self::Decode(_) => (StatusCode::BAD_REQUEST, "INVALID_BODY"),
            // Plain text, matching what download clients display.
            Self::NotFound(_) => return (StatusCode::NOT_FOUND, self.to_string()).into_response(),
            Self::Remote(_) => (StatusCode::BAD_GATEWAY, "REMOTE_ERROR"),
        };
        (status, Json(json!({"error": self.to_string(), "code": code}))).into_response()
    }
}

/// A bare file name: no directories, nothing that escapes the upload dir.
pub fn validate_upload_name(name: &str) -> Result<&str, TransferError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(TransferError::InvalidName(name.to_string()));
    }
    Ok(name)
}

pub fn decode_upload(body: &[u8]) -> Result<Vec<u8>, TransferError> {
    let trimmed = body.trim_ascii();
    UPLOAD_ENGINE
        .decode(trimmed)
        .map_err(|e| TransferError::Decode(e.to_string()))
}

async fn connection(state: &AppState, id: &str) -> Result<Arc<SshConnection>, TransferError> {
    state
        .bridge
        .transport(id)
        .await
        .ok_or_else(|| TransferError::UnknownSession(id.to_string()))
}

#[derive(Deserialize)]
pub struct UploadQuery {
    pub minion: String,
    pub file: String,
}

/// `POST /upload?minion=<id>&file=<name>`
pub async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<Json<Value>, TransferError> {
    let name = validate_upload_name(&query.file)?;
    let data = decode_upload(&body)?;
    let conn = connection(&state, &query.minion).await?;

    let path = format!("{UPLOAD_DIR}/{name}");
    let out = conn.append_file(&path, &data).await?;
    if !out.succeeded() {
        let detail = String::from_utf8_lossy(&out.stdout).trim().to_string();
        warn!("Upload to {path} on {} failed: {detail}", conn.endpoint());
        return Err(TransferError::Remote(format!(
            "cat exited with {:?}",
            out.exit_status
        )));
    }
    info!("Uploaded {} bytes to {path} on {}", data.len(), conn.endpoint());
    Ok(Json(json!({"path": path, "bytes": data.len()})))
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub minion: String,
    pub filepath: String,
}

/// `GET /download?minion=<id>&filepath=<path>`
pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, TransferError> {
    let path = query.filepath;
    let conn = connection(&state, &query.minion).await?;

    let quoted = shell_quote(&path).into_owned();
    let probe = conn.run(&format!("ls {quoted}")).await?;
    if !probe.succeeded() {
        return Err(TransferError::NotFound(path));
    }
    let channel = conn.exec(&format!("cat {quoted}")).await?;
    info!("Download started: {path} from {}", conn.endpoint());

    let stream = futures::stream::unfold(Some(channel), |channel| async move {
        let mut channel = channel?;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    return Some((Ok::<_, io::Error>(Bytes::copy_from_slice(&data)), Some(channel)));
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => return None,
                Some(_) => {}
            }
        }
    });

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", basename(&path)),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
