//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** - `GRU_LISTEN`, `GRU_REDIS_URL`,
//!    `GRU_ENCODING`, `LOG_LEVEL`
//! 2. **Config file** - path via `--config <path>`, or `gru.toml` in CWD
//! 3. **Compiled defaults** - see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8000"
//! max_body_size = 6442450944   # 6 GiB, upload limit
//! ws_ping_interval_secs = 0     # 0 = no server pings
//! ws_send_queue = 1024          # frames buffered per browser
//! debug = false                 # exposes GET /debug
//! mode = "term"                 # anything else enables proxy-port cleanup
//!
//! [ssh]
//! connect_timeout_secs = 10
//! default_term = "xterm"
//! # encoding = "UTF-8"          # skip the `locale charmap` probe
//! max_concurrent_logins = 16
//!
//! [bridge]
//! attach_grace_ms = 2000
//! write_retry_ms = 100
//! recv_buffer_size = 65536
//! command_queue = 1024
//!
//! [registry]
//! redis_url = "redis://127.0.0.1:6379/0"
//! probe_host = "127.0.0.1"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum request body in bytes, applies to uploads (default 6 GiB).
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Seconds between WebSocket pings to the browser (0 disables).
    #[serde(default)]
    pub ws_ping_interval_secs: u64,
    /// Output frames buffered for one browser. A browser that falls this far
    /// behind is disconnected.
    #[serde(default = "default_ws_send_queue")]
    pub ws_send_queue: usize,
    /// Expose the `GET /debug` directory snapshot.
    #[serde(default)]
    pub debug: bool,
    /// Deployment mode. `"term"` is a plain web terminal; any other value
    /// means sessions go through registered proxy ports, and a failed login
    /// drops the stale registry entry.
    #[serde(default = "default_mode")]
    pub mode: String,
}

/// Remote-login settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// TCP connect + handshake timeout in seconds (default 10).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// `TERM` requested for the PTY when the login omits `?term=`.
    #[serde(default = "default_term")]
    pub default_term: String,
    /// Fixed server encoding. `None` probes `locale charmap` per login.
    #[serde(default)]
    pub encoding: Option<String>,
    /// Upper bound on logins being negotiated at the same time (default 16).
    #[serde(default = "default_max_concurrent_logins")]
    pub max_concurrent_logins: usize,
    /// Initial PTY rows before the browser sends a resize (default 24).
    #[serde(default = "default_terminal_rows")]
    pub default_terminal_rows: u16,
    /// Initial PTY columns before the browser sends a resize (default 80).
    #[serde(default = "default_terminal_cols")]
    pub default_terminal_cols: u16,
}

/// Session bridge tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Window after creation within which a browser must attach (default 2000).
    #[serde(default = "default_attach_grace_ms")]
    pub attach_grace_ms: u64,
    /// Delay before retrying a partially accepted write (default 100).
    #[serde(default = "default_write_retry_ms")]
    pub write_retry_ms: u64,
    /// Largest single read from the remote channel (default 64 KiB).
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    /// Capacity of the reactor command queue (default 1024).
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
}

/// Port registry (Redis) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Host probed by the liveness sweep (default `127.0.0.1`).
    #[serde(default = "default_probe_host")]
    pub probe_host: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_max_body_size() -> usize {
    6 * 1024 * 1024 * 1024
}
fn default_mode() -> String {
    "term".to_string()
}
fn default_ws_send_queue() -> usize {
    1024
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_term() -> String {
    "xterm".to_string()
}
fn default_max_concurrent_logins() -> usize {
    16
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_attach_grace_ms() -> u64 {
    2000
}
fn default_write_retry_ms() -> u64 {
    100
}
fn default_recv_buffer_size() -> usize {
    64 * 1024
}
fn default_command_queue() -> usize {
    1024
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_size: default_max_body_size(),
            ws_ping_interval_secs: 0,
            ws_send_queue: default_ws_send_queue(),
            debug: false,
            mode: default_mode(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            default_term: default_term(),
            encoding: None,
            max_concurrent_logins: default_max_concurrent_logins(),
            default_terminal_rows: default_terminal_rows(),
            default_terminal_cols: default_terminal_cols(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            attach_grace_ms: default_attach_grace_ms(),
            write_retry_ms: default_write_retry_ms(),
            recv_buffer_size: default_recv_buffer_size(),
            command_queue: default_command_queue(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            probe_host: default_probe_host(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BridgeConfig {
    pub fn attach_grace(&self) -> Duration {
        Duration::from_millis(self.attach_grace_ms)
    }

    pub fn write_retry(&self) -> Duration {
        Duration::from_millis(self.write_retry_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `gru.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            Self::parse(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("gru.toml").exists() {
            let content = std::fs::read_to_string("gru.toml").expect("Failed to read gru.toml");
            Self::parse(&content).expect("Failed to parse gru.toml")
        } else {
            Config::default()
        };

        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Parse a TOML document; missing sections and fields take their defaults.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("GRU_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(url) = var("GRU_REDIS_URL") {
            self.registry.redis_url = url;
        }
        if let Some(encoding) = var("GRU_ENCODING").filter(|e| !e.trim().is_empty()) {
            self.ssh.encoding = Some(encoding);
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level.trim().to_lowercase();
        }
    }
}
