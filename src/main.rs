#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # gru
//!
//! Browser-to-shell gateway. gru logs into SSH hosts on behalf of a browser
//! terminal and bridges the remote shell to a WebSocket.
//!
//! ## Subcommands
//!
//! - `gru serve` (default) - run the HTTP/WS server
//!
//! ## API surface
//!
//! | Method | Path                  | Description                               |
//! |--------|-----------------------|-------------------------------------------|
//! | POST   | `/`                   | SSH login, returns a session id           |
//! | GET    | `/ws?id=`             | WebSocket attach to a session             |
//! | POST   | `/upload`             | Append base64 body to `/tmp/<file>`       |
//! | GET    | `/download`           | Stream a remote file                      |
//! | GET    | `/port`               | Free local port for a new proxy           |
//! | POST   | `/register`           | Register a proxied host                   |
//! | DELETE | `/deregister/{port}`  | Drop a proxied host                       |
//! | GET    | `/genhosts`           | List proxied hosts                        |
//! | GET    | `/clean`              | Evict proxied hosts whose port is closed  |
//! | GET    | `/api/health`         | Liveness probe                            |
//! | GET    | `/debug`              | Session snapshot (`server.debug` only)    |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          - entry point, clap subcommands, router setup, graceful shutdown
//! config.rs        - TOML + env-var configuration
//! bridge/
//!   session.rs     - Session state machine (attach, read, write, close)
//!   directory.rs   - SessionDirectory (id → Session)
//!   reaper.rs      - OrphanReaper (attach deadline)
//!   reactor.rs     - Reactor trait, TokioReactor (readiness watchers + timers)
//!   handle.rs      - bridge task and BridgeHandle
//! ssh/
//!   mod.rs         - Connector, SshConnection (login, side commands)
//!   channel.rs     - SshChannel (non-blocking shell channel)
//! ws/
//!   mod.rs         - WebSocket upgrade, WsPeer
//! routes/
//!   login.rs       - POST /
//!   transfer.rs    - /upload, /download
//!   registry.rs    - port registry endpoints
//!   health.rs      - /api/health, /debug
//! registry.rs      - Redis-backed PortRegistry
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use gru::bridge::{self, BridgeSettings};
use gru::registry::PortRegistry;
use gru::ssh::Connector;
use gru::{routes, ws, AppState, Config};

/// Browser-to-shell gateway.
#[derive(Parser)]
#[command(name = "gru", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve) | None => run_server(cli.config.as_deref()).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("gru v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.server.debug {
        warn!("Debug mode: GET /debug exposes live sessions");
    }

    let (bridge, bridge_task) = bridge::handle::spawn(
        BridgeSettings::from(&config.bridge),
        config.bridge.command_queue,
    );
    let registry = PortRegistry::new(&config.registry)
        .unwrap_or_else(|e| panic!("Invalid registry.redis_url: {e}"));
    let max_body_size = config.server.max_body_size;

    let state = AppState {
        connector: Arc::new(Connector::new(&config.ssh)),
        registry: Arc::new(registry),
        bridge,
        config: Arc::new(config),
        start_time: Instant::now(),
    };

    let app = Router::new()
        .route("/", post(routes::login::create_session))
        .route("/ws", get(ws::ws_upgrade))
        .route(
            "/upload",
            post(routes::transfer::upload).layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route("/download", get(routes::transfer::download))
        .route("/port", get(routes::registry::free_port))
        .route("/register", post(routes::registry::register))
        .route("/deregister/{port}", delete(routes::registry::deregister))
        .route("/genhosts", get(routes::registry::hosts))
        .route("/clean", get(routes::registry::clean))
        .route("/api/health", get(routes::health::health))
        .route("/debug", get(routes::health::debug))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    state.bridge.shutdown().await;
    if let Err(e) = bridge_task.await {
        warn!("Bridge task ended abnormally: {e}");
    }
    info!("Goodbye");
}
