#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::new_without_default)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! gru library - the building blocks of the browser-to-shell gateway.
//!
//! - `bridge` - sessions, directory, reaper, reactor, bridge task
//! - `ssh` - login, shell channel, side commands
//! - `ws` - WebSocket attach and the browser peer
//! - `routes` - REST handlers
//! - `registry` - Redis port registry for proxied hosts
//! - `config` - configuration loading

pub mod bridge;
pub mod config;
pub mod registry;
pub mod routes;
pub mod ssh;
pub mod state;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use bridge::BridgeHandle;
pub use config::Config;
pub use state::AppState;
