//! HTTP route handlers.
//!
//! Each sub-module corresponds to an endpoint group. The WebSocket attach
//! endpoint lives in [`crate::ws`].

pub mod health;
pub mod login;
pub mod registry;
pub mod transfer;
