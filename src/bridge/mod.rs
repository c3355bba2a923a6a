//! Session bridge: remote shell channels ↔ browser WebSockets.
//!
//! [`Bridge`] owns the [`SessionDirectory`], the [`OrphanReaper`] and a
//! [`Reactor`], and is the only thing that mutates sessions. In production it
//! runs inside a single tokio task ([`handle::spawn`]); HTTP and WebSocket
//! handlers reach it through a cloneable [`BridgeHandle`] that posts commands.
//!
//! ## Concurrency
//!
//! One task, no locks. Readiness watchers and timers (see [`reactor`]) post
//! events into the same task, so no two callbacks ever run at once, for the
//! same session or different ones. Slow work (SSH handshake, encoding probe,
//! file transfer) happens in the request tasks and only its *result* is
//! posted here.

pub mod directory;
pub mod handle;
pub mod io;
pub mod message;
pub mod reactor;
pub mod reaper;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::ssh::SshConnection;
pub use directory::SessionDirectory;
pub use handle::BridgeHandle;
use io::ClientPeer;
use message::PeerMessage;
pub use reactor::{Reactor, Timer, TimerKey};
pub use reaper::OrphanReaper;
pub use session::{Endpoint, NewSession, Session, SessionInfo, SessionState};

/// Opaque session identifier, also the attach token handed to the browser.
pub type SessionId = String;

/// Reason given to every session when the server stops.
pub const REASON_SHUTDOWN: &str = "server shutdown";

/// Timing and sizing knobs for the bridge.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub attach_grace: Duration,
    pub write_retry: Duration,
    pub recv_buffer_size: usize,
}

impl From<&BridgeConfig> for BridgeSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            attach_grace: config.attach_grace(),
            write_retry: config.write_retry(),
            recv_buffer_size: config.recv_buffer_size,
        }
    }
}

/// Failures reported to the caller of a bridge operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// A session with this id is already in the directory.
    DuplicateId(String),
    /// No live session has this id.
    NotFound,
    /// The session already has a browser attached.
    AlreadyAttached,
    /// The reactor refused to watch the channel.
    Registration(String),
    /// The bridge task is gone (server shutting down).
    Unavailable,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "Session id {id} already exists"),
            Self::NotFound => f.write_str("Websocket authentication failed."),
            Self::AlreadyAttached => f.write_str("Websocket already attached."),
            Self::Registration(e) => write!(f, "Failed to watch session channel: {e}"),
            Self::Unavailable => f.write_str("Server is shutting down."),
        }
    }
}

/// The reactor-side core: directory, reaper and reactor, driven one call at
/// a time.
pub struct Bridge<R: Reactor> {
    directory: SessionDirectory,
    reaper: OrphanReaper,
    reactor: R,
    settings: BridgeSettings,
}

impl<R: Reactor> Bridge<R> {
    pub fn new(reactor: R, settings: BridgeSettings) -> Self {
        Self {
            directory: SessionDirectory::new(),
            reaper: OrphanReaper::new(settings.attach_grace),
            reactor,
            settings,
        }
    }

    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    /// Wrap an opened channel in a session, insert it and start the attach
    /// deadline. On failure the channel is closed and nothing is kept.
    pub fn create(&mut self, new: NewSession) -> Result<SessionId, BridgeError> {
        self.insert(Session::create(new, &self.settings))
    }

    pub(crate) fn insert(&mut self, session: Session) -> Result<SessionId, BridgeError> {
        let id = session.id().to_string();
        let endpoint = session.endpoint().clone();
        if let Err((err, mut rejected)) = self.directory.insert(session) {
            rejected.close(&err.to_string(), &mut self.reactor);
            return Err(err);
        }
        self.reaper.arm(&id, &mut self.reactor);
        info!(
            "Session {id} created for {endpoint}, total: {}",
            self.directory.len()
        );
        Ok(id)
    }

    /// Bind a browser peer to a session and cancel its attach deadline.
    pub fn attach(&mut self, id: &str, peer: Weak<dyn ClientPeer>) -> Result<(), BridgeError> {
        let Some(session) = self.directory.lookup_mut(id) else {
            return Err(BridgeError::NotFound);
        };
        let result = session.attach(peer, &mut self.reactor);
        let closed = session.is_closed();
        match result {
            Ok(()) => {
                self.reaper.cancel(id, &mut self.reactor);
            }
            Err(_) if closed => self.finish(id),
            Err(_) => {}
        }
        result
    }

    pub fn on_readable(&mut self, id: &str) {
        self.with_session(id, |s, r| s.on_readable(r));
    }

    pub fn on_writable(&mut self, id: &str) {
        self.with_session(id, |s, r| s.on_writable(r));
    }

    pub fn on_error(&mut self, id: &str) {
        self.with_session(id, |s, r| s.on_error(r));
    }

    pub fn on_timer(&mut self, key: TimerKey, timer: Timer) {
        match timer {
            Timer::RetryWrite(id) => self.with_session(&id, |s, r| s.on_retry_timer(key, r)),
            Timer::Reap(id) => {
                if !self.reaper.fired(&id, key) {
                    return;
                }
                self.with_session(&id, |s, r| {
                    if s.is_awaiting_attach() {
                        s.close(session::REASON_ATTACH_TIMEOUT, r);
                    }
                });
            }
        }
    }

    /// A text frame from the browser.
    pub fn on_peer_message(&mut self, id: &str, text: &str) {
        let msg = PeerMessage::parse(text);
        if msg.is_empty() {
            debug!("Session {id}: ignored peer message");
            return;
        }
        if let Some((rows, cols)) = msg.resize {
            self.with_session(id, |s, _| s.resize(rows, cols));
        }
        if let Some(data) = msg.data {
            self.enqueue_outbound(id, Bytes::from(data));
        }
    }

    pub fn enqueue_outbound(&mut self, id: &str, data: Bytes) {
        self.with_session(id, |s, r| s.enqueue_outbound(data, r));
    }

    pub fn resize(&mut self, id: &str, rows: u16, cols: u16) {
        self.with_session(id, |s, _| s.resize(rows, cols));
    }

    /// Close a session and drop it from the directory. No-op for unknown ids.
    pub fn close(&mut self, id: &str, reason: &str) {
        self.with_session(id, |s, r| {
            s.close(reason, r);
        });
    }

    pub fn lookup(&self, id: &str) -> Option<&Session> {
        self.directory.lookup(id)
    }

    pub fn snapshot(&self) -> BTreeMap<SessionId, SessionInfo> {
        self.directory.snapshot()
    }

    pub fn transport(&self, id: &str) -> Option<Arc<SshConnection>> {
        self.directory.lookup(id).and_then(Session::transport)
    }

    pub fn len(&self) -> usize {
        self.directory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }

    /// Close every session.
    pub fn shutdown(&mut self) {
        let ids = self.directory.ids();
        if ids.is_empty() {
            return;
        }
        for id in &ids {
            self.close(id, REASON_SHUTDOWN);
        }
        info!("Shut down {} session(s)", ids.len());
    }

    fn with_session(&mut self, id: &str, f: impl FnOnce(&mut Session, &mut dyn Reactor)) {
        let Some(session) = self.directory.lookup_mut(id) else {
            return;
        };
        f(session, &mut self.reactor);
        if session.is_closed() {
            self.finish(id);
        }
    }

    /// Final step of a close: forget the session everywhere.
    fn finish(&mut self, id: &str) {
        self.reaper.cancel(id, &mut self.reactor);
        if self.directory.remove(id).is_some() {
            info!("Session {id} removed, remaining: {}", self.directory.len());
        }
    }
}
