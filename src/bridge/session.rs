//! One remote shell channel bridged to at most one browser peer.
//!
//! ## Lifecycle
//!
//! ```text
//! created ─► awaiting-attach ─► active ─► closed
//!                   │                        ▲
//!                   └──── attach timeout ────┘
//! ```
//!
//! A [`Session`] never awaits. Every method runs on the bridge task and
//! either finishes immediately or leaves work for the next readiness event or
//! the write-retry timer.
//!
//! ## Outbound backpressure
//!
//! Browser input is queued in `outbound` and written eagerly. When the
//! channel accepts only a prefix, the remainder stays at the head of the
//! queue, interest flips to [`Interest::Write`] and a retry timer is armed.
//! Once the queue drains, interest flips back to [`Interest::Read`]. While
//! interest is `Write` the channel is not polled for reads.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::io::{is_connection_reset, is_transient, ClientPeer, Interest, RemoteChannel};
use super::reactor::{Reactor, Timer, TimerKey};
use super::{BridgeError, BridgeSettings, SessionId};
use crate::ssh::SshConnection;

pub const REASON_PEER_CLOSED: &str = "peer closed";
pub const REASON_REMOTE_EOF: &str = "remote eof";
pub const REASON_CHANNEL_ERROR: &str = "channel error";
pub const REASON_WRITE_ERROR: &str = "channel error on write";
pub const REASON_ATTACH_TIMEOUT: &str = "attach timeout";
pub const REASON_REACTOR_ERROR: &str = "reactor error";

/// Host and port of the far side of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingAttach,
    Active,
    Closed,
}

/// Everything needed to build a [`Session`] once the remote shell is open.
pub struct NewSession {
    remote: Box<dyn RemoteChannel>,
    endpoint: Endpoint,
    username: String,
    encoding: String,
    transport: Option<Arc<SshConnection>>,
}

impl NewSession {
    pub fn new(remote: Box<dyn RemoteChannel>, endpoint: Endpoint) -> Self {
        Self {
            remote,
            endpoint,
            username: String::new(),
            encoding: "UTF-8".to_string(),
            transport: None,
        }
    }

    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    #[must_use]
    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    /// Connection shared with sibling consumers such as file transfer.
    #[must_use]
    pub fn transport(mut self, transport: Arc<SshConnection>) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// Read-only description of a session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub encoding: String,
    pub attached: bool,
}

pub struct Session {
    id: SessionId,
    remote: Box<dyn RemoteChannel>,
    endpoint: Endpoint,
    username: String,
    encoding: String,
    transport: Option<Arc<SshConnection>>,
    peer: Option<Weak<dyn ClientPeer>>,
    outbound: VecDeque<Bytes>,
    interest: Interest,
    registered: bool,
    retry_timer: Option<TimerKey>,
    write_retry: Duration,
    recv_buf: Vec<u8>,
    state: SessionState,
}

impl Session {
    /// Wrap an opened remote channel. Allocates the id; nothing is registered
    /// with the reactor until a peer attaches.
    pub fn create(new: NewSession, settings: &BridgeSettings) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), new, settings)
    }

    pub(crate) fn with_id(id: SessionId, new: NewSession, settings: &BridgeSettings) -> Self {
        Self {
            id,
            remote: new.remote,
            endpoint: new.endpoint,
            username: new.username,
            encoding: new.encoding,
            transport: new.transport,
            peer: None,
            outbound: VecDeque::new(),
            interest: Interest::Read,
            registered: false,
            retry_timer: None,
            write_retry: settings.write_retry,
            recv_buf: vec![0; settings.recv_buffer_size.max(1)],
            state: SessionState::AwaitingAttach,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn is_awaiting_attach(&self) -> bool {
        self.state == SessionState::AwaitingAttach
    }

    /// Bytes queued for the remote channel but not yet accepted.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.iter().map(Bytes::len).sum()
    }

    pub fn transport(&self) -> Option<Arc<SshConnection>> {
        self.transport.clone()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            username: self.username.clone(),
            encoding: self.encoding.clone(),
            attached: self.state == SessionState::Active,
        }
    }

    /// Bind the browser peer and start watching the channel for reads.
    ///
    /// A second attach is refused and leaves the first peer in place. A failed
    /// reactor registration closes the session.
    pub fn attach(
        &mut self,
        peer: Weak<dyn ClientPeer>,
        reactor: &mut dyn Reactor,
    ) -> Result<(), BridgeError> {
        match self.state {
            SessionState::Closed => return Err(BridgeError::NotFound),
            SessionState::Active => return Err(BridgeError::AlreadyAttached),
            SessionState::AwaitingAttach => {}
        }

        if let Err(e) = reactor.register(&self.id, self.remote.readiness(), Interest::Read) {
            warn!("Session {}: reactor registration failed: {e}", self.id);
            self.close(REASON_REACTOR_ERROR, reactor);
            return Err(BridgeError::Registration(e.to_string()));
        }
        self.registered = true;
        self.interest = Interest::Read;

        if let Some(p) = peer.upgrade() {
            info!("Session {} attached from {}", self.id, p.addr());
        }
        self.peer = Some(peer);
        self.state = SessionState::Active;
        Ok(())
    }

    /// The remote channel has data (or EOF, or an error) for us.
    pub fn on_readable(&mut self, reactor: &mut dyn Reactor) {
        if self.is_closed() {
            return;
        }

        let n = match self.remote.try_recv(&mut self.recv_buf) {
            Ok(0) => {
                self.close_or_write_error(REASON_REMOTE_EOF, reactor);
                return;
            }
            Ok(n) => n,
            Err(e) if is_connection_reset(&e) => {
                warn!("Session {}: read failed: {e}", self.id);
                self.close(REASON_CHANNEL_ERROR, reactor);
                return;
            }
            Err(e) if is_transient(&e) => return,
            Err(e) => {
                warn!("Session {}: read error ignored: {e}", self.id);
                return;
            }
        };

        let data = Bytes::copy_from_slice(&self.recv_buf[..n]);
        debug!("Session {}: {n} bytes from {}", self.id, self.endpoint);

        let delivered = self
            .peer
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|peer| peer.send_binary(data).is_ok());
        if !delivered {
            self.close(REASON_PEER_CLOSED, reactor);
        }
    }

    /// The remote channel can take more bytes.
    pub fn on_writable(&mut self, reactor: &mut dyn Reactor) {
        self.attempt_write(reactor);
    }

    /// The reactor reported the channel as broken.
    pub fn on_error(&mut self, reactor: &mut dyn Reactor) {
        self.close_or_write_error(REASON_REACTOR_ERROR, reactor);
    }

    /// Close with `reason`, unless the channel has a late write failure to
    /// report.
    fn close_or_write_error(&mut self, reason: &str, reactor: &mut dyn Reactor) {
        match self.remote.take_error() {
            Some(e) => {
                warn!("Session {}: write failed: {e}", self.id);
                self.close(REASON_WRITE_ERROR, reactor);
            }
            None => {
                self.close(reason, reactor);
            }
        }
    }

    /// The write-retry timer fired. Stale keys are ignored.
    pub fn on_retry_timer(&mut self, key: TimerKey, reactor: &mut dyn Reactor) {
        if self.retry_timer != Some(key) {
            return;
        }
        self.retry_timer = None;
        self.attempt_write(reactor);
    }

    /// Queue browser input and try to write it right away, so keystrokes do
    /// not wait for the next readiness round.
    pub fn enqueue_outbound(&mut self, data: Bytes, reactor: &mut dyn Reactor) {
        if self.is_closed() || data.is_empty() {
            return;
        }
        self.outbound.push_back(data);
        self.attempt_write(reactor);
    }

    /// One non-blocking send of everything queued.
    pub fn attempt_write(&mut self, reactor: &mut dyn Reactor) {
        if self.is_closed() || self.outbound.is_empty() {
            return;
        }

        let pending = self.coalesce();
        match self.remote.try_send(&pending) {
            Ok(sent) if sent >= pending.len() => {
                debug!("Session {}: {sent} bytes to {}", self.id, self.endpoint);
                self.outbound.clear();
                self.set_interest(Interest::Read, reactor);
            }
            Ok(sent) => {
                debug!(
                    "Session {}: {sent}/{} bytes accepted by {}",
                    self.id,
                    pending.len(),
                    self.endpoint
                );
                self.outbound.clear();
                self.outbound.push_back(pending.slice(sent..));
                self.defer_write(reactor);
            }
            Err(e) if is_connection_reset(&e) => {
                warn!("Session {}: write failed: {e}", self.id);
                self.close(REASON_WRITE_ERROR, reactor);
            }
            Err(e) => {
                if !is_transient(&e) {
                    warn!("Session {}: write error, will retry: {e}", self.id);
                }
                self.defer_write(reactor);
            }
        }
    }

    /// Forward a terminal size change. Advisory: failures are logged and
    /// dropped.
    pub fn resize(&mut self, rows: u16, cols: u16) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.remote.resize(rows, cols) {
            debug!("Session {}: resize to {rows}x{cols} ignored: {e}", self.id);
        }
    }

    /// Tear down both sides. Only the first call has any effect; returns
    /// whether this call did the work.
    pub fn close(&mut self, reason: &str, reactor: &mut dyn Reactor) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = SessionState::Closed;
        info!("Closing session {}: {reason}", self.id);

        if self.registered {
            reactor.deregister(&self.id);
            self.registered = false;
        }
        if let Some(key) = self.retry_timer.take() {
            reactor.cancel(key);
        }
        if let Some(peer) = self.peer.take().and_then(|p| p.upgrade()) {
            peer.close(reason);
        }
        self.remote.close();
        self.outbound.clear();
        info!("Connection to {} lost", self.endpoint);
        true
    }

    /// Merge queued chunks into one so a single send covers everything.
    fn coalesce(&mut self) -> Bytes {
        if self.outbound.len() > 1 {
            let mut joined = BytesMut::with_capacity(self.pending_outbound());
            for chunk in self.outbound.drain(..) {
                joined.extend_from_slice(&chunk);
            }
            self.outbound.push_back(joined.freeze());
        }
        self.outbound.front().cloned().unwrap_or_default()
    }

    fn defer_write(&mut self, reactor: &mut dyn Reactor) {
        self.set_interest(Interest::Write, reactor);
        // Writable readiness is not delivered by every channel, so a timer
        // re-drives the write regardless.
        if self.retry_timer.is_none() {
            self.retry_timer = Some(
                reactor.schedule_after(self.write_retry, Timer::RetryWrite(self.id.clone())),
            );
        }
    }

    fn set_interest(&mut self, interest: Interest, reactor: &mut dyn Reactor) {
        if self.interest == interest {
            return;
        }
        self.interest = interest;
        if self.registered {
            reactor.reregister(&self.id, interest);
        }
    }
}
