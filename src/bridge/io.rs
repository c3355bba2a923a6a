//! The two endpoints a session bridges, and the readiness source the reactor
//! watches.
//!
//! Both endpoints are traits so the session state machine can be driven by
//! in-memory fakes in tests; production uses [`crate::ssh::SshChannel`] and
//! [`crate::ws::WsPeer`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;

/// Which readiness a session is currently subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Readiness notifications published by a [`RemoteChannel`].
///
/// This is the channel's "descriptor": the reactor registers it and turns
/// notifications into `on_readable` / `on_writable` / `on_error` callbacks.
/// Notifications are permit-based, so a notify that happens before anyone
/// waits is not lost.
#[derive(Clone, Default)]
pub struct Readiness {
    readable: Arc<Notify>,
    writable: Arc<Notify>,
    fault: Arc<Notify>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_readable(&self) {
        self.readable.notify_one();
    }

    pub fn notify_writable(&self) {
        self.writable.notify_one();
    }

    /// Signal a broken channel. Delivered regardless of the current interest.
    pub fn notify_fault(&self) {
        self.fault.notify_one();
    }

    /// Wait for the readiness matching `interest`.
    pub async fn ready(&self, interest: Interest) {
        match interest {
            Interest::Read => self.readable.notified().await,
            Interest::Write => self.writable.notified().await,
        }
    }

    pub async fn faulted(&self) {
        self.fault.notified().await;
    }
}

/// Duplex, non-blocking byte channel to the remote pseudo-terminal.
///
/// `try_recv` and `try_send` never wait: a call that cannot make progress
/// returns [`io::ErrorKind::WouldBlock`]. `try_recv` returning `Ok(0)` means
/// end of stream.
pub trait RemoteChannel: Send {
    /// Read up to `buf.len()` bytes that have already arrived.
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Hand bytes to the channel; returns how many were accepted, which may be
    /// fewer than `data.len()`.
    fn try_send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Change the remote PTY size.
    fn resize(&mut self, rows: u16, cols: u16) -> io::Result<()>;

    /// Close the channel and the connection it runs on.
    fn close(&mut self);

    /// A failure the channel hit after `try_send` had already accepted the
    /// bytes. Reported once.
    fn take_error(&mut self) -> Option<io::Error> {
        None
    }

    fn readiness(&self) -> Readiness;
}

/// The peer went away before a frame could be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerGone;

impl std::fmt::Display for PeerGone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("peer connection is closed")
    }
}

/// Browser-side connection attached to a session.
///
/// Sessions hold peers through a `Weak`, so the connection's own task decides
/// when the peer is dropped.
pub trait ClientPeer: Send + Sync {
    /// Queue one binary frame for the browser.
    fn send_binary(&self, data: Bytes) -> Result<(), PeerGone>;

    /// Close the connection, telling the browser why.
    fn close(&self, reason: &str);

    /// Address of the browser, after proxy headers are honored.
    fn addr(&self) -> SocketAddr;
}

/// Errors that end a session: the connection is gone for good.
pub fn is_connection_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Errors that only mean "not now".
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_class() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected,
        ] {
            assert!(is_connection_reset(&io::Error::from(kind)));
        }
        assert!(!is_connection_reset(&io::Error::from(io::ErrorKind::WouldBlock)));
    }

    #[test]
    fn test_transient_class() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }

    #[tokio::test]
    async fn test_readiness_permit_survives_early_notify() {
        let readiness = Readiness::new();
        readiness.notify_readable();
        tokio::time::timeout(
            std::time::Duration::from_millis(50),
            readiness.ready(Interest::Read),
        )
        .await
        .expect("stored permit should wake the waiter");
    }
}
