//! Non-blocking adapter over the async russh shell channel.
//!
//! A driver task owns the russh [`Channel`]. Inbound data is pushed into a
//! bounded queue and announced through [`Readiness`]; outbound data and
//! resizes travel the other way through a bounded op queue. `try_recv` and
//! `try_send` only touch the queues, so the bridge never awaits.
//!
//! When the inbound queue is full the driver stops reading the channel, which
//! lets SSH flow control push back on the remote. A write the driver fails to
//! deliver is kept and surfaces through `try_send` and `take_error`.

use std::io;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use super::SshConnection;
use crate::bridge::io::{Readiness, RemoteChannel};

const INBOUND_QUEUE: usize = 64;
const OP_QUEUE: usize = 16;
/// Largest slice accepted by one `try_send`.
pub const MAX_WRITE_CHUNK: usize = 16 * 1024;

enum Op {
    Data(Bytes),
    Resize { rows: u16, cols: u16 },
}

pub struct SshChannel {
    inbound: mpsc::Receiver<Bytes>,
    partial: Option<Bytes>,
    eof: bool,
    ops: mpsc::Sender<Op>,
    space: Arc<Notify>,
    readiness: Readiness,
    write_error: Arc<OnceLock<String>>,
    error_reported: bool,
    shutdown: Option<oneshot::Sender<()>>,
}

impl SshChannel {
    /// Start the driver for an opened shell channel.
    pub fn spawn(channel: Channel<Msg>, connection: Arc<SshConnection>) -> Self {
        let (this, driver) = Self::unstarted();
        tokio::spawn(drive(channel, connection, driver));
        this
    }

    fn unstarted() -> (Self, Driver) {
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let (ops, ops_rx) = mpsc::channel(OP_QUEUE);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let space = Arc::new(Notify::new());
        let readiness = Readiness::new();
        let write_error = Arc::new(OnceLock::new());

        let driver = Driver {
            inbound: inbound_tx,
            ops: ops_rx,
            space: Arc::clone(&space),
            readiness: readiness.clone(),
            write_error: Arc::clone(&write_error),
            shutdown: shutdown_rx,
        };
        let this = Self {
            inbound,
            partial: None,
            eof: false,
            ops,
            space,
            readiness,
            write_error,
            error_reported: false,
            shutdown: Some(shutdown),
        };
        (this, driver)
    }

    fn write_failure(&self) -> Option<io::Error> {
        self.write_error
            .get()
            .map(|msg| io::Error::new(io::ErrorKind::BrokenPipe, msg.clone()))
    }
}

impl RemoteChannel for SshChannel {
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            let chunk = match self.partial.take() {
                Some(chunk) => chunk,
                None => match self.inbound.try_recv() {
                    Ok(chunk) => chunk,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.eof = true;
                        break;
                    }
                },
            };
            let take = chunk.len().min(buf.len() - n);
            buf[n..n + take].copy_from_slice(&chunk[..take]);
            n += take;
            if take < chunk.len() {
                self.partial = Some(chunk.slice(take..));
            }
        }
        self.space.notify_one();

        if n == 0 {
            return if self.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        // One readiness permit may stand for several chunks, and EOF still
        // has to be reported on a later call.
        if self.partial.is_some() || !self.inbound.is_empty() || self.eof {
            self.readiness.notify_readable();
        }
        Ok(n)
    }

    fn try_send(&mut self, data: &[u8]) -> io::Result<usize> {
        if let Some(e) = self.write_failure() {
            return Err(e);
        }
        let n = data.len().min(MAX_WRITE_CHUNK);
        match self.ops.try_send(Op::Data(Bytes::copy_from_slice(&data[..n]))) {
            Ok(()) => Ok(n),
            Err(TrySendError::Full(_)) => Err(io::ErrorKind::WouldBlock.into()),
            Err(TrySendError::Closed(_)) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn resize(&mut self, rows: u16, cols: u16) -> io::Result<()> {
        match self.ops.try_send(Op::Resize { rows, cols }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(io::ErrorKind::WouldBlock.into()),
            Err(TrySendError::Closed(_)) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    fn take_error(&mut self) -> Option<io::Error> {
        if self.error_reported {
            return None;
        }
        let e = self.write_failure()?;
        self.error_reported = true;
        Some(e)
    }

    fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }
}

struct Driver {
    inbound: mpsc::Sender<Bytes>,
    ops: mpsc::Receiver<Op>,
    space: Arc<Notify>,
    readiness: Readiness,
    write_error: Arc<OnceLock<String>>,
    shutdown: oneshot::Receiver<()>,
}

async fn drive(mut channel: Channel<Msg>, connection: Arc<SshConnection>, mut d: Driver) {
    let endpoint = connection.endpoint().clone();
    loop {
        let has_room = d.inbound.capacity() > 0;
        tokio::select! {
            _ = &mut d.shutdown => break,
            op = d.ops.recv() => match op {
                Some(Op::Data(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        warn!("Write to {endpoint} failed: {e}");
                        let _ = d.write_error.set(e.to_string());
                        d.readiness.notify_fault();
                        break;
                    }
                    d.readiness.notify_writable();
                }
                Some(Op::Resize { rows, cols }) => {
                    if let Err(e) = channel
                        .window_change(u32::from(cols), u32::from(rows), 0, 0)
                        .await
                    {
                        debug!("Resize on {endpoint} failed: {e}");
                    }
                }
                None => break,
            },
            () = d.space.notified(), if !has_room => {}
            msg = channel.wait(), if has_room => match msg {
                Some(ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. }) => {
                    if d.inbound.try_send(Bytes::copy_from_slice(&data)).is_err() {
                        break;
                    }
                    d.readiness.notify_readable();
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Shell on {endpoint} exited with {exit_status}");
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    let _ = channel.close().await;
    // Dropping the sender turns into EOF once the queue is drained.
    drop(d.inbound);
    d.readiness.notify_readable();
    connection.disconnect().await;
    debug!("Shell channel to {endpoint} closed");
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;
    use crate::bridge::io::Interest;

    fn readable(readiness: &Readiness) -> bool {
        readiness.ready(Interest::Read).now_or_never().is_some()
    }

    #[test]
    fn test_recv_carries_partial_chunk() {
        let (mut chan, driver) = SshChannel::unstarted();
        driver.inbound.try_send(Bytes::from_static(b"hello")).unwrap();
        driver.inbound.try_send(Bytes::from_static(b"world")).unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(chan.try_recv(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");

        let mut buf = [0u8; 16];
        let n = chan.try_recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"loworld");
    }

    #[test]
    fn test_recv_would_block_when_empty() {
        let (mut chan, _driver) = SshChannel::unstarted();
        let err = chan.try_recv(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_leftover_data_rearms_readable() {
        let (mut chan, driver) = SshChannel::unstarted();
        let readiness = chan.readiness();
        driver.inbound.try_send(Bytes::from_static(b"hello")).unwrap();
        driver.inbound.try_send(Bytes::from_static(b"world")).unwrap();

        assert_eq!(chan.try_recv(&mut [0u8; 5]).unwrap(), 5);
        assert!(readable(&readiness));

        assert_eq!(chan.try_recv(&mut [0u8; 5]).unwrap(), 5);
        assert!(!readable(&readiness));
    }

    #[test]
    fn test_eof_reported_after_queue_drains() {
        let (mut chan, driver) = SshChannel::unstarted();
        let readiness = chan.readiness();
        driver.inbound.try_send(Bytes::from_static(b"bye")).unwrap();
        drop(driver);

        let mut buf = [0u8; 8];
        assert_eq!(chan.try_recv(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"bye");
        // EOF still owed to the reader.
        assert!(readable(&readiness));
        assert_eq!(chan.try_recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_send_is_capped_per_call() {
        let (mut chan, mut driver) = SshChannel::unstarted();
        let data = vec![7u8; MAX_WRITE_CHUNK * 2 + 5];
        assert_eq!(chan.try_send(&data).unwrap(), MAX_WRITE_CHUNK);
        match driver.ops.try_recv() {
            Ok(Op::Data(bytes)) => assert_eq!(bytes.len(), MAX_WRITE_CHUNK),
            _ => panic!("expected a data op"),
        }
    }

    #[test]
    fn test_full_op_queue_would_block() {
        let (mut chan, _driver) = SshChannel::unstarted();
        for _ in 0..OP_QUEUE {
            chan.try_send(b"x").unwrap();
        }
        let err = chan.try_send(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        let err = chan.resize(24, 80).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_stopped_driver_is_broken_pipe() {
        let (mut chan, driver) = SshChannel::unstarted();
        drop(driver);
        let err = chan.try_send(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let err = chan.resize(24, 80).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_failed_write_surfaces_once() {
        let (mut chan, driver) = SshChannel::unstarted();
        assert!(chan.take_error().is_none());
        driver.write_error.set("channel closed".to_string()).unwrap();

        let err = chan.try_send(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(
            chan.take_error().map(|e| e.kind()),
            Some(io::ErrorKind::BrokenPipe)
        );
        assert!(chan.take_error().is_none());
    }

    #[test]
    fn test_resize_passes_rows_and_cols() {
        let (mut chan, mut driver) = SshChannel::unstarted();
        chan.resize(40, 120).unwrap();
        assert!(matches!(
            driver.ops.try_recv(),
            Ok(Op::Resize { rows: 40, cols: 120 })
        ));
    }

    #[test]
    fn test_close_signals_driver_once() {
        let (mut chan, mut driver) = SshChannel::unstarted();
        chan.close();
        chan.close();
        assert!(driver.shutdown.try_recv().is_ok());
    }
}
