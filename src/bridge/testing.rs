//! In-memory stand-ins for the remote channel, the browser peer and the
//! reactor, shared by the bridge tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;

use super::io::{ClientPeer, Interest, PeerGone, Readiness, RemoteChannel};
use super::reactor::{Reactor, Timer, TimerKey};
use super::BridgeSettings;

pub fn settings() -> BridgeSettings {
    BridgeSettings {
        attach_grace: Duration::from_secs(2),
        write_retry: Duration::from_millis(100),
        recv_buffer_size: 64 * 1024,
    }
}

#[derive(Default)]
struct ChannelState {
    inbound: VecDeque<Result<Vec<u8>, io::ErrorKind>>,
    eof: bool,
    write_errors: VecDeque<io::ErrorKind>,
    late_error: Option<io::ErrorKind>,
    accept_limit: Option<usize>,
    sent: Vec<u8>,
    resizes: Vec<(u16, u16)>,
    resize_fails: bool,
    closes: usize,
}

/// Scripted [`RemoteChannel`]. Reads return queued chunks, then would-block
/// (or EOF once [`ChannelProbe::set_eof`] is called).
pub struct FakeChannel {
    state: Arc<Mutex<ChannelState>>,
    readiness: Readiness,
}

/// Test-side handle onto a [`FakeChannel`] that has been moved into a session.
#[derive(Clone)]
pub struct ChannelProbe {
    state: Arc<Mutex<ChannelState>>,
    readiness: Readiness,
}

impl FakeChannel {
    pub fn new() -> (Self, ChannelProbe) {
        let state = Arc::new(Mutex::new(ChannelState::default()));
        let readiness = Readiness::new();
        (
            Self {
                state: Arc::clone(&state),
                readiness: readiness.clone(),
            },
            ChannelProbe { state, readiness },
        )
    }
}

impl RemoteChannel for FakeChannel {
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        match state.inbound.pop_front() {
            Some(Ok(mut chunk)) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    state.inbound.push_front(Ok(chunk.split_off(n)));
                }
                Ok(n)
            }
            Some(Err(kind)) => Err(io::Error::from(kind)),
            None if state.eof => Ok(0),
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn try_send(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.write_errors.pop_front() {
            return Err(io::Error::from(kind));
        }
        let n = state.accept_limit.map_or(data.len(), |limit| limit.min(data.len()));
        state.sent.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn resize(&mut self, rows: u16, cols: u16) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.resize_fails {
            return Err(io::Error::new(io::ErrorKind::Other, "window-change refused"));
        }
        state.resizes.push((rows, cols));
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closes += 1;
    }

    fn take_error(&mut self) -> Option<io::Error> {
        self.state.lock().unwrap().late_error.take().map(io::Error::from)
    }

    fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }
}

impl ChannelProbe {
    /// Queue inbound bytes and raise read readiness.
    pub fn push_inbound(&self, data: &[u8]) {
        self.state.lock().unwrap().inbound.push_back(Ok(data.to_vec()));
        self.readiness.notify_readable();
    }

    pub fn push_read_error(&self, kind: io::ErrorKind) {
        self.state.lock().unwrap().inbound.push_back(Err(kind));
        self.readiness.notify_readable();
    }

    pub fn push_write_error(&self, kind: io::ErrorKind) {
        self.state.lock().unwrap().write_errors.push_back(kind);
    }

    /// Fail a write that was already accepted, and raise a fault.
    pub fn fail_accepted_write(&self, kind: io::ErrorKind) {
        self.state.lock().unwrap().late_error = Some(kind);
        self.readiness.notify_fault();
    }

    pub fn set_eof(&self) {
        self.state.lock().unwrap().eof = true;
        self.readiness.notify_readable();
    }

    pub fn set_accept_limit(&self, limit: Option<usize>) {
        self.state.lock().unwrap().accept_limit = limit;
    }

    pub fn fail_resize(&self) {
        self.state.lock().unwrap().resize_fails = true;
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    pub fn sent(&self) -> Vec<u8> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.state.lock().unwrap().resizes.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

/// Recording [`ClientPeer`].
pub struct FakePeer {
    frames: Mutex<Vec<Vec<u8>>>,
    closes: Mutex<Vec<String>>,
    hung_up: AtomicBool,
}

impl FakePeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            hung_up: AtomicBool::new(false),
        })
    }

    pub fn weak(peer: &Arc<Self>) -> Weak<dyn ClientPeer> {
        Arc::downgrade(peer) as Weak<dyn ClientPeer>
    }

    /// Make further sends fail as if the socket were already gone.
    pub fn hang_up(&self) {
        self.hung_up.store(true, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.closes.lock().unwrap().clone()
    }
}

impl ClientPeer for FakePeer {
    fn send_binary(&self, data: Bytes) -> Result<(), PeerGone> {
        if self.hung_up.load(Ordering::SeqCst) {
            return Err(PeerGone);
        }
        self.frames.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn close(&self, reason: &str) {
        self.closes.lock().unwrap().push(reason.to_string());
    }

    fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }
}

/// [`Reactor`] that only records what it was asked to do. Timers fire when
/// the test says so.
#[derive(Default)]
pub struct FakeReactor {
    pub interests: HashMap<String, Interest>,
    pub registrations: usize,
    pub deregistrations: usize,
    pub timers: Vec<(TimerKey, Duration, Timer)>,
    pub cancelled: Vec<TimerKey>,
    pub fail_register: bool,
    next_key: u64,
}

impl FakeReactor {
    /// A reactor whose `register` always fails.
    pub fn failing() -> Self {
        Self {
            fail_register: true,
            ..Self::default()
        }
    }

    pub fn interest_of(&self, id: &str) -> Option<Interest> {
        self.interests.get(id).copied()
    }

    /// The most recent live timer matching `timer`.
    pub fn pending(&self, timer: &Timer) -> Option<TimerKey> {
        self.timers
            .iter()
            .rev()
            .find(|(key, _, t)| t == timer && !self.cancelled.contains(key))
            .map(|(key, _, _)| *key)
    }
}

impl Reactor for FakeReactor {
    fn register(&mut self, id: &str, _source: Readiness, interest: Interest) -> io::Result<()> {
        if self.fail_register {
            return Err(io::Error::new(io::ErrorKind::Other, "no more watchers"));
        }
        self.registrations += 1;
        self.interests.insert(id.to_string(), interest);
        Ok(())
    }

    fn reregister(&mut self, id: &str, interest: Interest) {
        if let Some(current) = self.interests.get_mut(id) {
            *current = interest;
        }
    }

    fn deregister(&mut self, id: &str) {
        if self.interests.remove(id).is_some() {
            self.deregistrations += 1;
        }
    }

    fn schedule_after(&mut self, delay: Duration, timer: Timer) -> TimerKey {
        self.next_key += 1;
        let key = TimerKey(self.next_key);
        self.timers.push((key, delay, timer));
        key
    }

    fn cancel(&mut self, key: TimerKey) {
        if !self.cancelled.contains(&key) {
            self.cancelled.push(key);
        }
    }
}
