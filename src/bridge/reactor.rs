//! Readiness reactor: interest registration plus one-shot timers.
//!
//! [`Reactor`] is the seam the session state machine talks to. [`TokioReactor`]
//! implements it on top of the tokio runtime: each registered channel gets a
//! small watcher task that waits on the channel's [`Readiness`] for the
//! current [`Interest`], and each timer is a sleeping task. Both only *post*
//! an [`Event`] to the bridge task; they never touch session state.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use super::io::{Interest, Readiness};
use super::SessionId;

/// Handle to a scheduled timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(pub u64);

/// What a timer does when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer {
    /// Re-run the write attempt of a session with pending outbound bytes.
    RetryWrite(SessionId),
    /// Reclaim a session if no browser has attached yet.
    Reap(SessionId),
}

/// Registration and scheduling interface used by sessions.
pub trait Reactor {
    /// Start delivering readiness for `source` under `id`.
    fn register(&mut self, id: &str, source: Readiness, interest: Interest) -> io::Result<()>;

    /// Switch an existing registration to another interest.
    fn reregister(&mut self, id: &str, interest: Interest);

    /// Stop delivering readiness for `id`. No-op if not registered.
    fn deregister(&mut self, id: &str);

    fn schedule_after(&mut self, delay: Duration, timer: Timer) -> TimerKey;

    /// Cancel a timer. No-op if it already fired.
    fn cancel(&mut self, key: TimerKey);
}

/// Notifications posted to the bridge task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Readable(SessionId),
    Writable(SessionId),
    Fault(SessionId),
    Timer(TimerKey),
}

struct Watcher {
    interest: watch::Sender<Interest>,
    task: JoinHandle<()>,
}

/// Tokio-backed [`Reactor`].
pub struct TokioReactor {
    events: mpsc::UnboundedSender<Event>,
    watchers: HashMap<SessionId, Watcher>,
    timers: HashMap<TimerKey, (Timer, JoinHandle<()>)>,
    next_key: u64,
}

impl TokioReactor {
    /// Create a reactor and the receiving end of its event stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                watchers: HashMap::new(),
                timers: HashMap::new(),
                next_key: 0,
            },
            rx,
        )
    }

    /// Claim a timer whose [`Event::Timer`] arrived. `None` means it was
    /// cancelled while the event was in flight.
    pub fn fire(&mut self, key: TimerKey) -> Option<Timer> {
        self.timers.remove(&key).map(|(timer, _)| timer)
    }

    pub fn registered(&self) -> usize {
        self.watchers.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Abort every watcher and timer.
    pub fn shutdown(&mut self) {
        for (_, watcher) in self.watchers.drain() {
            watcher.task.abort();
        }
        for (_, (_, task)) in self.timers.drain() {
            task.abort();
        }
    }
}

impl Reactor for TokioReactor {
    fn register(&mut self, id: &str, source: Readiness, interest: Interest) -> io::Result<()> {
        if self.watchers.contains_key(id) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{id} is already registered"),
            ));
        }
        let (interest_tx, interest_rx) = watch::channel(interest);
        let task = tokio::spawn(watch_readiness(
            id.to_string(),
            source,
            interest_rx,
            self.events.clone(),
        ));
        self.watchers.insert(
            id.to_string(),
            Watcher {
                interest: interest_tx,
                task,
            },
        );
        debug!("Registered {id} for {interest:?}");
        Ok(())
    }

    fn reregister(&mut self, id: &str, interest: Interest) {
        if let Some(watcher) = self.watchers.get(id) {
            watcher.interest.send_replace(interest);
            debug!("Reregistered {id} for {interest:?}");
        }
    }

    fn deregister(&mut self, id: &str) {
        if let Some(watcher) = self.watchers.remove(id) {
            watcher.task.abort();
            debug!("Deregistered {id}");
        }
    }

    fn schedule_after(&mut self, delay: Duration, timer: Timer) -> TimerKey {
        self.next_key += 1;
        let key = TimerKey(self.next_key);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Timer(key));
        });
        self.timers.insert(key, (timer, task));
        key
    }

    fn cancel(&mut self, key: TimerKey) {
        if let Some((_, task)) = self.timers.remove(&key) {
            task.abort();
        }
    }
}

/// Per-registration task: turns readiness notifications into events for the
/// current interest. Ends when deregistered or the bridge task is gone.
async fn watch_readiness(
    id: SessionId,
    source: Readiness,
    mut interest: watch::Receiver<Interest>,
    events: mpsc::UnboundedSender<Event>,
) {
    loop {
        let current = *interest.borrow_and_update();
        let event = tokio::select! {
            changed = interest.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            () = source.faulted() => Event::Fault(id.clone()),
            () = source.ready(current) => match current {
                Interest::Read => Event::Readable(id.clone()),
                Interest::Write => Event::Writable(id.clone()),
            },
        };
        if events.send(event).is_err() {
            return;
        }
    }
}
