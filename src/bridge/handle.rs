//! The bridge task and the handle request handlers use to talk to it.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::io::ClientPeer;
use super::reactor::{Event, TokioReactor};
use super::session::{NewSession, SessionInfo};
use super::{Bridge, BridgeError, BridgeSettings, SessionId};
use crate::ssh::SshConnection;

/// Requests posted to the bridge task.
pub enum Command {
    Create {
        session: NewSession,
        reply: oneshot::Sender<Result<SessionId, BridgeError>>,
    },
    Attach {
        id: SessionId,
        peer: Weak<dyn ClientPeer>,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    Message {
        id: SessionId,
        text: String,
    },
    Detach {
        id: SessionId,
        reason: String,
    },
    Snapshot {
        reply: oneshot::Sender<BTreeMap<SessionId, SessionInfo>>,
    },
    Transport {
        id: SessionId,
        reply: oneshot::Sender<Option<Arc<SshConnection>>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable entry point into the bridge task.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<Command>,
}

/// Start the bridge task. `queue` bounds the number of commands waiting for
/// it; senders wait when it is full.
pub fn spawn(settings: BridgeSettings, queue: usize) -> (BridgeHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue.max(1));
    let (reactor, events) = TokioReactor::new();
    let bridge = Bridge::new(reactor, settings);
    let task = tokio::spawn(run(bridge, events, rx));
    (BridgeHandle { tx }, task)
}

impl BridgeHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| BridgeError::Unavailable)?;
        rx.await.map_err(|_| BridgeError::Unavailable)
    }

    /// Hand an opened shell to the bridge. Returns the attach id.
    pub async fn create(&self, session: NewSession) -> Result<SessionId, BridgeError> {
        self.request(|reply| Command::Create { session, reply })
            .await?
    }

    pub async fn attach(&self, id: &str, peer: Weak<dyn ClientPeer>) -> Result<(), BridgeError> {
        self.request(|reply| Command::Attach {
            id: id.to_string(),
            peer,
            reply,
        })
        .await?
    }

    /// Forward a browser text frame. Dropped if the bridge is gone.
    pub async fn message(&self, id: &str, text: String) {
        let cmd = Command::Message {
            id: id.to_string(),
            text,
        };
        if self.tx.send(cmd).await.is_err() {
            debug!("Session {id}: bridge gone, message dropped");
        }
    }

    /// The browser went away; close the session with `reason`.
    pub async fn detach(&self, id: &str, reason: &str) {
        let cmd = Command::Detach {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        let _ = self.tx.send(cmd).await;
    }

    pub async fn snapshot(&self) -> BTreeMap<SessionId, SessionInfo> {
        self.request(|reply| Command::Snapshot { reply })
            .await
            .unwrap_or_default()
    }

    /// The SSH connection behind a live session, for file transfer.
    pub async fn transport(&self, id: &str) -> Option<Arc<SshConnection>> {
        self.request(|reply| Command::Transport {
            id: id.to_string(),
            reply,
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn count(&self) -> usize {
        self.request(|reply| Command::Count { reply })
            .await
            .unwrap_or(0)
    }

    /// Close every session and stop the task. Returns once it is done.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }
}

async fn run(
    mut bridge: Bridge<TokioReactor>,
    mut events: mpsc::UnboundedReceiver<Event>,
    mut commands: mpsc::Receiver<Command>,
) {
    info!("Session bridge started");
    loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => dispatch(&mut bridge, event),
            command = commands.recv() => match command {
                Some(command) => {
                    if execute(&mut bridge, command).is_break() {
                        break;
                    }
                }
                None => {
                    stop(&mut bridge);
                    break;
                }
            },
        }
    }
    info!("Session bridge stopped");
}

fn dispatch(bridge: &mut Bridge<TokioReactor>, event: Event) {
    match event {
        Event::Readable(id) => bridge.on_readable(&id),
        Event::Writable(id) => bridge.on_writable(&id),
        Event::Fault(id) => bridge.on_error(&id),
        Event::Timer(key) => {
            if let Some(timer) = bridge.reactor_mut().fire(key) {
                bridge.on_timer(key, timer);
            }
        }
    }
}

/// Apply one command. `Break` once the bridge has been shut down.
fn execute(bridge: &mut Bridge<TokioReactor>, command: Command) -> ControlFlow<()> {
    match command {
        Command::Create { session, reply } => {
            let _ = reply.send(bridge.create(session));
        }
        Command::Attach { id, peer, reply } => {
            let _ = reply.send(bridge.attach(&id, peer));
        }
        Command::Message { id, text } => bridge.on_peer_message(&id, &text),
        Command::Detach { id, reason } => bridge.close(&id, &reason),
        Command::Snapshot { reply } => {
            let _ = reply.send(bridge.snapshot());
        }
        Command::Transport { id, reply } => {
            let _ = reply.send(bridge.transport(&id));
        }
        Command::Count { reply } => {
            let _ = reply.send(bridge.len());
        }
        Command::Shutdown { reply } => {
            stop(bridge);
            let _ = reply.send(());
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

fn stop(bridge: &mut Bridge<TokioReactor>) {
    bridge.shutdown();
    bridge.reactor_mut().shutdown();
}
