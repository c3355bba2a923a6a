//! WebSocket transport between a browser terminal and its session.
//!
//! ## Connection lifecycle
//!
//! 1. `POST /` opens the SSH shell and returns a session id.
//! 2. The browser connects to `GET /ws?id=<session id>` within the attach
//!    window. The socket is closed right away with a reason if the id is
//!    missing (`id is missing`), unknown (`Websocket authentication
//!    failed.`) or already taken (`Websocket already attached.`).
//! 3. Text frames are terminal input (`{"data": ...}`) and size changes
//!    (`{"resize": [cols, rows]}`). Binary frames from the browser are
//!    ignored.
//! 4. Shell output arrives as binary frames carrying the raw remote bytes.
//! 5. When either side goes away the other is closed. A browser close ends
//!    the session with the browser's close reason, or `client disconnected`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, info, warn};

use crate::bridge::io::{ClientPeer, PeerGone};
use crate::util::client_addr;
use crate::AppState;

pub const REASON_ID_MISSING: &str = "id is missing";
pub const REASON_CLIENT_DISCONNECTED: &str = "client disconnected";

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// Session id returned by `POST /`.
    pub id: Option<String>,
}

/// `GET /ws?id=<session id>` - WebSocket upgrade handler.
///
/// The upgrade always succeeds; attach failures are reported as the close
/// reason so browser clients can show them.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let addr = client_addr(&headers, peer);
    ws.on_upgrade(move |socket| handle_ws(socket, state, query.id, addr))
}

enum Outgoing {
    Binary(Bytes),
    Close(String),
}

/// The browser side of a session, as seen by the bridge.
///
/// Frames are queued to the socket's send task, so the bridge never waits on
/// a slow browser. The queue is bounded: a browser that stops reading is
/// reported as gone, and its socket is closed ahead of the backlog.
pub struct WsPeer {
    tx: mpsc::Sender<Outgoing>,
    evict: Mutex<Option<oneshot::Sender<String>>>,
    addr: SocketAddr,
}

/// Receiving ends of a [`WsPeer`], owned by the send task.
struct PeerQueue {
    frames: mpsc::Receiver<Outgoing>,
    evict: oneshot::Receiver<String>,
}

impl WsPeer {
    fn new(addr: SocketAddr, capacity: usize) -> (Self, PeerQueue) {
        let (tx, frames) = mpsc::channel(capacity.max(1));
        let (evict_tx, evict) = oneshot::channel();
        let peer = Self {
            tx,
            evict: Mutex::new(Some(evict_tx)),
            addr,
        };
        (peer, PeerQueue { frames, evict })
    }
}

impl ClientPeer for WsPeer {
    fn send_binary(&self, data: Bytes) -> Result<(), PeerGone> {
        match self.tx.try_send(Outgoing::Binary(data)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Websocket {}: send queue full, dropping browser", self.addr);
                Err(PeerGone)
            }
            Err(TrySendError::Closed(_)) => Err(PeerGone),
        }
    }

    fn close(&self, reason: &str) {
        let queued = self.tx.try_send(Outgoing::Close(reason.to_string()));
        if let Err(TrySendError::Full(_)) = queued {
            let evict = self.evict.lock().ok().and_then(|mut slot| slot.take());
            if let Some(evict) = evict {
                let _ = evict.send(reason.to_string());
            }
        }
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }
}

async fn close_socket(sink: &mut SplitSink<WebSocket, Message>, reason: &str) {
    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: reason.into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

/// Resolves on each ping tick, or never when pings are off.
async fn next_ping(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn handle_ws(socket: WebSocket, state: AppState, id: Option<String>, addr: SocketAddr) {
    let (mut sink, mut stream) = socket.split();

    let Some(id) = id.filter(|id| !id.is_empty()) else {
        warn!("Websocket from {addr} without a session id");
        close_socket(&mut sink, REASON_ID_MISSING).await;
        return;
    };

    let (peer, mut queue) = WsPeer::new(addr, state.config.server.ws_send_queue);
    let peer = Arc::new(peer);
    let weak: Weak<dyn ClientPeer> = Arc::downgrade(&peer) as Weak<dyn ClientPeer>;
    if let Err(e) = state.bridge.attach(&id, weak).await {
        warn!("Websocket from {addr} rejected for session {id}: {e}");
        close_socket(&mut sink, &e.to_string()).await;
        return;
    }
    info!("Websocket {addr} attached to session {id}");

    let ping_secs = state.config.server.ws_ping_interval_secs;
    let mut ticker = (ping_secs > 0).then(|| {
        let period = Duration::from_secs(ping_secs);
        interval_at(Instant::now() + period, period)
    });

    // Task: forward bridge output to the socket
    let mut send_task = tokio::spawn(async move {
        loop {
            let out = tokio::select! {
                biased;
                evicted = &mut queue.evict => {
                    if let Ok(reason) = evicted {
                        close_socket(&mut sink, &reason).await;
                    }
                    break;
                }
                out = queue.frames.recv() => out,
                () = next_ping(&mut ticker) => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };
            match out {
                Some(Outgoing::Binary(data)) => {
                    if sink.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Close(reason)) => {
                    close_socket(&mut sink, &reason).await;
                    break;
                }
                None => break,
            }
        }
    });

    let reason = loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.bridge.message(&id, text.as_str().to_string()).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|r| !r.is_empty());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Websocket {addr} read error: {e}");
                    break None;
                }
                None => break None,
            },
            // Session side closed the socket
            _ = &mut send_task => break None,
        }
    };

    state
        .bridge
        .detach(&id, reason.as_deref().unwrap_or(REASON_CLIENT_DISCONNECTED))
        .await;
    send_task.abort();
    drop(peer);
    info!("Websocket {addr} for session {id} closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn test_peer_queues_frames_until_dropped() {
        let (peer, mut queue) = WsPeer::new(addr(), 8);
        peer.send_binary(Bytes::from_static(b"hi")).unwrap();
        peer.close("remote eof");
        assert!(matches!(queue.frames.try_recv(), Ok(Outgoing::Binary(b)) if b == "hi"));
        assert!(matches!(queue.frames.try_recv(), Ok(Outgoing::Close(r)) if r == "remote eof"));

        drop(queue);
        assert_eq!(peer.send_binary(Bytes::from_static(b"x")), Err(PeerGone));
    }

    #[test]
    fn test_full_queue_drops_browser_and_evicts() {
        let (peer, mut queue) = WsPeer::new(addr(), 2);
        peer.send_binary(Bytes::from_static(b"a")).unwrap();
        peer.send_binary(Bytes::from_static(b"b")).unwrap();
        assert_eq!(peer.send_binary(Bytes::from_static(b"c")), Err(PeerGone));

        // No room for the close frame: it skips the backlog.
        peer.close("peer closed");
        assert_eq!(queue.evict.try_recv().unwrap(), "peer closed");
        assert!(matches!(queue.frames.try_recv(), Ok(Outgoing::Binary(b)) if b == "a"));
        assert!(matches!(queue.frames.try_recv(), Ok(Outgoing::Binary(b)) if b == "b"));
        assert!(queue.frames.try_recv().is_err());
    }
}
