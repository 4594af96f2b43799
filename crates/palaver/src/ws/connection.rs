//! Connection-side plumbing: ids, handles, and the socket write loop.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::SinkExt;
use futures::stream::SplitSink;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Process-unique identifier for one live socket. A principal reconnecting
/// gets a fresh id; two tabs of the same principal hold two ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cheap-clone reference to a live connection: its id, its authenticated
/// principal, and the bounded outbound queue. The hub and rooms hold these
/// instead of the socket, so teardown is just removing the id from their
/// indices.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    principal: Arc<str>,
    outbound: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(principal: &str, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id: ConnectionId::next(),
            principal: Arc::from(principal),
            outbound,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Enqueue a frame without waiting. Returns `false` when the frame was
    /// not queued: the queue is full (slow consumer loses this frame) or
    /// the connection is going away.
    pub fn enqueue(&self, frame: Bytes) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    /// First-teardown guard. Returns `true` exactly once.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

/// Drain the outbound queue into the socket, coalescing whatever is already
/// queued into a single newline-separated frame, and probe liveness on the
/// heartbeat interval. Exits on any write failure or once the queue closes.
pub(crate) async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Bytes>,
    heartbeat: Duration,
) {
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // queue closed by teardown
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let Some(text) = coalesce(frame, &mut outbound) else {
                    continue;
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    debug!("liveness probe failed, stopping writer");
                    break;
                }
            }
        }
    }
}

/// Join the first frame with everything else already sitting in the queue.
/// One transport write instead of one per message; the separator mirrors
/// the one clients already split on.
fn coalesce(first: Bytes, outbound: &mut mpsc::Receiver<Bytes>) -> Option<Utf8Bytes> {
    let mut buf = Vec::from(first);
    while let Ok(next) = outbound.try_recv() {
        buf.push(b'\n');
        buf.extend_from_slice(&next);
    }
    match String::from_utf8(buf) {
        Ok(text) => Some(text.into()),
        Err(err) => {
            warn!("dropping non-utf8 outbound frame: {err}");
            None
        }
    }
}
