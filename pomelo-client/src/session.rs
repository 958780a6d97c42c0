//! Per-connection session: close signal, liveness bookkeeping, task handles.

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `disconnect()` was called.
    Requested,
    /// The client was closed for good.
    Disposed,
    /// The server sent a kick packet.
    Kicked,
    /// The server closed the socket.
    Eof,
    ReadFailed(String),
    WriteFailed(String),
    /// Unrecoverable framing error on the read side.
    Framing(String),
    /// Nothing received for two heartbeat intervals.
    HeartbeatTimeout,
    /// The packet handler exited while the socket was still open.
    HandlerStopped,
}

impl CloseReason {
    /// Whether the control loop may reconnect after this reason.
    pub fn allows_reconnect(&self) -> bool {
        !matches!(
            self,
            CloseReason::Requested | CloseReason::Disposed | CloseReason::Kicked
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("disconnect requested"),
            CloseReason::Disposed => f.write_str("client closed"),
            CloseReason::Kicked => f.write_str("kicked by server"),
            CloseReason::Eof => f.write_str("connection closed by server"),
            CloseReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            CloseReason::WriteFailed(e) => write!(f, "write failed: {}", e),
            CloseReason::Framing(e) => write!(f, "framing error: {}", e),
            CloseReason::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            CloseReason::HandlerStopped => f.write_str("packet handler stopped"),
        }
    }
}

/// One handshaken connection. Every session task watches the same close
/// signal; the first reason recorded wins.
pub struct Session {
    id: u64,
    closed: watch::Sender<Option<CloseReason>>,
    last_received: Mutex<Instant>,
    heartbeat_sent_at: Mutex<Option<Instant>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(id: u64) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            id,
            closed,
            last_received: Mutex::new(Instant::now()),
            heartbeat_sent_at: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Records the close reason. Returns false if the session was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            tracing::debug!(session = self.id, %reason, "session closing");
            *current = Some(reason);
            true
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so this only fails on drop.
        let _ = rx.wait_for(|reason| reason.is_some()).await;
        self.close_reason().unwrap_or(CloseReason::Requested)
    }

    /// Marks that bytes arrived from the server.
    pub fn touch(&self) {
        *self.last_received.lock() = Instant::now();
    }

    pub fn since_last_received(&self) -> Duration {
        self.last_received.lock().elapsed()
    }

    pub fn mark_heartbeat_sent(&self, at: Instant) {
        *self.heartbeat_sent_at.lock() = Some(at);
    }

    /// Takes the send time of the outstanding heartbeat, if any.
    pub fn take_heartbeat_sent(&self) -> Option<Instant> {
        self.heartbeat_sent_at.lock().take()
    }

    pub fn add_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Aborts every session task. Safe to call more than once.
    pub fn abort_tasks(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Signed round-trip quality in milliseconds: heartbeat send time minus
/// response receive time.
pub fn heartbeat_quality(sent_at: Instant, received_at: Instant) -> i64 {
    if received_at >= sent_at {
        -(received_at.duration_since(sent_at).as_millis() as i64)
    } else {
        sent_at.duration_since(received_at).as_millis() as i64
    }
}
