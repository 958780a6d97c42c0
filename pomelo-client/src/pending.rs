//! Outstanding request table and timeout reaper.

use crate::error::ClientError;
use crate::session::Session;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

/// Outcome delivered to the requester.
pub type RequestResult = Result<Bytes, ClientError>;

/// A request waiting for its response.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub route: String,
    pub sent_at: Instant,
    pub timeout: Duration,
    completion: oneshot::Sender<RequestResult>,
}

impl PendingRequest {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.sent_at) > self.timeout
    }

    /// Delivers the outcome. The requester may have stopped waiting.
    fn complete(self, result: RequestResult) {
        if self.completion.send(result).is_err() {
            tracing::trace!(id = self.id, "requester dropped before completion");
        }
    }
}

/// Requests keyed by message id.
///
/// An entry leaves the table exactly once, either through a response or
/// through the reaper, so a callback can never fire twice.
#[derive(Debug, Default)]
pub struct PendingTable {
    requests: Mutex<HashMap<u64, PendingRequest>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request sent now.
    pub fn insert(
        &self,
        id: u64,
        route: impl Into<String>,
        timeout: Duration,
    ) -> oneshot::Receiver<RequestResult> {
        self.insert_at(id, route, timeout, Instant::now())
    }

    pub fn insert_at(
        &self,
        id: u64,
        route: impl Into<String>,
        timeout: Duration,
        sent_at: Instant,
    ) -> oneshot::Receiver<RequestResult> {
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest {
            id,
            route: route.into(),
            sent_at,
            timeout,
            completion: tx,
        };
        if self.requests.lock().insert(id, request).is_some() {
            tracing::warn!(id, "replaced pending request with duplicate id");
        }
        rx
    }

    /// Removes an entry without completing it.
    pub fn take(&self, id: u64) -> Option<PendingRequest> {
        self.requests.lock().remove(&id)
    }

    /// Completes the request with `result`. Returns false when no such
    /// request is pending (already timed out, or never sent).
    pub fn complete(&self, id: u64, result: RequestResult) -> bool {
        match self.take(id) {
            Some(request) => {
                request.complete(result);
                true
            }
            None => false,
        }
    }

    /// Times out every request older than its deadline at `now`.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let expired: Vec<PendingRequest> = {
            let mut requests = self.requests.lock();
            let ids: Vec<u64> = requests
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.id)
                .collect();
            ids.iter().filter_map(|id| requests.remove(id)).collect()
        };

        let count = expired.len();
        for request in expired {
            tracing::debug!(id = request.id, route = %request.route, "request timed out");
            let err = ClientError::RequestTimeout {
                id: request.id,
                route: request.route.clone(),
            };
            request.complete(Err(err));
        }
        count
    }

    /// Completes every pending request with the error `make_err` builds.
    pub fn fail_all(&self, make_err: impl Fn() -> ClientError) -> usize {
        let drained: Vec<PendingRequest> = self.requests.lock().drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for request in drained {
            request.complete(Err(make_err()));
        }
        count
    }

    /// Drops all pending requests, failing them with `Cancelled`.
    pub fn clear(&self) -> usize {
        self.fail_all(|| ClientError::Cancelled)
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

/// Sweeps the table every `tick` until the session closes.
pub async fn run_reaper(table: Arc<PendingTable>, tick: Duration, session: Arc<Session>) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = session.closed() => break,
        }
        let reaped = table.reap_expired(Instant::now());
        if reaped > 0 {
            tracing::debug!(session = session.id(), reaped, "reaped timed out requests");
        }
    }
}
