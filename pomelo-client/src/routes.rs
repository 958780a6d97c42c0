//! Push handlers keyed by route.

use bytes::Bytes;
use dashmap::DashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Callback invoked with the body of a server push.
pub type PushHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Capacity of the catch-all push channel.
const PUSH_CHANNEL_CAPACITY: usize = 256;

/// A server push, as seen by catch-all subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub route: String,
    pub data: Bytes,
}

/// Route → handler registry. At most one handler per route; registering
/// again replaces it.
pub struct RouteHandlers {
    handlers: DashMap<String, PushHandler>,
    pushes: broadcast::Sender<PushEvent>,
}

impl RouteHandlers {
    pub fn new() -> Self {
        let (pushes, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        Self {
            handlers: DashMap::new(),
            pushes,
        }
    }

    pub fn on<F>(&self, route: impl Into<String>, handler: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let route = route.into();
        if self.handlers.insert(route.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(%route, "replaced push handler");
        }
    }

    /// Returns whether a handler was removed.
    pub fn off(&self, route: &str) -> bool {
        self.handlers.remove(route).is_some()
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }

    pub fn contains(&self, route: &str) -> bool {
        self.handlers.contains_key(route)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Receives every push regardless of route handlers.
    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.pushes.subscribe()
    }

    /// Delivers a push. Returns whether a route handler ran.
    pub fn dispatch(&self, route: &str, data: Bytes) -> bool {
        // Clone out so the handler runs without holding the shard lock.
        let handler = self.handlers.get(route).map(|h| Arc::clone(h.value()));

        let _ = self.pushes.send(PushEvent {
            route: route.to_string(),
            data: data.clone(),
        });

        match handler {
            Some(handler) => {
                if panic::catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
                    tracing::error!(%route, "push handler panicked");
                }
                true
            }
            None => {
                tracing::debug!(%route, "no handler for push");
                false
            }
        }
    }
}

impl Default for RouteHandlers {
    fn default() -> Self {
        Self::new()
    }
}
