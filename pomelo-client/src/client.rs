//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use crate::routes::PushEvent;
use crate::state::{ConnectionState, NetworkEvent};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// High-level client for Pomelo/Pitaya servers.
#[derive(Clone)]
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Connects and handshakes with the server.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ClientError> {
        self.conn.connect(host, port, Map::new()).await
    }

    /// Connects, sending `user` alongside the handshake `sys` block.
    pub async fn connect_with_user(
        &self,
        host: &str,
        port: u16,
        user: Map<String, Value>,
    ) -> Result<(), ClientError> {
        self.conn.connect(host, port, user).await
    }

    /// Closes the session and stops reconnecting. The client can connect again.
    pub async fn disconnect(&self) {
        self.conn.disconnect().await
    }

    /// Closes the client for good.
    pub async fn close(&self) {
        self.conn.close().await
    }

    /// Resolves once the client has stopped for good: disconnected, closed,
    /// kicked, or failed without reconnect.
    pub async fn stopped(&self) {
        self.conn.stopped().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.conn.watch_state()
    }

    pub fn subscribe_network_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.conn.subscribe_network_events()
    }

    /// Last heartbeat sample in milliseconds.
    pub fn quality(&self) -> i64 {
        self.conn.quality()
    }

    /// Serializer announced by the server, `"json"` until a handshake says otherwise.
    pub fn serializer(&self) -> String {
        self.conn.serializer()
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.conn.heartbeat_interval()
    }

    pub fn pending_count(&self) -> usize {
        self.conn.pending_count()
    }

    /// Fails every in-flight request with `Cancelled`.
    pub fn clear_pending(&self) -> usize {
        self.conn.clear_pending()
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Sends a request and waits for the response, using the configured timeout.
    pub async fn request(&self, route: &str, data: impl Into<Bytes>) -> Result<Bytes, ClientError> {
        let timeout = self.conn.config().request_timeout;
        self.request_with_timeout(route, data, timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        route: &str,
        data: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        let pending = self.conn.send_request(route, data.into(), timeout).await?;
        pending.wait().await
    }

    /// Sends a request and reports the outcome through exactly one of the
    /// callbacks. Must be called from within a tokio runtime.
    pub fn request_callback<S, E>(
        &self,
        route: &str,
        data: impl Into<Bytes>,
        on_success: S,
        on_error: E,
        timeout: Option<Duration>,
    ) where
        S: FnOnce(Bytes) + Send + 'static,
        E: FnOnce(ClientError) + Send + 'static,
    {
        let conn = self.conn.clone();
        let route = route.to_string();
        let data = data.into();
        let timeout = timeout.unwrap_or(conn.config().request_timeout);
        tokio::spawn(async move {
            let result = match conn.send_request(&route, data, timeout).await {
                Ok(pending) => pending.wait().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(body) => on_success(body),
                Err(e) => on_error(e),
            }
        });
    }

    /// Sends a JSON request and decodes the JSON response.
    pub async fn request_json<Req, Resp>(&self, route: &str, body: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let data = serde_json::to_vec(body)?;
        let response = self.request(route, data).await?;
        Ok(serde_json::from_slice(&response)?)
    }

    /// Sends a notify. Nothing comes back.
    pub async fn notify(&self, route: &str, data: impl Into<Bytes>) -> Result<(), ClientError> {
        self.conn.send_notify(route, data.into()).await
    }

    pub async fn notify_json<T>(&self, route: &str, body: &T) -> Result<(), ClientError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_vec(body)?;
        self.notify(route, data).await
    }

    // =========================================================================
    // Push subscriptions
    // =========================================================================

    /// Routes server pushes on `route` to `handler`, replacing any previous one.
    pub fn on_route<F>(&self, route: impl Into<String>, handler: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.conn.routes().on(route, handler)
    }

    pub fn off_route(&self, route: &str) -> bool {
        self.conn.routes().off(route)
    }

    pub fn clear_routes(&self) {
        self.conn.routes().clear()
    }

    /// Receives every push, with or without a route handler.
    pub fn subscribe_pushes(&self) -> broadcast::Receiver<PushEvent> {
        self.conn.routes().subscribe()
    }
}
