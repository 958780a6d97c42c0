//! Client error types.

use pomelo_protocol::{FramingError, MessageError, ProtocolError, ServerErrorPayload};
use std::time::Duration;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("message error: {0}")]
    Message(#[from] MessageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake rejected by server with code {0}")]
    HandshakeRejected(i32),

    #[error("request {id} to {route} timed out")]
    RequestTimeout { id: u64, route: String },

    #[error("server error: {} - {}", .0.code, .0.msg)]
    Server(ServerErrorPayload),

    #[error("not connected")]
    NotConnected,

    #[error("already connected or connecting")]
    AlreadyConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request cancelled")]
    Cancelled,

    #[error("client disconnected")]
    Disconnected,

    #[error("client closed")]
    Disposed,

    #[error("kicked by server")]
    Kicked,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectTimeout { .. }
                | ClientError::Connect { .. }
                | ClientError::Handshake(_)
                | ClientError::RequestTimeout { .. }
                | ClientError::ConnectionClosed
        )
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Framing(e) => ClientError::Framing(e),
            ProtocolError::Message(e) => ClientError::Message(e),
            ProtocolError::Json(e) => ClientError::Json(e),
            ProtocolError::Decompress(e) => ClientError::Handshake(e.to_string()),
        }
    }
}
