//! Protocol error types.
//!
//! Errors are split in two classes. [`FramingError`] means the byte stream can
//! no longer be trusted and the connection must be torn down. [`MessageError`]
//! is confined to a single packet: the packet is dropped and the connection
//! keeps going.

use thiserror::Error;

/// Malformed outer framing. Always fatal to the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("invalid packet type: {0:#04x}")]
    InvalidPacketType(u8),

    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("invalid packet header: expected {expected} bytes, got {actual}")]
    InvalidPacketHeader { expected: usize, actual: usize },
}

/// Structural problem in a single message. Recoverable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("route not found for code {0}")]
    RouteNotFound(u16),

    #[error("duplicate route dictionary entry: {route} -> {code}")]
    DuplicateRoute { route: String, code: u16 },
}

/// Any protocol-level error, including handshake payload problems.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("message error: {0}")]
    Message(#[from] MessageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("decompression failed: {0}")]
    Decompress(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether this error must close the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::Message(_))
    }
}
