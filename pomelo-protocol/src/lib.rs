//! # pomelo-protocol
//!
//! Wire protocol implementation for Pomelo/Pitaya servers.
//!
//! This crate provides:
//! - Packet framing (1 byte type + 3 byte big-endian length)
//! - Message encoding with varint ids and route-dictionary compression
//! - zlib/gzip payload compression helpers
//! - Handshake payload types
//! - Fatal (framing) and recoverable (message) error classes

pub mod codec;
pub mod compression;
pub mod error;
pub mod handshake;
pub mod message;
pub mod packet;
pub mod route;

pub use codec::{MessageCodec, PacketDecoder};
pub use error::{FramingError, MessageError, ProtocolError};
pub use handshake::{ClientHandshake, ClientSys, HandshakeData, ServerSys, MAX_HEARTBEAT_SECS};
pub use message::{Message, MessageType, ServerErrorPayload};
pub use packet::{
    decode_packets, encode_packet, encode_raw_packet, parse_header, Packet, PacketType,
    HEADER_LENGTH,
};
pub use route::RouteDictionary;

/// Maximum packet payload size (16 MiB).
pub const MAX_PACKET_SIZE: usize = 1 << 24;

/// Largest length the 3-byte header field can carry.
pub const MAX_ENCODABLE_LENGTH: usize = MAX_PACKET_SIZE - 1;

/// Default serializer name announced by Pitaya servers.
pub const DEFAULT_SERIALIZER: &str = "json";
