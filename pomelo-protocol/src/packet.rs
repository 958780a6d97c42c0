//! Outer packet framing.
//!
//! Packet layout (4 bytes header + payload):
//!
//! ```text
//! +--------+-------------------+------------------+
//! |  type  |      length       |     payload      |
//! | 1 byte | 3 bytes (BE u24)  |  length bytes    |
//! +--------+-------------------+------------------+
//! ```

use crate::error::FramingError;
use crate::{MAX_ENCODABLE_LENGTH, MAX_PACKET_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the packet header in bytes.
pub const HEADER_LENGTH: usize = 4;

/// Packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Handshake = 0x01,
    HandshakeAck = 0x02,
    Heartbeat = 0x03,
    Data = 0x04,
    Kick = 0x05,
}

impl PacketType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Handshake),
            0x02 => Ok(PacketType::HandshakeAck),
            0x03 => Ok(PacketType::Heartbeat),
            0x04 => Ok(PacketType::Data),
            0x05 => Ok(PacketType::Kick),
            other => Err(FramingError::InvalidPacketType(other)),
        }
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    /// Creates a packet with no payload.
    pub fn empty(packet_type: PacketType) -> Self {
        Self::new(packet_type, Bytes::new())
    }

    /// Payload length as carried in the header.
    pub fn length(&self) -> usize {
        self.payload.len()
    }

    /// Encodes the packet into bytes.
    pub fn encode(&self) -> Result<BytesMut, FramingError> {
        encode_packet(self.packet_type, &self.payload)
    }

    /// Decodes one packet from the front of `buf`.
    ///
    /// Returns `Ok(Some(packet))` and consumes its bytes if a complete packet
    /// is buffered, `Ok(None)` if more data is needed, or `Err` on a malformed
    /// header. The header is validated before waiting for the payload, so an
    /// oversized length is rejected without buffering it.
    pub fn decode(buf: &mut BytesMut, max_size: usize) -> Result<Option<Self>, FramingError> {
        if buf.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let (packet_type, length) = parse_header(&buf[..HEADER_LENGTH], max_size)?;

        if buf.len() < HEADER_LENGTH + length {
            return Ok(None);
        }

        buf.advance(HEADER_LENGTH);
        let payload = buf.split_to(length).freeze();

        Ok(Some(Self {
            packet_type,
            payload,
        }))
    }
}

/// Parses and validates a 4-byte packet header.
pub fn parse_header(header: &[u8], max_size: usize) -> Result<(PacketType, usize), FramingError> {
    if header.len() != HEADER_LENGTH {
        return Err(FramingError::InvalidPacketHeader {
            expected: HEADER_LENGTH,
            actual: header.len(),
        });
    }

    let packet_type = PacketType::try_from(header[0])?;
    let length = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;

    if length > max_size {
        return Err(FramingError::PacketTooLarge {
            size: length,
            max: max_size,
        });
    }

    Ok((packet_type, length))
}

/// Encodes a packet header and payload.
pub fn encode_packet(packet_type: PacketType, payload: &[u8]) -> Result<BytesMut, FramingError> {
    if payload.len() > MAX_ENCODABLE_LENGTH {
        return Err(FramingError::PacketTooLarge {
            size: payload.len(),
            max: MAX_ENCODABLE_LENGTH,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + payload.len());
    buf.put_u8(packet_type.as_u8());
    buf.put_uint(payload.len() as u64, 3);
    buf.put_slice(payload);
    Ok(buf)
}

/// Encodes a packet from a raw type byte, validating the type first.
pub fn encode_raw_packet(raw_type: u8, payload: &[u8]) -> Result<BytesMut, FramingError> {
    let packet_type = PacketType::try_from(raw_type)?;
    encode_packet(packet_type, payload)
}

/// Decodes every complete packet at the front of `buf`.
///
/// Consumed bytes are removed from `buf`; a trailing partial packet stays
/// buffered for the next read.
pub fn decode_packets(buf: &mut BytesMut) -> Result<Vec<Packet>, FramingError> {
    let mut packets = Vec::new();
    while let Some(packet) = Packet::decode(buf, MAX_PACKET_SIZE)? {
        packets.push(packet);
    }
    Ok(packets)
}
