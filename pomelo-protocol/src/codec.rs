//! Stream decoder for packets and the message codec bound to a route
//! dictionary.

use crate::error::{FramingError, MessageError, ProtocolError};
use crate::message::Message;
use crate::packet::{encode_packet, Packet, PacketType};
use crate::route::RouteDictionary;
use crate::MAX_PACKET_SIZE;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

/// Accumulates raw bytes from the socket and yields complete packets.
pub struct PacketDecoder {
    buffer: BytesMut,
    max_packet_size: usize,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::with_max_packet_size(MAX_PACKET_SIZE)
    }

    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_packet_size,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next packet from the buffer.
    pub fn decode_packet(&mut self) -> Result<Option<Packet>, FramingError> {
        Packet::decode(&mut self.buffer, self.max_packet_size)
    }

    /// Decodes every complete packet currently buffered.
    pub fn decode_all(&mut self) -> Result<Vec<Packet>, FramingError> {
        let mut packets = Vec::new();
        while let Some(packet) = self.decode_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes and decodes messages against a shared route dictionary.
#[derive(Clone)]
pub struct MessageCodec {
    dictionary: Arc<RouteDictionary>,
    data_compression: bool,
}

impl MessageCodec {
    pub fn new(dictionary: Arc<RouteDictionary>) -> Self {
        Self {
            dictionary,
            data_compression: false,
        }
    }

    /// Enables deflating outgoing payloads when it makes them smaller.
    pub fn with_data_compression(mut self, enabled: bool) -> Self {
        self.data_compression = enabled;
        self
    }

    pub fn dictionary(&self) -> &Arc<RouteDictionary> {
        &self.dictionary
    }

    pub fn encode(&self, message: &Message) -> Result<BytesMut, MessageError> {
        message.encode(&self.dictionary, self.data_compression)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Message, MessageError> {
        Message::decode(data, &self.dictionary)
    }

    /// Encodes a message and wraps it in a Data packet.
    pub fn encode_data_packet(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        let body = self.encode(message)?;
        Ok(encode_packet(PacketType::Data, &body)?.freeze())
    }
}
