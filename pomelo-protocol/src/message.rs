//! Inner message layer carried by Data packets.
//!
//! Message layout:
//!
//! ```text
//! +--------+-----------------+-------------------------------+---------+
//! |  flag  | id (varint)     | route                         | payload |
//! | 1 byte | Request/Response| code (2 bytes BE) or          |  rest   |
//! |        | only            | len (1 byte) + UTF-8 bytes    |         |
//! +--------+-----------------+-------------------------------+---------+
//! ```
//!
//! Flag bits: `type << 1` (3 bits), `0x01` route compressed, `0x10` payload
//! compressed, `0x20` error.

use crate::compression;
use crate::error::MessageError;
use crate::route::RouteDictionary;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MSG_ROUTE_COMPRESS_MASK: u8 = 0x01;
pub const MSG_TYPE_MASK: u8 = 0x07;
pub const GZIP_MASK: u8 = 0x10;
pub const ERROR_MASK: u8 = 0x20;

/// Minimum encoded message length: flag byte plus one more byte.
pub const MSG_HEAD_LENGTH: usize = 2;

/// Longest inline route (1-byte length prefix).
pub const MAX_INLINE_ROUTE_LENGTH: usize = u8::MAX as usize;

/// A u64 varint never needs more than 10 bytes.
const MAX_VARINT_LENGTH: usize = 10;

/// Message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    Notify = 0x01,
    Response = 0x02,
    Push = 0x03,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Request and Response carry a correlation id.
    pub fn has_id(self) -> bool {
        matches!(self, MessageType::Request | MessageType::Response)
    }

    /// Request, Notify and Push carry a route.
    pub fn is_routable(self) -> bool {
        matches!(
            self,
            MessageType::Request | MessageType::Notify | MessageType::Push
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageType::Request),
            0x01 => Ok(MessageType::Notify),
            0x02 => Ok(MessageType::Response),
            0x03 => Ok(MessageType::Push),
            other => Err(MessageError::InvalidMessageType(other)),
        }
    }
}

/// An application-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    /// Correlation id. Meaningful only for Request and Response.
    pub id: u64,
    /// Handler route. Empty for Response.
    pub route: String,
    /// Server-reported error.
    pub error: bool,
    /// Payload is zlib/gzip compressed on the wire.
    pub compressed: bool,
    pub data: Bytes,
}

impl Message {
    fn new(message_type: MessageType, id: u64, route: String, data: Bytes) -> Self {
        Self {
            message_type,
            id,
            route,
            error: false,
            compressed: false,
            data,
        }
    }

    pub fn request(id: u64, route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Request, id, route.into(), data.into())
    }

    pub fn notify(route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Notify, 0, route.into(), data.into())
    }

    pub fn response(id: u64, data: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Response, id, String::new(), data.into())
    }

    pub fn push(route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Push, 0, route.into(), data.into())
    }

    pub fn with_error(mut self) -> Self {
        self.error = true;
        self
    }

    /// Marks `data` as already compressed by the caller.
    pub fn with_compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    /// Encodes the message.
    ///
    /// Routes present in `dictionary` are written as their 2-byte code. When
    /// `data_compression` is set the payload is deflated and the compressed
    /// form is used only if it is smaller.
    pub fn encode(
        &self,
        dictionary: &RouteDictionary,
        data_compression: bool,
    ) -> Result<BytesMut, MessageError> {
        let mut flag = self.message_type.as_u8() << 1;
        if self.error {
            flag |= ERROR_MASK;
        }

        let route_code = if self.message_type.is_routable() {
            dictionary.code_of(&self.route)
        } else {
            None
        };
        if route_code.is_some() {
            flag |= MSG_ROUTE_COMPRESS_MASK;
        }

        let mut payload = self.data.clone();
        if self.compressed {
            flag |= GZIP_MASK;
        } else if data_compression && !payload.is_empty() {
            let deflated = compression::deflate(&payload)
                .map_err(|_| MessageError::InvalidMessage("payload compression failed"))?;
            if deflated.len() < payload.len() {
                payload = Bytes::from(deflated);
                flag |= GZIP_MASK;
            }
        }

        let capacity = 1 + MAX_VARINT_LENGTH + 3 + self.route.len() + payload.len();
        let mut buf = BytesMut::with_capacity(capacity);
        buf.put_u8(flag);

        if self.message_type.has_id() {
            put_varint(&mut buf, self.id);
        }

        if self.message_type.is_routable() {
            match route_code {
                Some(code) => buf.put_u16(code),
                None => {
                    let route = self.route.as_bytes();
                    if route.len() > MAX_INLINE_ROUTE_LENGTH {
                        return Err(MessageError::InvalidMessage("route longer than 255 bytes"));
                    }
                    buf.put_u8(route.len() as u8);
                    buf.put_slice(route);
                }
            }
        }

        buf.put_slice(&payload);
        Ok(buf)
    }

    /// Decodes a message, resolving compressed routes through `dictionary`
    /// and inflating a compressed payload.
    pub fn decode(data: &[u8], dictionary: &RouteDictionary) -> Result<Self, MessageError> {
        if data.len() < MSG_HEAD_LENGTH {
            return Err(MessageError::InvalidMessage("message shorter than header"));
        }

        let flag = data[0];
        let mut offset = 1;

        let message_type = MessageType::try_from((flag >> 1) & MSG_TYPE_MASK)?;

        let id = if message_type.has_id() {
            let (id, read) = read_varint(&data[offset..])?;
            offset += read;
            id
        } else {
            0
        };

        let route = if message_type.is_routable() {
            if flag & MSG_ROUTE_COMPRESS_MASK != 0 {
                if offset + 2 > data.len() {
                    return Err(MessageError::InvalidMessage("truncated route code"));
                }
                let code = u16::from_be_bytes([data[offset], data[offset + 1]]);
                offset += 2;
                dictionary
                    .route_of(code)
                    .ok_or(MessageError::RouteNotFound(code))?
            } else {
                if offset >= data.len() {
                    return Err(MessageError::InvalidMessage("missing route length"));
                }
                let len = data[offset] as usize;
                offset += 1;
                if offset + len > data.len() {
                    return Err(MessageError::InvalidMessage("truncated route"));
                }
                let route = std::str::from_utf8(&data[offset..offset + len])
                    .map_err(|_| MessageError::InvalidMessage("route is not valid UTF-8"))?
                    .to_string();
                offset += len;
                route
            }
        } else {
            String::new()
        };

        let compressed = flag & GZIP_MASK != 0;
        let payload = &data[offset..];
        let data = if compressed {
            Bytes::from(
                compression::inflate(payload)
                    .map_err(|_| MessageError::InvalidMessage("payload inflate failed"))?,
            )
        } else {
            Bytes::copy_from_slice(payload)
        };

        Ok(Self {
            message_type,
            id,
            route,
            error: flag & ERROR_MASK != 0,
            compressed,
            data,
        })
    }
}

/// Writes `n` as 7-bit groups, least significant first, high bit = more.
fn put_varint(buf: &mut BytesMut, mut n: u64) {
    loop {
        let byte = (n & 0x7F) as u8;
        n >>= 7;
        if n == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Reads a varint, returning the value and the number of bytes consumed.
fn read_varint(buf: &[u8]) -> Result<(u64, usize), MessageError> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LENGTH).enumerate() {
        let group = (byte & 0x7F) as u64;
        let shift = 7 * i as u32;
        if shift == 63 && group > 1 {
            return Err(MessageError::InvalidMessage("message id overflows u64"));
        }
        value |= group << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() >= MAX_VARINT_LENGTH {
        Err(MessageError::InvalidMessage("message id overflows u64"))
    } else {
        Err(MessageError::InvalidMessage("truncated message id"))
    }
}

/// Error body Pitaya servers put in responses carrying the error flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerErrorPayload {
    #[serde(default)]
    pub code: String,
    #[serde(default, alias = "message")]
    pub msg: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ServerErrorPayload {
    /// Parses an error payload, falling back to the raw text as the message.
    pub fn from_bytes(data: &[u8]) -> Self {
        serde_json::from_slice(data).unwrap_or_else(|_| Self {
            code: String::new(),
            msg: String::from_utf8_lossy(data).into_owned(),
            metadata: HashMap::new(),
        })
    }
}
