//! Handshake payloads exchanged in Handshake packets.

use crate::compression;
use crate::error::ProtocolError;
use crate::DEFAULT_SERIALIZER;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Handshake codes the server uses for success. `0` means the field was absent.
const HANDSHAKE_OK_CODES: [i32; 2] = [0, 200];

/// Longest heartbeat interval honoured, in seconds. Larger values are clamped.
pub const MAX_HEARTBEAT_SECS: u64 = 24 * 60 * 60;

/// Client information sent in the `sys` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSys {
    pub platform: String,
    pub lib_version: String,
    pub build_number: String,
    pub version: String,
}

impl Default for ClientSys {
    fn default() -> Self {
        Self {
            platform: "mac".to_string(),
            lib_version: "0.3.5-release".to_string(),
            build_number: "20".to_string(),
            version: "2.1".to_string(),
        }
    }
}

/// Client → server handshake body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientHandshake {
    pub sys: ClientSys,
    #[serde(default)]
    pub user: Map<String, Value>,
}

impl ClientHandshake {
    pub fn new(sys: ClientSys) -> Self {
        Self {
            sys,
            user: Map::new(),
        }
    }

    pub fn with_user(mut self, user: Map<String, Value>) -> Self {
        self.user = user;
        self
    }

    /// Serializes the handshake as JSON.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Server `sys` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSys {
    /// Route dictionary.
    pub dict: HashMap<String, u16>,
    /// Heartbeat interval in seconds. 0 disables heartbeats.
    pub heartbeat: u64,
    /// Negotiated payload serializer.
    pub serializer: String,
}

impl Default for ServerSys {
    fn default() -> Self {
        Self {
            dict: HashMap::new(),
            heartbeat: 0,
            serializer: DEFAULT_SERIALIZER.to_string(),
        }
    }
}

/// Server → client handshake body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeData {
    pub code: i32,
    pub sys: ServerSys,
}

impl HandshakeData {
    /// Decodes a handshake payload, inflating it first if it is compressed.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if compression::is_compressed(payload) {
            let inflated = compression::inflate(payload)?;
            Ok(serde_json::from_slice(&inflated)?)
        } else {
            Ok(serde_json::from_slice(payload)?)
        }
    }

    /// Returns whether the server accepted the handshake.
    pub fn is_accepted(&self) -> bool {
        HANDSHAKE_OK_CODES.contains(&self.code)
    }

    /// Heartbeat interval, or `None` when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.sys.heartbeat > 0)
            .then(|| Duration::from_secs(self.sys.heartbeat.min(MAX_HEARTBEAT_SECS)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_handshake_json_shape() {
        let mut user = Map::new();
        user.insert("age".to_string(), json!("30"));
        let handshake = ClientHandshake::default().with_user(user);

        let value: Value = serde_json::from_slice(&handshake.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "sys": {
                    "platform": "mac",
                    "libVersion": "0.3.5-release",
                    "buildNumber": "20",
                    "version": "2.1",
                },
                "user": { "age": "30" },
            })
        );
    }

    #[test]
    fn test_decode_plain() {
        let data =
            HandshakeData::decode(br#"{"sys":{"heartbeat":30,"dict":{"foo":1}}}"#).unwrap();
        assert_eq!(data.code, 0);
        assert!(data.is_accepted());
        assert_eq!(data.sys.heartbeat, 30);
        assert_eq!(data.sys.dict.get("foo"), Some(&1));
        assert_eq!(data.sys.serializer, "json");
        assert_eq!(data.heartbeat_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_decode_compressed() {
        let raw = br#"{"code":200,"sys":{"heartbeat":10,"serializer":"protobuf"}}"#;
        let compressed = compression::deflate(raw).unwrap();

        let data = HandshakeData::decode(&compressed).unwrap();
        assert!(data.is_accepted());
        assert_eq!(data.sys.serializer, "protobuf");
        assert!(data.sys.dict.is_empty());
    }

    #[test]
    fn test_rejected_code() {
        let data = HandshakeData::decode(br#"{"code":501}"#).unwrap();
        assert!(!data.is_accepted());
    }

    #[test]
    fn test_heartbeat_disabled() {
        let data = HandshakeData::decode(br#"{"code":200,"sys":{}}"#).unwrap();
        assert_eq!(data.heartbeat_interval(), None);
    }

    #[test]
    fn test_heartbeat_clamped() {
        let data =
            HandshakeData::decode(br#"{"code":200,"sys":{"heartbeat":18446744073709551615}}"#)
                .unwrap();
        assert_eq!(
            data.heartbeat_interval(),
            Some(Duration::from_secs(MAX_HEARTBEAT_SECS))
        );
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(matches!(
            HandshakeData::decode(b"not json"),
            Err(ProtocolError::Json(_))
        ));
    }
}
