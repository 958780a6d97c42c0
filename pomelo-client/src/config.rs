//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via POMELO_CONFIG or --config)
//! 3. Environment variables

use crate::connection::ConnectionConfig;
use crate::tls::TlsClientConfig;
use pomelo_protocol::{ClientHandshake, ClientSys};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub network: NetworkConfig,
    pub requests: RequestConfig,
    pub handshake: HandshakeConfig,
    pub compression: CompressionConfig,
    pub tls: TlsClientConfig,
    /// Push routes the monitor subscribes to.
    pub subscriptions: Vec<String>,
}

impl ClientConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("POMELO_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.is_empty() {
            return Err(ConfigError::Validation("server.host is empty".to_string()));
        }
        if self.requests.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "requests.timeout_ms must be positive".to_string(),
            ));
        }
        if self.requests.reaper_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "requests.reaper_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `POMELO_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("POMELO_HOST") {
            self.server.host = host;
        }
        set_parsed(&lookup, "POMELO_PORT", &mut self.server.port);
        set_parsed(
            &lookup,
            "POMELO_CONNECT_TIMEOUT",
            &mut self.network.connect_timeout_secs,
        );
        set_parsed(
            &lookup,
            "POMELO_HANDSHAKE_TIMEOUT",
            &mut self.network.handshake_timeout_secs,
        );
        set_bool(&lookup, "POMELO_RECONNECT", &mut self.network.reconnect);
        set_parsed(
            &lookup,
            "POMELO_RECONNECT_BACKOFF_MS",
            &mut self.network.reconnect_backoff_ms,
        );
        set_parsed(
            &lookup,
            "POMELO_REQUEST_TIMEOUT_MS",
            &mut self.requests.timeout_ms,
        );
        set_bool(
            &lookup,
            "POMELO_DATA_COMPRESSION",
            &mut self.compression.data_compression,
        );

        set_bool(&lookup, "POMELO_TLS", &mut self.tls.enabled);
        if let Some(path) = lookup("POMELO_TLS_CA_CERT") {
            self.tls.ca_cert_path = Some(PathBuf::from(path));
            self.tls.enabled = true;
        }
        if let Some(path) = lookup("POMELO_TLS_CLIENT_CERT") {
            self.tls.client_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("POMELO_TLS_CLIENT_KEY") {
            self.tls.client_key_path = Some(PathBuf::from(path));
        }
        set_bool(&lookup, "POMELO_TLS_INSECURE", &mut self.tls.insecure);
        if let Some(name) = lookup("POMELO_TLS_SERVER_NAME") {
            self.tls.server_name = Some(name);
        }

        if let Some(routes) = lookup("POMELO_SUBSCRIPTIONS") {
            self.subscriptions = routes
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Builds the runtime connection settings.
    pub fn to_connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new()
            .with_connect_timeout(self.network.connect_timeout())
            .with_handshake_timeout(self.network.handshake_timeout())
            .with_request_timeout(self.requests.timeout())
            .with_reaper_interval(self.requests.reaper_interval())
            .with_read_buffer_size(self.network.read_buffer_size)
            .with_max_packet_size(self.network.max_packet_size)
            .with_data_compression(self.compression.data_compression)
            .with_handshake(self.handshake.to_client_handshake());
        if self.network.reconnect {
            config = config.with_reconnect(self.network.reconnect_backoff());
        }
        if self.tls.enabled {
            config = config.with_tls(self.tls.clone());
        }
        config
    }
}

fn set_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable override"),
        }
    }
}

fn set_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut bool) {
    if let Some(raw) = lookup(key) {
        *target = matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );
    }
}

/// Game server address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3250,
        }
    }
}

/// Socket and reconnect settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub reconnect: bool,
    pub reconnect_backoff_ms: u64,
    pub read_buffer_size: usize,
    pub max_packet_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            handshake_timeout_secs: 10,
            reconnect: false,
            reconnect_backoff_ms: 2000,
            read_buffer_size: crate::connection::DEFAULT_READ_BUFFER_SIZE,
            max_packet_size: pomelo_protocol::MAX_PACKET_SIZE,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

/// Request timeout settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub reaper_interval_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            reaper_interval_ms: 1000,
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

/// What the client reports about itself in the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub platform: String,
    pub lib_version: String,
    pub build_number: String,
    pub version: String,
    /// Free-form user options sent alongside `sys`.
    pub user: serde_json::Map<String, serde_json::Value>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        let sys = ClientSys::default();
        Self {
            platform: sys.platform,
            lib_version: sys.lib_version,
            build_number: sys.build_number,
            version: sys.version,
            user: serde_json::Map::new(),
        }
    }
}

impl HandshakeConfig {
    pub fn to_client_handshake(&self) -> ClientHandshake {
        ClientHandshake::new(ClientSys {
            platform: self.platform.clone(),
            lib_version: self.lib_version.clone(),
            build_number: self.build_number.clone(),
            version: self.version.clone(),
        })
        .with_user(self.user.clone())
    }
}

/// Outgoing payload compression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Zlib-compress request/notify bodies and set the gzip flag.
    pub data_compression: bool,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
