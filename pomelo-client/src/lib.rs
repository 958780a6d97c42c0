//! # pomelo-client
//!
//! Async client for Pomelo/Pitaya game servers.
//!
//! This crate provides:
//! - Connection lifecycle with handshake and optional reconnect
//! - Heartbeats with liveness detection and a quality sample
//! - Request/response correlation with a timeout reaper
//! - Push subscriptions by route
//! - YAML/env configuration and optional TLS

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod pending;
pub mod routes;
pub mod session;
pub mod state;
pub mod stream;
pub mod tls;

pub use client::Client;
pub use config::{ClientConfig, ConfigError};
pub use connection::{Connection, ConnectionConfig, PendingResponse};
pub use error::ClientError;
pub use routes::PushEvent;
pub use state::{ConnectionState, NetworkEvent};
pub use tls::TlsClientConfig;
