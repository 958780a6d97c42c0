//! pomelo - Pomelo/Pitaya session monitor
//!
//! Keeps a session open to a game server, logs lifecycle changes, heartbeat
//! quality and pushes on the configured routes.

use pomelo_client::{Client, ClientConfig, ConnectionState};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How often heartbeat quality is logged.
const QUALITY_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if POMELO_CONFIG is set, then env overrides)
    let config_path = std::env::var("POMELO_CONFIG").ok();
    let config = match ClientConfig::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting pomelo monitor");
    tracing::info!("  Server: {}:{}", config.server.host, config.server.port);
    tracing::info!(
        "  Reconnect: {}",
        if config.network.reconnect {
            format!("enabled (backoff {}ms)", config.network.reconnect_backoff_ms)
        } else {
            "disabled".to_string()
        }
    );
    tracing::info!(
        "  TLS: {}",
        if config.tls.enabled { "enabled" } else { "disabled" }
    );
    tracing::info!("  Subscriptions: {:?}", config.subscriptions);

    let client = Client::new(config.to_connection_config());

    for route in &config.subscriptions {
        let label = route.clone();
        client.on_route(route.as_str(), move |data| {
            tracing::info!(route = %label, bytes = data.len(), "push: {}", String::from_utf8_lossy(&data));
        });
    }

    let mut events = client.subscribe_network_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.reason {
                Some(reason) => tracing::info!(state = %event.state, %reason, "network event"),
                None => tracing::info!(state = %event.state, "network event"),
            }
        }
    });

    // Stop cleanly on Ctrl+C
    let shutdown_client = client.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, closing session...");
        shutdown_client.close().await;
    });

    if let Err(e) = client
        .connect(&config.server.host, config.server.port)
        .await
    {
        tracing::error!("Failed to connect: {}", e);
        client.close().await;
        return Err(e.into());
    }
    tracing::info!(
        "Connected (serializer: {}, heartbeat: {:?})",
        client.serializer(),
        client.heartbeat_interval()
    );

    let mut ticker = tokio::time::interval(QUALITY_LOG_INTERVAL);
    ticker.tick().await;
    let stopped = client.stopped();
    tokio::pin!(stopped);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if client.state().is_working() {
                    tracing::info!(
                        quality_ms = client.quality(),
                        pending = client.pending_count(),
                        "session healthy"
                    );
                }
            }
            _ = &mut stopped => break,
        }
    }

    client.close().await;
    tracing::info!("Monitor stopped");
    Ok(())
}
