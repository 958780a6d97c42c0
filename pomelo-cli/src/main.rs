//! pomelo-cli - Command-line interface for Pomelo/Pitaya servers
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use pomelo_client::{Client, ClientConfig, ConfigError};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pomelo-cli")]
#[command(about = "Command-line interface for Pomelo/Pitaya game servers")]
#[command(version)]
struct Cli {
    /// Server host
    #[arg(short = 'H', long, env = "POMELO_HOST")]
    host: Option<String>,

    /// Server port
    #[arg(short, long, env = "POMELO_PORT")]
    port: Option<u16>,

    /// YAML config file
    #[arg(short, long, env = "POMELO_CONFIG")]
    config: Option<PathBuf>,

    /// Request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// User options sent with the handshake (JSON object or @file.json)
    #[arg(short, long)]
    user: Option<String>,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long)]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long)]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to server hostname)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start interactive REPL
    Repl,

    /// Handshake and print what the server negotiated
    Handshake,

    /// Send a request and print the response
    Request {
        /// Route, e.g. room.room.join
        route: String,

        /// Body (JSON text or @file)
        body: Option<String>,
    },

    /// Send a notify
    Notify {
        /// Route, e.g. room.room.chat
        route: String,

        /// Body (JSON text or @file)
        body: Option<String>,
    },

    /// Print server pushes until Ctrl+C
    Listen {
        /// Only these routes (all pushes when empty)
        #[arg(value_delimiter = ',')]
        routes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref(), |key| std::env::var(key).ok())?;
    if let Err(e) = apply_cli_overrides(&mut config, &cli) {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }

    let host = config.server.host.clone();
    let port = config.server.port;
    let client = Client::new(config.to_connection_config());

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, &host, port).await?;
        }
        Some(cmd) => {
            client.connect(&host, port).await.map_err(|e| {
                eprintln!("{}: {}", "Connection failed".red(), e);
                e
            })?;

            let result = commands::execute(&client, cmd).await;
            client.close().await;

            match result {
                Ok(output) => {
                    if !output.is_empty() {
                        println!("{}", output);
                    }
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Defaults, then the YAML file if given, then `POMELO_*` variables.
fn load_config(
    path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ClientConfig, ConfigError> {
    let mut config = match path {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    config.apply_overrides(lookup);
    Ok(config)
}

/// Flags win over the config file and environment.
fn apply_cli_overrides(config: &mut ClientConfig, cli: &Cli) -> Result<(), String> {
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ms) = cli.timeout_ms {
        config.requests.timeout_ms = ms;
    }
    if let Some(ref user) = cli.user {
        match commands::parse_json_arg(user).map_err(|e| e.to_string())? {
            serde_json::Value::Object(map) => config.handshake.user.extend(map),
            _ => return Err("--user must be a JSON object".to_string()),
        }
    }

    if cli.tls || cli.ca_cert.is_some() || cli.client_cert.is_some() || cli.insecure {
        let tls = &mut config.tls;
        tls.enabled = true;
        if let Some(ref path) = cli.ca_cert {
            tls.ca_cert_path = Some(path.clone());
        }
        match (&cli.client_cert, &cli.client_key) {
            (Some(cert), Some(key)) => {
                tls.client_cert_path = Some(cert.clone());
                tls.client_key_path = Some(key.clone());
            }
            (None, None) => {}
            _ => return Err("--client-cert and --client-key must be used together".to_string()),
        }
        tls.insecure |= cli.insecure;
        if cli.server_name.is_some() {
            tls.server_name = cli.server_name.clone();
        }
    }

    config.validate().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_overrides_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  host: game.example\n  port: 4000").unwrap();

        let config = load_config(Some(file.path()), |key| match key {
            "POMELO_PORT" => Some("5000".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.server.host, "game.example");
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn test_env_only() {
        let config = load_config(None, |key| {
            (key == "POMELO_HOST").then(|| "10.0.0.7".to_string())
        })
        .unwrap();
        assert_eq!(config.server.host, "10.0.0.7");
        assert_eq!(config.server.port, ClientConfig::default().server.port);
    }
}
