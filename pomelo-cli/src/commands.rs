//! Command execution.

use crate::Commands;
use bytes::Bytes;
use colored::Colorize;
use pomelo_client::Client;
use serde_json::Value;
use std::collections::HashSet;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::Handshake => {
            let conn = client.connection();
            let heartbeat = client
                .heartbeat_interval()
                .map(|d| format!("{}s", d.as_secs()))
                .unwrap_or_else(|| "disabled".to_string());
            Ok(format!(
                "{} (serializer: {}, heartbeat: {}, routes: {})",
                "Handshake OK".green(),
                client.serializer().cyan(),
                heartbeat,
                conn.dictionary().len()
            ))
        }

        Commands::Request { route, body } => {
            let data = parse_body_arg(body.as_deref())?;
            let response = client.request(&route, data).await?;
            Ok(format_body(&response))
        }

        Commands::Notify { route, body } => {
            let data = parse_body_arg(body.as_deref())?;
            client.notify(&route, data).await?;
            Ok(format!("{} {}", "Sent".green(), route.cyan()))
        }

        Commands::Listen { routes } => {
            listen(client, routes).await?;
            Ok(String::new())
        }
    }
}

async fn listen(client: &Client, routes: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let filter: HashSet<String> = routes.into_iter().collect();
    let mut pushes = client.subscribe_pushes();
    let mut state = client.watch_state();

    eprintln!("{}", "Listening for pushes, press Ctrl+C to stop...".dimmed());
    loop {
        tokio::select! {
            push = pushes.recv() => match push {
                Ok(push) => {
                    if filter.is_empty() || filter.contains(&push.route) {
                        println!("{} {}", push.route.cyan(), format_body(&push.data));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("{}: lagged {} pushes", "Warning".yellow(), n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() || !state.borrow().is_working() {
                    eprintln!("{}", "Connection closed".red());
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping...".dimmed());
                break;
            }
        }
    }
    Ok(())
}

/// Parses an optional body argument: JSON text, `@file`, or nothing.
pub(crate) fn parse_body_arg(arg: Option<&str>) -> Result<Bytes, Box<dyn std::error::Error>> {
    match arg {
        None => Ok(Bytes::new()),
        Some(arg) => {
            let value = parse_json_arg(arg)?;
            Ok(Bytes::from(serde_json::to_vec(&value)?))
        }
    }
}

pub(crate) fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Pretty JSON when the body parses, text otherwise.
pub(crate) fn format_body(data: &[u8]) -> String {
    if data.is_empty() {
        return "(empty)".dimmed().to_string();
    }
    match serde_json::from_slice::<Value>(data) {
        Ok(value) => format_json(&value),
        Err(_) => String::from_utf8_lossy(data).into_owned(),
    }
}

/// Formats JSON for display.
pub(crate) fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
