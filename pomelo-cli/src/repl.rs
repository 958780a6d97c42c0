//! Interactive REPL.

use crate::commands::{format_body, parse_body_arg};
use colored::Colorize;
use pomelo_client::Client;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help

  request <route> [json]        Send a request and print the response
  notify <route> [json]         Send a notify
  on <route>                    Print pushes on a route
  off <route>                   Stop printing pushes on a route

  state                         Connection state and heartbeat quality
  pending                       Number of in-flight requests
  clear                         Cancel all in-flight requests

  quit, exit                    Exit the REPL
"#;

pub async fn run(client: Client, host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "pomelo CLI".bold().cyan());
    println!("Connecting to {}:{}...", host, port);

    client.connect(host, port).await?;
    println!(
        "{} (serializer: {})",
        "Connected!".green(),
        client.serializer().cyan()
    );

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = home::home_dir()
        .map(|h| h.join(".pomelo_history"))
        .unwrap_or_else(|| ".pomelo_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "pomelo>".cyan());
        // Readline blocks; keep it off the runtime threads that drive the session.
        let read = tokio::task::block_in_place(|| rl.readline(&prompt));
        match read {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&client, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd.to_lowercase(), rest.trim()),
        None => (line.to_lowercase(), ""),
    };
    let (route, body) = match rest.split_once(char::is_whitespace) {
        Some((route, body)) => (route, Some(body.trim())),
        None => (rest, None),
    };

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "request" | "req" | "r" => {
            if route.is_empty() {
                return Ok(Some("Usage: request <route> [json]".to_string()));
            }
            let response = client.request(route, parse_body_arg(body)?).await?;
            Ok(Some(format_body(&response)))
        }

        "notify" | "n" => {
            if route.is_empty() {
                return Ok(Some("Usage: notify <route> [json]".to_string()));
            }
            client.notify(route, parse_body_arg(body)?).await?;
            Ok(Some(format!("{} {}", "Sent".green(), route.cyan())))
        }

        "on" => {
            if route.is_empty() {
                return Ok(Some("Usage: on <route>".to_string()));
            }
            let label = route.to_string();
            client.on_route(route, move |data| {
                println!("\n{} {}", label.cyan(), format_body(&data));
            });
            Ok(Some(format!("{} {}", "Subscribed".green(), route.cyan())))
        }

        "off" => {
            if client.off_route(route) {
                Ok(Some(format!("{} {}", "Unsubscribed".green(), route.cyan())))
            } else {
                Ok(Some(format!("Not subscribed to {}", route).yellow().to_string()))
            }
        }

        "state" | "s" => Ok(Some(format!(
            "State: {}\nQuality: {} ms\nHeartbeat: {:?}",
            client.state().to_string().yellow(),
            client.quality(),
            client.heartbeat_interval()
        ))),

        "pending" => Ok(Some(format!("{} in flight", client.pending_count()))),

        "clear" => Ok(Some(format!(
            "{} {} requests",
            "Cancelled".yellow(),
            client.clear_pending()
        ))),

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for help.",
            cmd
        ))),
    }
}
