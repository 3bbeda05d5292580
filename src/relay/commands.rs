// Command handler for the relay CLI

use crate::relay::cli::{apply_overrides, RelayCommand};
use crate::relay::console::{run_console_command, ConsoleCommand, HELP};
use crate::relay::{RelayConfig, RelayEvent, RelayServer, ServerHandle};
use anyhow::{Context, Result};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

/// Execute a relay command
pub async fn execute_command(command: RelayCommand) -> Result<()> {
    match command {
        RelayCommand::Serve {
            config,
            host,
            port,
            close_timeout_ms,
            no_console,
        } => handle_serve(config, host, port, close_timeout_ms, no_console).await,
        RelayCommand::DefaultConfig => handle_default_config(),
    }
}

async fn handle_serve(
    config_path: Option<PathBuf>,
    host: Option<IpAddr>,
    port: Option<u16>,
    close_timeout_ms: Option<u64>,
    no_console: bool,
) -> Result<()> {
    let base = match config_path {
        Some(path) => RelayConfig::from_file(&path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => RelayConfig::default(),
    };
    let config = apply_overrides(base, host, port, close_timeout_ms);

    let (server, handle) = RelayServer::new(config);
    let printer = tokio::spawn(print_events(handle.clone(), handle.subscribe()));
    let mut server_task = tokio::spawn(server.start());

    let mut console_enabled = !no_console;
    if console_enabled {
        println!("Type 'help' for operator commands, Ctrl+C to stop");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            result = &mut server_task => {
                printer.abort();
                return result
                    .context("Server task panicked")?
                    .context("Server failed");
            }
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if console_enabled => match line {
                Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                    Ok(Some(command)) => {
                        if !run_console_command(&handle, command).await? {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(usage) => println!("{}", usage),
                },
                Ok(None) => {
                    // stdin closed; keep serving until Ctrl+C
                    console_enabled = false;
                }
                Err(e) => {
                    tracing::warn!("Operator console disabled: {}", e);
                    console_enabled = false;
                }
            }
        }
    }

    println!("\nStopping server...");
    handle.stop().await.context("Failed to stop server")?;
    server_task
        .await
        .context("Server task panicked")?
        .context("Server failed")?;
    printer.abort();
    println!("Server stopped.");

    Ok(())
}

fn handle_default_config() -> Result<()> {
    let json = serde_json::to_string_pretty(&RelayConfig::default())
        .context("Failed to serialize default config")?;
    println!("{}", json);
    Ok(())
}

/// Show collaborator events on stdout
async fn print_events(
    handle: ServerHandle,
    mut events: tokio::sync::broadcast::Receiver<RelayEvent>,
) {
    loop {
        match events.recv().await {
            Ok(RelayEvent::ServerBound { host, port }) => {
                println!("✓ Relay listening");
                println!("  Address: ws://{}:{}", host, port);
                println!("{}", HELP);
            }
            Ok(RelayEvent::ClientJoined { id }) => println!("+ Client ID {}", id),
            Ok(RelayEvent::ClientLeft { id }) => println!("- Client ID {}", id),
            Ok(RelayEvent::StreamListChanged) => {
                let names = handle.stream_names().await;
                println!("  Streams: [{}]", names.join(", "));
            }
            // Already written by the tracing subscriber
            Ok(RelayEvent::Log { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Event display fell behind, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
