// Operator console: line commands read from stdin while the server runs

use crate::relay::envelope::Payload;
use crate::relay::server::ServerHandle;
use crate::relay::streams::StreamLookup;
use anyhow::Result;

/// One operator command
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Broadcast { text: String },
    Send { client_id: String, text: String },
    Clients,
    Streams,
    Stream { name: String },
    Stop,
    Help,
}

impl ConsoleCommand {
    /// Parse a console line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match verb {
            "broadcast" if !rest.is_empty() => ConsoleCommand::Broadcast {
                text: rest.to_string(),
            },
            "send" => match rest.split_once(char::is_whitespace) {
                Some((id, text)) if !text.trim().is_empty() => ConsoleCommand::Send {
                    client_id: id.to_string(),
                    text: text.trim().to_string(),
                },
                _ => return Err("usage: send <client-id> <text>".to_string()),
            },
            "clients" => ConsoleCommand::Clients,
            "streams" => ConsoleCommand::Streams,
            "stream" if !rest.is_empty() => ConsoleCommand::Stream {
                name: rest.to_string(),
            },
            "stop" | "exit" | "quit" => ConsoleCommand::Stop,
            "help" | "?" => ConsoleCommand::Help,
            "broadcast" => return Err("usage: broadcast <text>".to_string()),
            "stream" => return Err("usage: stream <name>".to_string()),
            other => return Err(format!("unknown command '{}', try 'help'", other)),
        };

        Ok(Some(command))
    }
}

pub const HELP: &str = "\
Commands:
  broadcast <text>       send text to every client
  send <id> <text>       send text to one client
  clients                list connected clients
  streams                list streams
  stream <name>          show the latest value of a stream
  stop                   disconnect everyone and stop the server";

/// Run one command against the server. Returns false once the server should stop.
pub async fn run_console_command(handle: &ServerHandle, command: ConsoleCommand) -> Result<bool> {
    match command {
        ConsoleCommand::Broadcast { text } => {
            handle.broadcast(Payload::String(text))?;
        }
        ConsoleCommand::Send { client_id, text } => {
            handle.send_to_client(&client_id, Payload::String(text))?;
        }
        ConsoleCommand::Clients => {
            let ids = handle.client_ids().await;
            if ids.is_empty() {
                println!("No clients connected");
            }
            for id in ids {
                println!("  Client ID {}", id);
            }
        }
        ConsoleCommand::Streams => {
            let names = handle.stream_names().await;
            if names.is_empty() {
                println!("No active streams");
            }
            for name in names {
                println!("  {}", name);
            }
        }
        ConsoleCommand::Stream { name } => match handle.stream_value(&name).await {
            StreamLookup::NotFound => println!("Stream not found."),
            StreamLookup::Empty => println!("{}: <no data yet>", name),
            StreamLookup::Present(value) => println!("{}: {}", name, value),
        },
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Stop => return Ok(false),
    }

    Ok(true)
}
