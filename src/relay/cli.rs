// CLI commands for the relay server

use crate::relay::config::RelayConfig;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// Relay server CLI
#[derive(Debug, Parser)]
#[command(name = "streamrelay")]
#[command(about = "WebSocket relay with directed messages, broadcast and latest-value streams")]
pub struct RelayCli {
    #[command(subcommand)]
    pub command: RelayCommand,
}

/// Relay subcommands
#[derive(Debug, Subcommand)]
pub enum RelayCommand {
    /// Run the relay server
    Serve {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Interface to listen on (default: 0.0.0.0)
        #[arg(long)]
        host: Option<IpAddr>,

        /// Port to listen on (default: 8080)
        #[arg(short, long)]
        port: Option<u16>,

        /// Milliseconds a client may take to close before it is dropped
        #[arg(long)]
        close_timeout_ms: Option<u64>,

        /// Do not read operator commands from stdin
        #[arg(long)]
        no_console: bool,
    },

    /// Print the default configuration as JSON
    DefaultConfig,
}

impl RelayCli {
    /// Parse from command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Apply command-line overrides on top of a base configuration
pub fn apply_overrides(
    mut config: RelayConfig,
    host: Option<IpAddr>,
    port: Option<u16>,
    close_timeout_ms: Option<u64>,
) -> RelayConfig {
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(ms) = close_timeout_ms {
        config.close_timeout_ms = ms;
    }
    config
}
