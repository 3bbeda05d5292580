// Relay server core
//
// Peers connect over WebSocket, identify themselves with a client id and
// exchange messages through the server. The server also keeps a set of
// named single-value streams that clients publish to and read from.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod events;
pub mod handshake;
pub mod server;
mod session;
pub mod streams;

pub use broadcast::Broadcaster;
pub use cli::{RelayCli, RelayCommand};
pub use client::{ClientConnection, ClientRegistry, CloseOutcome};
pub use commands::execute_command;
pub use config::RelayConfig;
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use envelope::{Command, Envelope, Payload, ServerMessage};
pub use error::RelayError;
pub use events::{EventBus, RelayEvent};
pub use handshake::{HandshakeError, SessionState};
pub use server::{disconnect_all, RelayServer, ServerHandle};
pub use streams::{StreamLookup, StreamRegistry};
