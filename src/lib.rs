//! streamrelay - WebSocket relay server
//!
//! Clients connect, identify themselves with an application-chosen id and
//! exchange messages through the server: directed sends, broadcasts, and
//! named latest-value streams that any client may publish to or read.

pub mod relay;

pub use relay::{RelayConfig, RelayEvent, RelayServer, ServerHandle};
