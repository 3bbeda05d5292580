// Wire envelopes exchanged between peers and the relay

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Opaque application payload carried in `data` fields
pub type Payload = Value;

/// Commands a connected client may send
///
/// Decoded once from the `command` field of an inbound envelope. Fields not
/// listed for a variant are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Forward the whole envelope to another client
    SendToClient { target_id: String },
    /// Create a stream with no value yet
    StartStream { stream_name: String },
    /// Publish the latest value of a stream
    StreamData {
        stream_name: String,
        #[serde(default)]
        data: Payload,
    },
    /// Ask for the current value of a stream
    RequestStreamData { stream_name: String },
    /// Remove a stream
    CloseStream { stream_name: String },
    /// Fan out `data` to every other client
    Broadcast {
        #[serde(default)]
        data: Payload,
    },
    /// Free-form message addressed to the server
    Message {
        #[serde(default)]
        data: Payload,
    },
    /// Legacy identity re-declaration, logged only
    ClientId {
        #[serde(default)]
        client_id: Payload,
    },
    /// Anything the relay does not understand
    #[serde(other)]
    Unknown,
}

/// A decoded inbound envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub command: Command,
    /// The raw `command` field, kept for logging unknown commands
    pub name: Option<String>,
}

/// Reasons an inbound frame could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("malformed '{command}' envelope: {source}")]
    Fields {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Envelope {
    /// Decode an inbound text frame
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text).map_err(DecodeError::Json)?;

        let name = match value.as_object() {
            Some(object) => object
                .get("command")
                .and_then(Value::as_str)
                .map(str::to_owned),
            None => return Err(DecodeError::NotAnObject),
        };

        // A missing or non-string tag cannot be routed; treat it like any other unknown command
        let Some(command_name) = name.clone() else {
            return Ok(Self {
                command: Command::Unknown,
                name,
            });
        };

        let command = serde_json::from_value(value).map_err(|source| DecodeError::Fields {
            command: command_name,
            source,
        })?;

        Ok(Self { command, name })
    }
}

/// Messages the relay itself sends to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command")]
pub enum ServerMessage {
    /// Sent once on accept; the peer must answer with `{"client_id": ...}`
    #[serde(rename = "REQUEST_ID")]
    RequestId,
    /// Sent to every client right before the server closes its connection
    #[serde(rename = "SERVER_CLOSING")]
    ServerClosing,
    #[serde(rename = "broadcast")]
    Broadcast { data: Payload },
    /// Current value of a stream; `data` is null for a started but empty stream
    #[serde(rename = "stream_data")]
    StreamData {
        stream_name: String,
        data: Option<Payload>,
    },
    /// Operator-directed message
    #[serde(rename = "message")]
    Message { data: Payload },
}

impl ServerMessage {
    /// Serialize to a JSON text frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
