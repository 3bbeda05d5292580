// Identity handshake performed on every new connection
//
// The server sends REQUEST_ID; the first frame the peer sends back must be
// `{"client_id": "<id>"}`. Anything else abandons the connection.

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

/// Where a connection is in its lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// REQUEST_ID sent, waiting for the identity reply
    AwaitingId,
    /// Registered and dispatching commands
    Identified { client_id: String },
    Closed,
}

impl SessionState {
    /// Apply an identity reply. Only valid while awaiting one.
    pub fn identify(self, client_id: String) -> Result<Self, HandshakeError> {
        match self {
            SessionState::AwaitingId => Ok(SessionState::Identified { client_id }),
            _ => Err(HandshakeError::UnexpectedState),
        }
    }

    pub fn close(self) -> Self {
        SessionState::Closed
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            SessionState::Identified { client_id } => Some(client_id),
            _ => None,
        }
    }
}

/// Why a handshake failed. Always fatal to that connection only.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed before identifying")]
    ConnectionClosed,
    #[error("identity reply is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("identity reply is not a JSON object")]
    NotAnObject,
    #[error("identity reply has no client_id")]
    MissingClientId,
    #[error("identity reply is not text")]
    NotText,
    #[error("transport error during handshake: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("connection is not awaiting an identity")]
    UnexpectedState,
}

/// Extract the client id from an identity reply
pub fn parse_identity(text: &str) -> Result<String, HandshakeError> {
    let reply: serde_json::Value = serde_json::from_str(text).map_err(HandshakeError::Malformed)?;
    let Some(object) = reply.as_object() else {
        return Err(HandshakeError::NotAnObject);
    };

    match object.get("client_id") {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(HandshakeError::MissingClientId),
    }
}

/// Wait for the peer's identity reply, skipping control frames
pub async fn await_identity<S>(
    frames: &mut S,
    shutdown: &CancellationToken,
) -> Result<String, HandshakeError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Err(HandshakeError::ConnectionClosed),
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => return parse_identity(text.as_str()),
            Some(Ok(Message::Binary(bytes))) => {
                let text = std::str::from_utf8(&bytes).map_err(|_| HandshakeError::NotText)?;
                return parse_identity(text);
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                continue
            }
            Some(Ok(Message::Close(_))) | None => return Err(HandshakeError::ConnectionClosed),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
