// Client connections and the registry of identified clients

use crate::relay::envelope::ServerMessage;
use crate::relay::error::{RelayError, Result};
use futures::{Sink, SinkExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    /// Start a graceful close; nothing queued after it is sent
    Close,
}

/// How a close request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Graceful,
    /// The close did not finish in time and the socket was dropped
    Forced,
}

/// Handle to one peer connection
///
/// Cloning is cheap. The handle only queues frames and requests closes; the
/// socket itself belongs to the connection's session task.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<Outgoing>,
    shutdown: CancellationToken,
    finished: CancellationToken,
}

/// The session side of a [`ClientConnection`]
pub struct ConnectionIo {
    /// Frames to write to the peer
    pub rx: mpsc::UnboundedReceiver<Outgoing>,
    /// Cancelled when the connection must be dropped immediately
    pub shutdown: CancellationToken,
    /// Must be cancelled by the session once the connection is gone
    pub finished: CancellationToken,
}

impl ClientConnection {
    /// Create a connection handle and its session side
    pub fn channel() -> (Self, ConnectionIo) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let finished = CancellationToken::new();

        let conn = Self {
            conn_id: Uuid::new_v4(),
            tx,
            shutdown: shutdown.clone(),
            finished: finished.clone(),
        };
        let io = ConnectionIo {
            rx,
            shutdown,
            finished,
        };

        (conn, io)
    }

    /// Identifier of this particular connection (not the client id)
    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Queue a server message
    pub fn send(&self, message: &ServerMessage) -> Result<()> {
        self.send_text(message.to_text()?)
    }

    /// Queue a raw text frame
    pub fn send_text(&self, text: String) -> Result<()> {
        self.tx
            .send(Outgoing::Text(text))
            .map_err(|_| RelayError::ConnectionClosed)
    }

    /// Close the connection, dropping it if the close takes longer than `timeout`
    pub async fn close(&self, timeout: Duration) -> CloseOutcome {
        if self.finished.is_cancelled() {
            return CloseOutcome::Graceful;
        }

        if self.tx.send(Outgoing::Close).is_err() {
            tracing::debug!("Writer for connection {} already gone", self.conn_id);
        }

        match tokio::time::timeout(timeout, self.finished.cancelled()).await {
            Ok(()) => CloseOutcome::Graceful,
            Err(_) => {
                tracing::warn!(
                    "Connection {} did not close within {:?}, dropping it",
                    self.conn_id,
                    timeout
                );
                self.abort();
                CloseOutcome::Forced
            }
        }
    }

    /// Drop the connection without a close handshake
    pub fn abort(&self) {
        self.shutdown.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Whether the session task has released the connection
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }
}

/// Write queued frames to the peer until closed, aborted or the queue ends
pub(crate) async fn write_frames<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    shutdown: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        tracing::debug!("Failed to write frame: {}", e);
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    if let Err(e) = sink.close().await {
                        tracing::debug!("Failed to send close frame: {}", e);
                    }
                    break;
                }
            }
        }
    }
}

/// Maps client ids to their active connection
///
/// The single source of truth for which clients are reachable. Holding an
/// entry does not give the registry control over the connection's lifetime.
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, ClientConnection>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register a client, replacing any previous entry with the same id.
    /// Returns the superseded connection, if it was a different one.
    pub async fn register(&self, id: &str, conn: ClientConnection) -> Option<ClientConnection> {
        let new_conn_id = conn.conn_id;
        let mut clients = self.clients.write().await;
        clients
            .insert(id.to_string(), conn)
            .filter(|old| old.conn_id != new_conn_id)
    }

    pub async fn lookup(&self, id: &str) -> Option<ClientConnection> {
        let clients = self.clients.read().await;
        clients.get(id).cloned()
    }

    /// Remove a client; no-op if absent
    pub async fn remove(&self, id: &str) -> Option<ClientConnection> {
        let mut clients = self.clients.write().await;
        clients.remove(id)
    }

    /// Remove `id` only if it still maps to the given connection.
    /// Returns true if an entry was removed.
    pub async fn remove_connection(&self, id: &str, conn_id: Uuid) -> bool {
        let mut clients = self.clients.write().await;
        let owned = clients.get(id).is_some_and(|conn| conn.conn_id == conn_id);
        if owned {
            clients.remove(id);
        }
        owned
    }

    /// Copy of the current entries, safe to iterate while the registry changes
    pub async fn snapshot(&self) -> Vec<(String, ClientConnection)> {
        let clients = self.clients.read().await;
        clients
            .iter()
            .map(|(id, conn)| (id.clone(), conn.clone()))
            .collect()
    }

    /// Registered ids in sorted order
    pub async fn ids(&self) -> Vec<String> {
        let clients = self.clients.read().await;
        let mut ids: Vec<String> = clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove every entry, returning the ids that were still registered
    pub async fn clear(&self) -> Vec<String> {
        let mut clients = self.clients.write().await;
        clients.drain().map(|(id, _)| id).collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
