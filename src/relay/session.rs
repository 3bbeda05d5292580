// One task per accepted connection: upgrade, identify, dispatch, clean up

use crate::relay::client::{write_frames, ClientConnection, ConnectionIo};
use crate::relay::dispatch::Origin;
use crate::relay::envelope::ServerMessage;
use crate::relay::events::RelayEvent;
use crate::relay::handshake::{await_identity, HandshakeError, SessionState};
use crate::relay::server::RelayState;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;

/// Serve one accepted TCP connection until it closes
pub(crate) async fn run_session(stream: TcpStream, peer: SocketAddr, state: Arc<RelayState>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!("WebSocket upgrade with {} failed: {}", peer, e);
            return;
        }
    };

    let (sink, mut frames) = ws.split();
    let (conn, io) = ClientConnection::channel();
    let ConnectionIo {
        rx,
        shutdown,
        finished,
    } = io;

    // Signals `finished` when this task returns
    let _finished = finished.drop_guard();
    let writer = tokio::spawn(write_frames(sink, rx, shutdown.clone()));

    let phase = SessionState::AwaitingId;
    let identity = async {
        conn.send(&ServerMessage::RequestId)
            .map_err(|_| HandshakeError::ConnectionClosed)?;
        tokio::select! {
            _ = state.stopping.cancelled() => Err(HandshakeError::ConnectionClosed),
            result = await_identity(&mut frames, &shutdown) => result,
        }
    };

    let mut phase = match identity.await.and_then(|id| phase.identify(id)) {
        Ok(phase) => phase,
        Err(e) => {
            state
                .events
                .warn(format!("Handshake with {} failed: {}", peer, e));
            shutdown.cancel();
            let _ = writer.await;
            return;
        }
    };

    let client_id = phase.client_id().unwrap_or_default().to_string();

    if let Some(superseded) = state.clients.register(&client_id, conn.clone()).await {
        state.events.warn(format!(
            "Client ID {} connected again, closing its previous connection",
            client_id
        ));
        let timeout = state.config.close_timeout();
        tokio::spawn(async move {
            superseded.close(timeout).await;
        });
    }

    state
        .events
        .info(format!("New client connected: ID {}", client_id));
    state.events.emit(RelayEvent::ClientJoined {
        id: client_id.clone(),
    });

    // A stop that raced with this registration may have missed us
    if !state.stopping.is_cancelled() {
        receive_loop(&state, &client_id, &conn, &mut frames, &shutdown).await;
    }

    phase = phase.close();
    tracing::debug!("Session for {} from {} is {:?}", client_id, peer, phase);

    if state
        .clients
        .remove_connection(&client_id, conn.conn_id())
        .await
    {
        state
            .events
            .info(format!("Client disconnected: ID {}", client_id));
        state.events.emit(RelayEvent::ClientLeft { id: client_id });
    }

    shutdown.cancel();
    let _ = writer.await;
    drop(frames);
}

async fn receive_loop<S>(
    state: &RelayState,
    client_id: &str,
    conn: &ClientConnection,
    frames: &mut S,
    shutdown: &tokio_util::sync::CancellationToken,
) where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let origin = Origin {
        id: client_id,
        conn,
    };

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                state.dispatcher.dispatch(&origin, text.as_str()).await;
            }
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    state.dispatcher.dispatch(&origin, text).await;
                }
                Err(_) => state
                    .events
                    .warn(format!("Dropped non-UTF-8 message from {}", client_id)),
            },
            // The transport answers the close; the stream ends right after
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!("Client {} closed the connection: {:?}", client_id, frame);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                state.events.warn(format!("Connection closed: {}", e));
                break;
            }
            None => break,
        }
    }
}
