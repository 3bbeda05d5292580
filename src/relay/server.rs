// Relay server lifecycle: bind, accept, control hand-off and shutdown

use crate::relay::broadcast::Broadcaster;
use crate::relay::client::{ClientRegistry, CloseOutcome};
use crate::relay::config::RelayConfig;
use crate::relay::dispatch::Dispatcher;
use crate::relay::envelope::{Payload, ServerMessage};
use crate::relay::error::{RelayError, Result};
use crate::relay::events::{EventBus, RelayEvent};
use crate::relay::session::run_session;
use crate::relay::streams::{StreamLookup, StreamRegistry};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// State shared by the server loop and every session task
pub(crate) struct RelayState {
    pub config: RelayConfig,
    pub clients: Arc<ClientRegistry>,
    pub streams: Arc<StreamRegistry>,
    pub broadcaster: Broadcaster,
    pub dispatcher: Dispatcher,
    pub events: EventBus,
    /// Cancelled once shutdown begins; new handshakes are refused
    pub stopping: CancellationToken,
}

impl RelayState {
    fn new(config: RelayConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let clients = Arc::new(ClientRegistry::new());
        let streams = Arc::new(StreamRegistry::new());
        let broadcaster = Broadcaster::new(clients.clone(), events.clone());
        let dispatcher = Dispatcher::new(
            clients.clone(),
            streams.clone(),
            broadcaster.clone(),
            events.clone(),
        );

        Self {
            config,
            clients,
            streams,
            broadcaster,
            dispatcher,
            events,
            stopping: CancellationToken::new(),
        }
    }

    /// Operator-directed message to one client
    async fn send_to_client(&self, client_id: &str, data: Payload) {
        let Some(conn) = self.clients.lookup(client_id).await else {
            self.events
                .warn(format!("Client {} not found.", client_id));
            return;
        };

        let message = ServerMessage::Message { data: data.clone() };
        match conn.send(&message) {
            Ok(()) => self
                .events
                .info(format!("Sent message to {}: {}", client_id, data)),
            Err(e) => self
                .events
                .warn(format!("Failed to send message to {}: {}", client_id, e)),
        }
    }
}

/// Requests handed to the server loop from outside it
#[derive(Debug)]
pub enum ControlCommand {
    Broadcast {
        data: Payload,
    },
    SendToClient {
        client_id: String,
        data: Payload,
    },
    /// Disconnect everyone, release the listener, then signal `done`
    Stop {
        done: oneshot::Sender<()>,
    },
}

/// Thread-safe handle for controlling and observing a relay server
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ControlCommand>,
    state: Arc<RelayState>,
}

impl ServerHandle {
    /// Observe relay events
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.state.events.subscribe()
    }

    /// Broadcast a payload to every connected client
    pub fn broadcast(&self, data: Payload) -> Result<()> {
        self.send_command(ControlCommand::Broadcast { data })
    }

    /// Send `{"command":"message","data":...}` to one client
    pub fn send_to_client(&self, client_id: &str, data: Payload) -> Result<()> {
        self.send_command(ControlCommand::SendToClient {
            client_id: client_id.to_string(),
            data,
        })
    }

    /// Stop the server; returns once every client has been disconnected
    pub async fn stop(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send_command(ControlCommand::Stop { done: done_tx })?;
        done_rx.await.map_err(|_| RelayError::NotRunning)
    }

    /// Blocking variant of [`ServerHandle::stop`] for threads outside the runtime.
    ///
    /// Panics if called from within an async context.
    pub fn stop_blocking(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send_command(ControlCommand::Stop { done: done_tx })?;
        done_rx.blocking_recv().map_err(|_| RelayError::NotRunning)
    }

    pub async fn client_ids(&self) -> Vec<String> {
        self.state.clients.ids().await
    }

    pub async fn stream_names(&self) -> Vec<String> {
        self.state.streams.names().await
    }

    pub async fn stream_value(&self, name: &str) -> StreamLookup {
        self.state.streams.get(name).await
    }

    fn send_command(&self, cmd: ControlCommand) -> Result<()> {
        self.tx.send(cmd).map_err(|_| RelayError::NotRunning)
    }
}

/// The relay server: owns the listening socket and the accept loop
pub struct RelayServer {
    state: Arc<RelayState>,
    rx: mpsc::UnboundedReceiver<ControlCommand>,
}

impl RelayServer {
    /// Create a server and the handle used to control it
    pub fn new(config: RelayConfig) -> (Self, ServerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RelayState::new(config));

        let handle = ServerHandle {
            tx,
            state: state.clone(),
        };

        (Self { state, rx }, handle)
    }

    /// Bind and serve until stopped through a [`ServerHandle`].
    ///
    /// Only a failure to bind is returned as an error.
    pub async fn start(mut self) -> Result<()> {
        let addr = self.state.config.bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let host = outbound_ip().await;
        self.state
            .events
            .info("Server started, waiting for clients to connect...".to_string());
        tracing::info!("Listening on {} (reachable at {}:{})", local_addr, host, local_addr.port());
        self.state.events.emit(RelayEvent::ServerBound {
            host: host.to_string(),
            port: local_addr.port(),
        });

        let done = self.accept_loop(&listener).await;

        self.state
            .events
            .info("Server stopping, disconnecting all clients...".to_string());
        self.state.stopping.cancel();
        disconnect_all(
            &self.state.clients,
            &self.state.events,
            self.state.config.close_timeout(),
        )
        .await;
        drop(listener);

        self.state
            .events
            .info("Server has been stopped.".to_string());
        if let Some(done) = done {
            let _ = done.send(());
        }

        Ok(())
    }

    /// Accept connections until a stop is requested or every handle is gone
    async fn accept_loop(&mut self, listener: &TcpListener) -> Option<oneshot::Sender<()>> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tracing::debug!("Accepted connection from {}", peer);
                            tokio::spawn(run_session(stream, peer, self.state.clone()));
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(ControlCommand::Broadcast { data }) => {
                            self.state.broadcaster.send(data, None).await;
                        }
                        Some(ControlCommand::SendToClient { client_id, data }) => {
                            self.state.send_to_client(&client_id, data).await;
                        }
                        Some(ControlCommand::Stop { done }) => return Some(done),
                        None => return None,
                    }
                }
            }
        }
    }
}

/// Result of disconnecting every client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectReport {
    pub graceful: usize,
    pub forced: usize,
}

/// Notify every registered client that the server is closing, then close them.
///
/// Each close is bounded by `close_timeout` and forced on expiry. The
/// registry is empty afterwards.
pub async fn disconnect_all(
    clients: &ClientRegistry,
    events: &EventBus,
    close_timeout: Duration,
) -> DisconnectReport {
    let snapshot = clients.snapshot().await;
    let mut report = DisconnectReport::default();

    if !snapshot.is_empty() {
        events.info("Disconnecting all clients...".to_string());

        for (id, conn) in &snapshot {
            if let Err(e) = conn.send(&ServerMessage::ServerClosing) {
                tracing::warn!("Failed to notify client {} of shutdown: {}", id, e);
            }
        }

        let closes = snapshot.iter().map(|(_, conn)| conn.close(close_timeout));
        for outcome in futures::future::join_all(closes).await {
            match outcome {
                CloseOutcome::Graceful => report.graceful += 1,
                CloseOutcome::Forced => report.forced += 1,
            }
        }
    }

    // Sessions that already cleaned up have removed themselves
    for id in clients.clear().await {
        events.emit(RelayEvent::ClientLeft { id });
    }

    if !snapshot.is_empty() {
        events.info(format!(
            "All clients have been disconnected ({} forced).",
            report.forced
        ));
    }

    report
}

/// The address this host uses for outbound traffic, for display to operators
pub async fn outbound_ip() -> IpAddr {
    match probe_outbound_ip().await {
        Ok(ip) => ip,
        Err(e) => {
            tracing::error!("Could not determine IP address: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

async fn probe_outbound_ip() -> std::io::Result<IpAddr> {
    // Connecting a UDP socket sends nothing; it only selects a route
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(("8.8.8.8", 80)).await?;
    Ok(socket.local_addr()?.ip())
}
