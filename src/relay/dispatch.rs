// Routes decoded client commands to the registries and the broadcaster

use crate::relay::broadcast::Broadcaster;
use crate::relay::client::{ClientConnection, ClientRegistry};
use crate::relay::envelope::{Command, Envelope, ServerMessage};
use crate::relay::events::{EventBus, RelayEvent};
use crate::relay::streams::StreamRegistry;
use std::sync::Arc;

/// What the dispatcher did with one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Forwarded,
    TargetNotFound,
    StreamStarted,
    StreamPublished,
    StreamSent,
    StreamNotFound,
    StreamClosed,
    Broadcast { delivered: usize },
    Logged,
    Unknown,
    /// The frame could not be decoded and was dropped
    Malformed,
    /// A response could not be queued for the sender
    SendFailed,
}

/// The client a frame came from
pub struct Origin<'a> {
    pub id: &'a str,
    pub conn: &'a ClientConnection,
}

#[derive(Clone)]
pub struct Dispatcher {
    clients: Arc<ClientRegistry>,
    streams: Arc<StreamRegistry>,
    broadcaster: Broadcaster,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(
        clients: Arc<ClientRegistry>,
        streams: Arc<StreamRegistry>,
        broadcaster: Broadcaster,
        events: EventBus,
    ) -> Self {
        Self {
            clients,
            streams,
            broadcaster,
            events,
        }
    }

    /// Handle one text frame from an identified client
    pub async fn dispatch(&self, origin: &Origin<'_>, text: &str) -> DispatchOutcome {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.events
                    .warn(format!("Dropped message from {}: {}", origin.id, e));
                return DispatchOutcome::Malformed;
            }
        };

        let client_id = origin.id;

        match envelope.command {
            Command::SendToClient { target_id } => {
                self.forward(client_id, &target_id, text).await
            }
            Command::StartStream { stream_name } => {
                self.streams.start(&stream_name).await;
                self.events.emit(RelayEvent::StreamListChanged);
                self.events.info(format!(
                    "Stream '{}' started by {}",
                    stream_name, client_id
                ));
                DispatchOutcome::StreamStarted
            }
            Command::StreamData { stream_name, data } => {
                if self.streams.publish(&stream_name, data).await {
                    self.events.emit(RelayEvent::StreamListChanged);
                }
                self.events.info(format!(
                    "Stream '{}' updated by {}",
                    stream_name, client_id
                ));
                DispatchOutcome::StreamPublished
            }
            Command::RequestStreamData { stream_name } => {
                self.send_stream(origin, stream_name).await
            }
            Command::CloseStream { stream_name } => {
                if self.streams.close(&stream_name).await {
                    self.events.emit(RelayEvent::StreamListChanged);
                    self.events.info(format!(
                        "Stream '{}' closed by {}",
                        stream_name, client_id
                    ));
                    DispatchOutcome::StreamClosed
                } else {
                    self.events
                        .warn(format!("Stream '{}' not found.", stream_name));
                    DispatchOutcome::StreamNotFound
                }
            }
            Command::Broadcast { data } => {
                let delivered = self.broadcaster.send(data, Some(client_id)).await;
                DispatchOutcome::Broadcast { delivered }
            }
            Command::Message { data } => {
                self.events
                    .info(format!("Message from {}: {}", client_id, data));
                DispatchOutcome::Logged
            }
            Command::ClientId { client_id: declared } => {
                self.events.info(format!(
                    "Received client_id command from {}: {}",
                    client_id, declared
                ));
                DispatchOutcome::Logged
            }
            Command::Unknown => {
                self.events.warn(format!(
                    "Unknown command from {}: {}",
                    client_id,
                    envelope.name.as_deref().unwrap_or("<none>")
                ));
                DispatchOutcome::Unknown
            }
        }
    }

    /// Forward the inbound frame, untouched, to `target_id`
    async fn forward(&self, client_id: &str, target_id: &str, text: &str) -> DispatchOutcome {
        let Some(target) = self.clients.lookup(target_id).await else {
            self.events
                .warn(format!("Client {} not found.", target_id));
            return DispatchOutcome::TargetNotFound;
        };

        match target.send_text(text.to_string()) {
            Ok(()) => {
                self.events.info(format!(
                    "Message from {} sent to {}",
                    client_id, target_id
                ));
                DispatchOutcome::Forwarded
            }
            Err(e) => {
                // The target left between lookup and send
                self.events
                    .warn(format!("Client {} not reachable: {}", target_id, e));
                DispatchOutcome::TargetNotFound
            }
        }
    }

    async fn send_stream(&self, origin: &Origin<'_>, stream_name: String) -> DispatchOutcome {
        let Some(data) = self.streams.get(&stream_name).await.into_value() else {
            self.events
                .warn(format!("Stream '{}' not found.", stream_name));
            return DispatchOutcome::StreamNotFound;
        };

        let response = ServerMessage::StreamData {
            stream_name: stream_name.clone(),
            data,
        };

        match origin.conn.send(&response) {
            Ok(()) => {
                self.events.info(format!(
                    "Sent current stream data for '{}' to {}",
                    stream_name, origin.id
                ));
                DispatchOutcome::StreamSent
            }
            Err(e) => {
                self.events.warn(format!(
                    "Failed to send stream data for '{}' to {}: {}",
                    stream_name, origin.id, e
                ));
                DispatchOutcome::SendFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::client::{ConnectionIo, Outgoing};
    use crate::relay::streams::StreamLookup;
    use serde_json::{json, Value};

    struct Fixture {
        dispatcher: Dispatcher,
        clients: Arc<ClientRegistry>,
        streams: Arc<StreamRegistry>,
        events: EventBus,
    }

    fn fixture() -> Fixture {
        let clients = Arc::new(ClientRegistry::new());
        let streams = Arc::new(StreamRegistry::new());
        let events = EventBus::new(64);
        let broadcaster = Broadcaster::new(clients.clone(), events.clone());
        let dispatcher = Dispatcher::new(
            clients.clone(),
            streams.clone(),
            broadcaster,
            events.clone(),
        );

        Fixture {
            dispatcher,
            clients,
            streams,
            events,
        }
    }

    async fn join(clients: &ClientRegistry, id: &str) -> (ClientConnection, ConnectionIo) {
        let (conn, io) = ClientConnection::channel();
        clients.register(id, conn.clone()).await;
        (conn, io)
    }

    fn next_json(io: &mut ConnectionIo) -> Option<Value> {
        match io.rx.try_recv() {
            Ok(Outgoing::Text(text)) => Some(serde_json::from_str(&text).unwrap()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_stream_lifecycle() {
        let fx = fixture();
        let (a, _a_io) = join(&fx.clients, "A").await;
        let (b, mut b_io) = join(&fx.clients, "B").await;
        let origin_a = Origin { id: "A", conn: &a };
        let origin_b = Origin { id: "B", conn: &b };

        let outcome = fx
            .dispatcher
            .dispatch(&origin_a, r#"{"command":"start_stream","stream_name":"temp"}"#)
            .await;
        assert_eq!(outcome, DispatchOutcome::StreamStarted);
        assert_eq!(fx.streams.get("temp").await, StreamLookup::Empty);

        fx.dispatcher
            .dispatch(
                &origin_a,
                r#"{"command":"stream_data","stream_name":"temp","data":42}"#,
            )
            .await;
        assert_eq!(fx.streams.get("temp").await, StreamLookup::Present(json!(42)));

        let outcome = fx
            .dispatcher
            .dispatch(
                &origin_b,
                r#"{"command":"request_stream_data","stream_name":"temp"}"#,
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::StreamSent);
        assert_eq!(
            next_json(&mut b_io),
            Some(json!({"command": "stream_data", "stream_name": "temp", "data": 42}))
        );

        let outcome = fx
            .dispatcher
            .dispatch(&origin_b, r#"{"command":"close_stream","stream_name":"temp"}"#)
            .await;
        assert_eq!(outcome, DispatchOutcome::StreamClosed);
        assert_eq!(fx.streams.get("temp").await, StreamLookup::NotFound);
    }

    #[tokio::test]
    async fn test_request_for_empty_stream_sends_null() {
        let fx = fixture();
        let (a, mut a_io) = join(&fx.clients, "A").await;
        let origin = Origin { id: "A", conn: &a };

        fx.streams.start("idle").await;
        fx.dispatcher
            .dispatch(&origin, r#"{"command":"request_stream_data","stream_name":"idle"}"#)
            .await;

        assert_eq!(
            next_json(&mut a_io),
            Some(json!({"command": "stream_data", "stream_name": "idle", "data": null}))
        );
    }

    #[tokio::test]
    async fn test_request_for_missing_stream_sends_nothing() {
        let fx = fixture();
        let (a, mut a_io) = join(&fx.clients, "A").await;
        let origin = Origin { id: "A", conn: &a };

        let outcome = fx
            .dispatcher
            .dispatch(&origin, r#"{"command":"request_stream_data","stream_name":"nope"}"#)
            .await;

        assert_eq!(outcome, DispatchOutcome::StreamNotFound);
        assert!(next_json(&mut a_io).is_none());
    }

    #[tokio::test]
    async fn test_send_to_client_forwards_verbatim() {
        let fx = fixture();
        let (a, mut a_io) = join(&fx.clients, "A").await;
        let (_b, mut b_io) = join(&fx.clients, "B").await;
        let origin = Origin { id: "A", conn: &a };

        let frame = r#"{"command":"send_to_client","target_id":"B","data":{"x":1},"note":"kept"}"#;
        let outcome = fx.dispatcher.dispatch(&origin, frame).await;

        assert_eq!(outcome, DispatchOutcome::Forwarded);
        assert_eq!(b_io.rx.try_recv().ok(), Some(Outgoing::Text(frame.to_string())));
        assert!(a_io.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_missing_client_is_a_silent_miss() {
        let fx = fixture();
        let mut log = fx.events.subscribe();
        let (a, mut a_io) = join(&fx.clients, "A").await;
        let origin = Origin { id: "A", conn: &a };

        let outcome = fx
            .dispatcher
            .dispatch(
                &origin,
                r#"{"command":"send_to_client","target_id":"Z","data":"hi"}"#,
            )
            .await;

        assert_eq!(outcome, DispatchOutcome::TargetNotFound);
        assert!(a_io.rx.try_recv().is_err());
        assert_eq!(
            log.recv().await.unwrap(),
            RelayEvent::Log {
                line: "Client Z not found.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let fx = fixture();
        let (a, mut a_io) = join(&fx.clients, "A").await;
        let (_b, mut b_io) = join(&fx.clients, "B").await;
        let (_c, mut c_io) = join(&fx.clients, "C").await;
        let origin = Origin { id: "A", conn: &a };

        let outcome = fx
            .dispatcher
            .dispatch(&origin, r#"{"command":"broadcast","data":"hello"}"#)
            .await;

        assert_eq!(outcome, DispatchOutcome::Broadcast { delivered: 2 });
        let expected = json!({"command": "broadcast", "data": "hello"});
        assert_eq!(next_json(&mut b_io), Some(expected.clone()));
        assert_eq!(next_json(&mut c_io), Some(expected));
        assert!(next_json(&mut a_io).is_none());
    }

    #[tokio::test]
    async fn test_stream_list_changes_are_announced() {
        let fx = fixture();
        let mut events = fx.events.subscribe();
        let (a, _a_io) = join(&fx.clients, "A").await;
        let origin = Origin { id: "A", conn: &a };

        fx.dispatcher
            .dispatch(&origin, r#"{"command":"start_stream","stream_name":"s"}"#)
            .await;

        assert_eq!(events.recv().await.unwrap(), RelayEvent::StreamListChanged);
    }

    #[tokio::test]
    async fn test_stream_data_is_logged_to_observers() {
        let fx = fixture();
        let (a, _a_io) = join(&fx.clients, "A").await;
        let origin = Origin { id: "A", conn: &a };
        fx.streams.start("temp").await;
        let mut events = fx.events.subscribe();

        let outcome = fx
            .dispatcher
            .dispatch(
                &origin,
                r#"{"command":"stream_data","stream_name":"temp","data":42}"#,
            )
            .await;

        assert_eq!(outcome, DispatchOutcome::StreamPublished);
        assert_eq!(
            events.try_recv().unwrap(),
            RelayEvent::Log {
                line: "Stream 'temp' updated by A".to_string()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_frames_are_dropped() {
        let fx = fixture();
        let (a, mut a_io) = join(&fx.clients, "A").await;
        let origin = Origin { id: "A", conn: &a };

        assert_eq!(
            fx.dispatcher.dispatch(&origin, "{not json").await,
            DispatchOutcome::Malformed
        );
        assert_eq!(
            fx.dispatcher.dispatch(&origin, r#"{"command":"fly"}"#).await,
            DispatchOutcome::Unknown
        );
        assert_eq!(
            fx.dispatcher
                .dispatch(&origin, r#"{"command":"client_id","client_id":"A"}"#)
                .await,
            DispatchOutcome::Logged
        );
        assert!(a_io.rx.try_recv().is_err());
    }
}
