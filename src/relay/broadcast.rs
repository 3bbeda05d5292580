// Best-effort fan-out to registered clients

use crate::relay::client::ClientRegistry;
use crate::relay::envelope::{Payload, ServerMessage};
use crate::relay::events::EventBus;
use std::sync::Arc;

#[derive(Clone)]
pub struct Broadcaster {
    clients: Arc<ClientRegistry>,
    events: EventBus,
}

impl Broadcaster {
    pub fn new(clients: Arc<ClientRegistry>, events: EventBus) -> Self {
        Self { clients, events }
    }

    /// Send a `broadcast` envelope to every registered client except `exclude`.
    ///
    /// Failures on one client are logged and skipped. Returns the number of
    /// clients the envelope was queued for.
    pub async fn send(&self, payload: Payload, exclude: Option<&str>) -> usize {
        let message = ServerMessage::Broadcast {
            data: payload.clone(),
        };
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                self.events
                    .warn(format!("Failed to encode broadcast message: {}", e));
                return 0;
            }
        };

        let mut delivered = 0;
        for (id, conn) in self.clients.snapshot().await {
            if exclude == Some(id.as_str()) {
                continue;
            }

            match conn.send_text(text.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => self
                    .events
                    .warn(format!("Failed to send broadcast to client {}: {}", id, e)),
            }
        }

        self.events
            .info(format!("Broadcasted message: {}", payload));
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::client::{ClientConnection, Outgoing};
    use crate::relay::events::RelayEvent;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_skips_excluded_client() {
        let clients = Arc::new(ClientRegistry::new());
        let mut ios = Vec::new();
        for id in ["A", "B", "C"] {
            let (conn, io) = ClientConnection::channel();
            clients.register(id, conn).await;
            ios.push((id, io));
        }

        let broadcaster = Broadcaster::new(clients, EventBus::new(16));
        let delivered = broadcaster.send(json!("hello"), Some("A")).await;
        assert_eq!(delivered, 2);

        for (id, io) in ios.iter_mut() {
            let frame = io.rx.try_recv().ok();
            if *id == "A" {
                assert!(frame.is_none());
            } else {
                assert_eq!(
                    frame,
                    Some(Outgoing::Text(
                        r#"{"command":"broadcast","data":"hello"}"#.to_string()
                    ))
                );
                assert!(io.rx.try_recv().is_err());
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_survives_dead_recipient() {
        let clients = Arc::new(ClientRegistry::new());

        let (dead, dead_io) = ClientConnection::channel();
        clients.register("dead", dead).await;
        drop(dead_io);

        let (alive, mut alive_io) = ClientConnection::channel();
        clients.register("alive", alive).await;

        let events = EventBus::new(16);
        let mut log = events.subscribe();
        let broadcaster = Broadcaster::new(clients, events);
        assert_eq!(broadcaster.send(json!({"n": 1}), None).await, 1);
        assert!(alive_io.rx.try_recv().is_ok());

        assert_eq!(
            log.try_recv().unwrap(),
            RelayEvent::Log {
                line: "Failed to send broadcast to client dead: connection closed".to_string()
            }
        );
    }
}
