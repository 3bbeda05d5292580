// Events observed by an operator front-end

use tokio::sync::broadcast;

/// Something an observer of the relay may want to display
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    ClientJoined { id: String },
    ClientLeft { id: String },
    /// Human-readable trace of a routing decision
    Log { line: String },
    /// A stream was started or closed
    StreamListChanged,
    /// The listening socket is live
    ServerBound { host: String, port: u16 },
}

/// Fan-out of relay events to any number of observers
///
/// Observers that fall behind lose the oldest events; emitting never blocks.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: RelayEvent) {
        // No observers is fine
        let _ = self.tx.send(event);
    }

    /// Log a routing decision at info level and forward it to observers
    pub fn info(&self, line: String) {
        tracing::info!("{}", line);
        self.emit(RelayEvent::Log { line });
    }

    /// Log a routing miss or failure at warn level and forward it to observers
    pub fn warn(&self, line: String) {
        tracing::warn!("{}", line);
        self.emit(RelayEvent::Log { line });
    }
}
