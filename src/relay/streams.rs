// Named single-value streams (latest-value cache)

use crate::relay::envelope::Payload;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Result of looking up a stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLookup {
    /// No stream with this name exists
    NotFound,
    /// The stream was started but nothing has been published yet
    Empty,
    /// The most recently published value
    Present(Payload),
}

impl StreamLookup {
    /// The value as sent on the wire: `None` for an empty stream
    pub fn into_value(self) -> Option<Option<Payload>> {
        match self {
            StreamLookup::NotFound => None,
            StreamLookup::Empty => Some(None),
            StreamLookup::Present(value) => Some(Some(value)),
        }
    }
}

/// Registry of streams and their latest values
///
/// Streams have no owner: any client knowing a name may publish to it or
/// close it. Only the last published value is kept.
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Option<Payload>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Create a stream with no value. Returns false if it already existed,
    /// in which case its value is left untouched.
    pub async fn start(&self, name: &str) -> bool {
        let mut streams = self.streams.write().await;
        if streams.contains_key(name) {
            return false;
        }
        streams.insert(name.to_string(), None);
        true
    }

    /// Replace the value of a stream, creating it if needed.
    /// Returns true if the stream did not exist before.
    pub async fn publish(&self, name: &str, value: Payload) -> bool {
        let mut streams = self.streams.write().await;
        streams.insert(name.to_string(), Some(value)).is_none()
    }

    pub async fn get(&self, name: &str) -> StreamLookup {
        let streams = self.streams.read().await;
        match streams.get(name) {
            None => StreamLookup::NotFound,
            Some(None) => StreamLookup::Empty,
            Some(Some(value)) => StreamLookup::Present(value.clone()),
        }
    }

    /// Remove a stream. Returns false if there was nothing to remove.
    pub async fn close(&self, name: &str) -> bool {
        let mut streams = self.streams.write().await;
        streams.remove(name).is_some()
    }

    /// Stream names in sorted order
    pub async fn names(&self) -> Vec<String> {
        let streams = self.streams.read().await;
        let mut names: Vec<String> = streams.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.streams.read().await.is_empty()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
