//! Connection layer: how the relay reaches one subscriber

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Delivery errors for a single subscriber
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    #[error("Send failed: {0}")]
    Failed(String),
}

/// One event pushed to a connection
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEvent {
    pub event: String,
    pub payload: Value,
}

/// Transport to connected clients
#[async_trait]
pub trait ConnectionLayer: Send + Sync {
    async fn send(&self, connection_id: &str, event: &str, payload: &Value)
        -> Result<(), SendError>;
}

/// Connection layer backed by one bounded channel per connection
///
/// The receiving half is handed to whatever serves the client (the SSE
/// stream). A full channel makes `send` wait, which the relay bounds with
/// its per-attempt timeout.
#[derive(Debug)]
pub struct ChannelConnectionLayer {
    channels: DashMap<String, mpsc::Sender<RelayEvent>>,
    capacity: usize,
}

impl ChannelConnectionLayer {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Register a connection and return the receiving half of its channel
    pub fn open(&self, connection_id: &str) -> mpsc::Receiver<RelayEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.channels.insert(connection_id.to_string(), tx);
        rx
    }

    /// Forget a connection; returns false if it was not open
    pub fn close(&self, connection_id: &str) -> bool {
        self.channels.remove(connection_id).is_some()
    }

    pub fn is_open(&self, connection_id: &str) -> bool {
        self.channels.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for ChannelConnectionLayer {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl ConnectionLayer for ChannelConnectionLayer {
    async fn send(
        &self,
        connection_id: &str,
        event: &str,
        payload: &Value,
    ) -> Result<(), SendError> {
        // Clone the sender so no map guard is held across the await
        let sender = self
            .channels
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SendError::UnknownConnection(connection_id.to_string()))?;

        sender
            .send(RelayEvent {
                event: event.to_string(),
                payload: payload.clone(),
            })
            .await
            .map_err(|_| SendError::Closed(connection_id.to_string()))
    }
}
