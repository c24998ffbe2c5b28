//! Chat broadcast relay
//!
//! [`BroadcastRelay`] fans a chat message out to every connected subscriber.
//! Delivery is concurrent and best-effort: each subscriber gets a bounded
//! number of attempts, each bounded by a timeout, and a subscriber that fails
//! all of them is disconnected. A slow or broken subscriber never delays the
//! others beyond the per-attempt timeout, and `publish` never fails.
//!
//! If a publish is cancelled while an attempt is in flight, that attempt is
//! abandoned and counted as one failure. The count carries over to the
//! subscriber's next delivery and shrinks its attempt budget there.

pub mod connection;
pub mod hub;

pub use connection::{ChannelConnectionLayer, ConnectionLayer, RelayEvent, SendError};
pub use hub::{ChatHub, HubError};

use crate::config::RelayConfig;
use crate::logging::StructuredLogger;
use crate::telemetry::propagation::TraceContext;
use crate::value::Fields;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Event name used for broadcast chat messages
pub const RECEIVE_MESSAGE_EVENT: &str = "ReceiveMessage";

/// A chat message on its way through the relay
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub message: String,
    /// Context of the request that carried the message
    #[serde(skip)]
    pub received_context: Option<TraceContext>,
}

impl ChatMessage {
    pub fn new(user: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            message: message.into(),
            received_context: None,
        }
    }

    pub fn with_context(mut self, context: TraceContext) -> Self {
        self.received_context = Some(context);
        self
    }

    /// Wire payload: `{"user": .., "message": ..}`
    pub fn payload(&self) -> Value {
        json!({ "user": self.user, "message": self.message })
    }
}

/// Subscriber connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connected,
    Disconnected,
}

/// Returned by [`ChatRelay::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberHandle {
    connection_id: String,
    connected_at: DateTime<Utc>,
}

impl SubscriberHandle {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }
}

/// Outcome of one publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that received the message
    pub delivered: Vec<String>,
    /// Subscribers removed after every attempt failed
    pub disconnected: Vec<String>,
    /// Total send attempts made, successful or not
    pub attempts: usize,
}

impl PublishReport {
    /// Number of subscribers in the publish snapshot
    pub fn recipients(&self) -> usize {
        self.delivered.len() + self.disconnected.len()
    }
}

/// The relay surface used by the HTTP and hub adapters
#[async_trait]
pub trait ChatRelay: Send + Sync {
    /// Deliver a message to every connected subscriber. Never fails.
    async fn publish(&self, message: ChatMessage) -> PublishReport;

    /// Register a connection opened by the connection layer
    fn subscribe(&self, connection_id: &str) -> SubscriberHandle;

    /// Remove a subscriber; returns false if it was not connected
    fn unsubscribe(&self, connection_id: &str) -> bool;
}

/// Fan-out relay over a [`ConnectionLayer`]
pub struct BroadcastRelay {
    subscribers: DashMap<String, SubscriberHandle>,
    /// Failures left over from abandoned deliveries, per connection
    carried_failures: DashMap<String, u32>,
    connections: Arc<dyn ConnectionLayer>,
    logger: Arc<StructuredLogger>,
    send_timeout: Duration,
    max_send_attempts: u32,
}

impl std::fmt::Debug for BroadcastRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastRelay")
            .field("subscribers", &self.subscribers.len())
            .field("send_timeout", &self.send_timeout)
            .field("max_send_attempts", &self.max_send_attempts)
            .finish()
    }
}

impl BroadcastRelay {
    pub fn new(
        config: &RelayConfig,
        connections: Arc<dyn ConnectionLayer>,
        logger: Arc<StructuredLogger>,
    ) -> Self {
        Self {
            subscribers: DashMap::new(),
            carried_failures: DashMap::new(),
            connections,
            logger,
            send_timeout: config.send_timeout(),
            max_send_attempts: config.max_send_attempts.max(1),
        }
    }

    pub fn state(&self, connection_id: &str) -> SubscriberState {
        if self.subscribers.contains_key(connection_id) {
            SubscriberState::Connected
        } else {
            SubscriberState::Disconnected
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Failures a subscriber carries into its next delivery
    pub fn carried_failures(&self, connection_id: &str) -> u32 {
        self.carried_failures
            .get(connection_id)
            .map(|n| *n)
            .unwrap_or(0)
    }

    /// Try one subscriber up to `max_send_attempts` times, less any failures
    /// carried over from abandoned deliveries
    ///
    /// Returns the number of attempts used, or the last error.
    async fn deliver(&self, connection_id: &str, payload: &Value) -> (usize, Result<(), SendError>) {
        let carried = self
            .carried_failures
            .remove(connection_id)
            .map(|(_, n)| n)
            .unwrap_or(0);
        let mut tally = FailureTally {
            carried_failures: &self.carried_failures,
            connection_id,
            failures: carried,
            settled: false,
        };

        let budget = self.max_send_attempts.saturating_sub(carried) as usize;
        let mut last_error = SendError::Failed("send attempts abandoned".into());
        let mut attempts = 0;

        while attempts < budget {
            attempts += 1;
            let sent = tokio::time::timeout(
                self.send_timeout,
                self.connections
                    .send(connection_id, RECEIVE_MESSAGE_EVENT, payload),
            )
            .await;

            match sent {
                Ok(Ok(())) => {
                    tally.settled = true;
                    return (attempts, Ok(()));
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = SendError::Timeout(self.send_timeout),
            }

            tally.failures += 1;
            crate::metrics::record_relay_attempt_failure();
            tracing::debug!(
                connection_id,
                attempt = attempts,
                error = %last_error,
                "Relay send attempt failed"
            );
        }

        tally.settled = true;
        (attempts, Err(last_error))
    }
}

/// Failure count of one delivery in progress
///
/// Dropped unsettled means the delivery was cancelled mid-attempt: the
/// in-flight attempt becomes a failure and the total is carried over.
struct FailureTally<'a> {
    carried_failures: &'a DashMap<String, u32>,
    connection_id: &'a str,
    failures: u32,
    settled: bool,
}

impl Drop for FailureTally<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        crate::metrics::record_relay_attempt_failure();
        self.carried_failures
            .insert(self.connection_id.to_string(), self.failures + 1);
        tracing::debug!(
            connection_id = self.connection_id,
            failures = self.failures + 1,
            "Relay send attempt abandoned"
        );
    }
}

#[async_trait]
impl ChatRelay for BroadcastRelay {
    async fn publish(&self, message: ChatMessage) -> PublishReport {
        let correlation = message.received_context.as_ref();

        self.logger.info(
            "Chat message received. User: {User}, MessageLength: {MessageLength}",
            Fields::new()
                .with("User", &message.user)
                .with("MessageLength", message.message.encode_utf16().count()),
            correlation,
        );

        // Snapshot; subscribers joining from here on miss this message
        let snapshot: Vec<String> = self
            .subscribers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let payload = message.payload();
        let results = join_all(snapshot.iter().map(|id| self.deliver(id, &payload))).await;

        let mut report = PublishReport::default();
        for (connection_id, (attempts, result)) in snapshot.into_iter().zip(results) {
            report.attempts += attempts;
            match result {
                Ok(()) => {
                    crate::metrics::record_relay_delivery("delivered");
                    report.delivered.push(connection_id);
                }
                Err(e) => {
                    crate::metrics::record_relay_delivery("disconnected");
                    self.unsubscribe(&connection_id);
                    self.logger.warn(
                        "Subscriber {ConnectionId} disconnected after {Attempts} failed send attempts: {Error}",
                        Fields::new()
                            .with("ConnectionId", &connection_id)
                            .with("Attempts", attempts)
                            .with("Error", e.to_string()),
                        correlation,
                    );
                    report.disconnected.push(connection_id);
                }
            }
        }

        report
    }

    fn subscribe(&self, connection_id: &str) -> SubscriberHandle {
        let handle = SubscriberHandle {
            connection_id: connection_id.to_string(),
            connected_at: Utc::now(),
        };
        self.subscribers
            .insert(connection_id.to_string(), handle.clone());
        crate::metrics::set_relay_subscribers(self.subscribers.len());
        handle
    }

    fn unsubscribe(&self, connection_id: &str) -> bool {
        self.carried_failures.remove(connection_id);
        let removed = self.subscribers.remove(connection_id).is_some();
        if removed {
            crate::metrics::set_relay_subscribers(self.subscribers.len());
        }
        removed
    }
}

/// New random connection id
pub fn new_connection_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
