//! Chat hub: client-facing methods over the relay
//!
//! Every hub method runs as its own logging operation inside a scope carrying
//! `Hub`, `Method` and `ConnectionId`. Anything logged while the method runs,
//! including the relay's own records, carries those fields.

use crate::logging::{with_operation, LogScope, StructuredLogger};
use crate::relay::{ChatMessage, ChatRelay, PublishReport, SubscriberHandle};
use crate::telemetry::propagation::TraceContext;
use crate::value::Fields;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Hub errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Connection {0} is not connected to the hub")]
    NotConnected(String),
}

/// The chat hub
pub struct ChatHub {
    name: String,
    relay: Arc<dyn ChatRelay>,
    logger: Arc<StructuredLogger>,
    is_connected: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl std::fmt::Debug for ChatHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatHub").field("name", &self.name).finish()
    }
}

impl ChatHub {
    pub const DEFAULT_NAME: &'static str = "ChatHub";

    /// Create a hub over `relay`
    ///
    /// `is_connected` tells the hub whether a caller-supplied connection id
    /// belongs to a live connection.
    pub fn new(
        relay: Arc<dyn ChatRelay>,
        logger: Arc<StructuredLogger>,
        is_connected: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            relay,
            logger,
            is_connected: Box::new(is_connected),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self, method: &str, connection_id: Option<&str>) -> LogScope {
        let mut fields = Fields::new()
            .with("Hub", self.name.as_str())
            .with("Method", method);
        if let Some(id) = connection_id {
            fields.insert("ConnectionId", id);
        }
        self.logger.begin_scope(fields)
    }

    /// Run a hub method with invocation logging
    pub async fn invoke<F, Fut, T, E>(
        &self,
        method: &str,
        connection_id: Option<&str>,
        correlation: Option<&TraceContext>,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        with_operation(async move {
            let scope = self.scope(method, connection_id);
            scope.debug("Hub method invoked: {Hub}.{Method}", Fields::new(), correlation);

            let started = Instant::now();
            let result = work().await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &result {
                Ok(_) => scope.debug(
                    "Hub method completed: {Hub}.{Method} in {ElapsedMs} ms",
                    Fields::new().with("ElapsedMs", elapsed_ms),
                    correlation,
                ),
                Err(e) => scope.error(
                    "Hub method failed: {Hub}.{Method}: {Error}",
                    Fields::new()
                        .with("ElapsedMs", elapsed_ms)
                        .with("Error", e.to_string()),
                    correlation,
                ),
            }

            result
        })
        .await
    }

    /// A client connected
    pub fn on_connected(&self, connection_id: &str) -> SubscriberHandle {
        let handle = self.relay.subscribe(connection_id);
        self.scope("OnConnected", Some(connection_id)).info(
            "Hub connection opened. ConnectionId: {ConnectionId}",
            Fields::new(),
            None,
        );
        handle
    }

    /// A client disconnected
    pub fn on_disconnected(&self, connection_id: &str) -> bool {
        let removed = self.relay.unsubscribe(connection_id);
        self.scope("OnDisconnected", Some(connection_id)).info(
            "Hub connection closed. ConnectionId: {ConnectionId}",
            Fields::new(),
            None,
        );
        removed
    }

    /// `SendMessage(user, message)`: broadcast to every connected client
    ///
    /// A caller that names a connection id must be connected.
    pub async fn send_message(
        &self,
        connection_id: Option<&str>,
        message: ChatMessage,
    ) -> Result<PublishReport, HubError> {
        let correlation = message.received_context.clone();
        self.invoke("SendMessage", connection_id, correlation.as_ref(), move || async move {
            if let Some(id) = connection_id {
                if !(self.is_connected)(id) {
                    return Err(HubError::NotConnected(id.to_string()));
                }
            }
            Ok(self.relay.publish(message).await)
        })
        .await
    }
}
