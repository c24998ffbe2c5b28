//! Application state module.
//!
//! [`AppState::build`] is the composition root: it validates the
//! configuration and constructs the logger, sampler, exporter, relay, hub and
//! downstream client once. Handlers receive the state explicitly.

use crate::config::{Config, ConfigError};
use crate::logging::{
    AggregatorHandle, AggregatorSink, ConsoleSink, LogSink, LoggingError, StructuredLogger,
};
use crate::relay::{BroadcastRelay, ChannelConnectionLayer, ChatHub};
use crate::telemetry::{
    BackendCallError, BackendChatClient, ExportError, ExporterSettings, HttpSpanTransport,
    OutboundCallDecorator, Sampler, SpanTransport, TraceExporter, TracedHttpClient,
};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while wiring the application
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging setup error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Exporter setup error: {0}")]
    Export(#[from] ExportError),

    #[error("Backend client setup error: {0}")]
    Backend(#[from] BackendCallError),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Shared state passed to every request handler
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    logger: Arc<StructuredLogger>,
    sampler: Sampler,
    exporter: Arc<TraceExporter>,
    connections: Arc<ChannelConnectionLayer>,
    relay: Arc<BroadcastRelay>,
    hub: Arc<ChatHub>,
    backend: Option<BackendChatClient>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("logger", &self.logger)
            .field("sampler", &self.sampler)
            .field("relay", &self.relay)
            .field("backend", &self.backend.as_ref().map(|b| b.send_url().as_str()))
            .finish()
    }
}

/// Owns the background tasks started by [`AppState::build`]
///
/// Call [`StateGuard::shutdown`] on exit so buffered spans and log records
/// are delivered.
#[derive(Debug)]
pub struct StateGuard {
    exporter: Arc<TraceExporter>,
    aggregator: Option<AggregatorHandle>,
}

impl StateGuard {
    pub async fn shutdown(self) {
        self.exporter.shutdown().await;
        if let Some(aggregator) = self.aggregator {
            aggregator.shutdown().await;
        }
    }
}

/// Builder for [`AppState`]
///
/// Extra sinks and a custom span transport can be supplied, which is how
/// tests observe what the application logs and exports.
pub struct AppStateBuilder {
    config: Config,
    console: bool,
    extra_sinks: Vec<Arc<dyn LogSink>>,
    transport: Option<Arc<dyn SpanTransport>>,
}

impl AppStateBuilder {
    /// Do not register the console sink
    pub fn without_console(mut self) -> Self {
        self.console = false;
        self
    }

    /// Register an additional sink after the configured ones
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.extra_sinks.push(sink);
        self
    }

    /// Export spans through `transport` instead of the OTLP/HTTP collector
    pub fn with_transport(mut self, transport: Arc<dyn SpanTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validate the configuration and construct every component
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<(AppState, StateGuard), StateError> {
        let config = self.config;
        config.validate()?;

        // Logging
        let mut logger = StructuredLogger::builder()
            .failure_report_interval(config.logging.failure_report_interval());
        if self.console {
            logger = logger.with_sink(ConsoleSink::new(config.logging.console.severity()));
        }
        let mut aggregator_handle = None;
        if let Some(ref aggregator) = config.logging.aggregator {
            let (sink, handle) = AggregatorSink::spawn(
                &aggregator.endpoint,
                aggregator.severity(),
                aggregator.queue_capacity,
                aggregator.timeout(),
            )?;
            logger = logger.with_sink(sink);
            aggregator_handle = Some(handle);
        }
        for sink in self.extra_sinks {
            logger = logger.with_shared_sink(sink);
        }
        let logger = Arc::new(logger.build());

        // Tracing
        let sampler = Sampler::new(config.tracing.sampling.ratio);
        let transport: Arc<dyn SpanTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpSpanTransport::new(
                &config.tracing.exporter.endpoint,
                &config.tracing.service_name,
                config.tracing.exporter.timeout(),
            )?),
        };
        let exporter = TraceExporter::start(
            ExporterSettings::from(&config.tracing.exporter),
            transport,
            Arc::clone(&logger),
        );

        // Relay
        let connections = Arc::new(ChannelConnectionLayer::default());
        let relay = Arc::new(BroadcastRelay::new(
            &config.relay,
            connections.clone(),
            Arc::clone(&logger),
        ));
        let probe = Arc::clone(&connections);
        let hub = Arc::new(ChatHub::new(relay.clone(), Arc::clone(&logger), move |id| {
            probe.is_open(id)
        }));

        // Downstream
        let backend = match config.downstream.backend_url {
            Some(ref url) => {
                let client = reqwest::Client::builder()
                    .timeout(config.downstream.timeout())
                    .build()?;
                let decorator = OutboundCallDecorator::new(sampler, Arc::clone(&exporter));
                Some(BackendChatClient::new(
                    url,
                    TracedHttpClient::new(client, decorator),
                )?)
            }
            None => None,
        };

        tracing::debug!(
            sinks = ?logger.sink_names(),
            sampling_ratio = sampler.ratio(),
            backend = backend.is_some(),
            "Application state built"
        );

        let guard = StateGuard {
            exporter: Arc::clone(&exporter),
            aggregator: aggregator_handle,
        };
        let state = AppState {
            config: Arc::new(config),
            logger,
            sampler,
            exporter,
            connections,
            relay,
            hub,
            backend,
        };

        Ok((state, guard))
    }
}

impl AppState {
    pub fn builder(config: Config) -> AppStateBuilder {
        AppStateBuilder {
            config,
            console: true,
            extra_sinks: Vec::new(),
            transport: None,
        }
    }

    /// Build the state from configuration
    pub fn build(config: &Config) -> Result<(Self, StateGuard), StateError> {
        Self::builder(config.clone()).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logger(&self) -> &Arc<StructuredLogger> {
        &self.logger
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn exporter(&self) -> &Arc<TraceExporter> {
        &self.exporter
    }

    pub fn connections(&self) -> &Arc<ChannelConnectionLayer> {
        &self.connections
    }

    pub fn relay(&self) -> &Arc<BroadcastRelay> {
        &self.relay
    }

    pub fn hub(&self) -> &Arc<ChatHub> {
        &self.hub
    }

    pub fn backend(&self) -> Option<&BackendChatClient> {
        self.backend.as_ref()
    }
}
