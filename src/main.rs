//! Trace Relay - chat broadcast relay with W3C trace propagation
//!
//! Correlates every log record with the active trace and exports spans to an
//! OTLP/HTTP collector.

use clap::Parser;
use std::path::PathBuf;
use trace_relay::logging::init_subscriber;
use trace_relay::{config::Config, server::Server, state::AppState};
use tracing::info;

/// Trace Relay - chat broadcast relay with W3C trace propagation
#[derive(Parser, Debug)]
#[command(name = "trace-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Console log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(&args.config)?;
    if let Some(level) = args.log_level {
        config.logging.console.min_level = level;
        config.validate()?;
    }

    // Initialize logging
    init_subscriber(&config.logging.console)?;

    info!("Starting Trace Relay v{}", trace_relay::VERSION);
    info!("Loaded configuration from {:?}", args.config);

    let (state, guard) = AppState::build(&config)?;

    #[cfg(feature = "metrics")]
    let metrics_server = if config.metrics.enabled {
        use trace_relay::metrics::server::MetricsServer;

        let server = MetricsServer::bind(&config.metrics).await?;
        info!("Metrics server listening on {}", server.local_addr());
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(async {
            let _ = shutdown_rx.await;
        }));
        Some((shutdown_tx, handle))
    } else {
        None
    };

    // Start server
    let result = match Server::bind(state).await {
        Ok(server) => server.run().await,
        Err(e) => Err(e),
    };

    #[cfg(feature = "metrics")]
    if let Some((shutdown_tx, handle)) = metrics_server {
        let _ = shutdown_tx.send(());
        if let Ok(Err(e)) = handle.await {
            tracing::warn!("Metrics server error: {}", e);
        }
    }

    guard.shutdown().await;
    result?;

    Ok(())
}
