//! Trace Relay Library
//!
//! W3C trace-context propagation with correlated structured logging, wrapped
//! around a chat broadcast relay.
//!
//! # Features
//!
//! - **Trace Context**: `traceparent`/`tracestate` extraction and injection
//! - **Sampling**: Parent-based, deterministic ratio sampling
//! - **Span Export**: Bounded buffer, batched OTLP/HTTP export with retry
//! - **Structured Logging**: Message templates, scopes, console and
//!   CLEF aggregator sinks, every record correlated with its trace
//! - **Broadcast Relay**: Per-subscriber delivery with bounded retries
//!
//! # Example
//!
//! ```no_run
//! use trace_relay::{config::Config, server::Server, state::AppState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let (state, guard) = AppState::build(&config)?;
//!     Server::bind(state).await?.run().await?;
//!     guard.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod logging;
pub mod metrics;
pub mod relay;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod value;

// Re-export commonly used types
pub use config::Config;
pub use server::Server;
pub use state::AppState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
