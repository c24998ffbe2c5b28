//! Process-wide `tracing` subscriber setup
//!
//! The console sink and the crate's own diagnostics both go through the
//! subscriber installed here:
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, default from config)
//!   └── Fmt Layer (pretty or JSON)
//! ```

use crate::config::ConsoleConfig;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Logging setup errors
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Subscriber error: {0}")]
    Subscriber(String),
}

/// Initialize the global subscriber
///
/// `RUST_LOG` takes precedence; otherwise the console `min_level` is used.
///
/// # Errors
///
/// Returns [`LoggingError::Subscriber`] if a global subscriber is already set.
pub fn init_subscriber(config: &ConsoleConfig) -> Result<(), LoggingError> {
    let default_level = config.severity().to_string();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if config.is_json() {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer);

        tracing::subscriber::set_global_default(subscriber).map_err(|e| {
            LoggingError::Subscriber(format!(
                "Failed to set global subscriber (may already be initialized): {}",
                e
            ))
        })?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer);

        tracing::subscriber::set_global_default(subscriber).map_err(|e| {
            LoggingError::Subscriber(format!(
                "Failed to set global subscriber (may already be initialized): {}",
                e
            ))
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = ConsoleConfig::default();
        // The first call may already have happened in another test
        let _ = init_subscriber(&config);
        assert!(matches!(
            init_subscriber(&config),
            Err(LoggingError::Subscriber(_))
        ));
    }
}
