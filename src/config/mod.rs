//! Configuration module for trace-relay
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation. A configuration that fails
//! validation is rejected before any component is constructed.

use crate::logging::record::Severity;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
        return s.to_string();
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    matches!(rest, Some(host) if !host.is_empty())
}

fn validate_severity(name: &str, field: &str) -> Result<Severity, ConfigError> {
    name.parse::<Severity>()
        .map_err(|e| ConfigError::ValidationError(format!("Invalid {}: {}", field, e)))
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub downstream: DownstreamConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Server address cannot be empty".into(),
            ));
        }

        // Logging
        match self.logging.console.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid console format '{}': must be 'pretty' or 'json'",
                    other
                )))
            }
        }
        validate_severity(&self.logging.console.min_level, "console min_level")?;

        if let Some(ref aggregator) = self.logging.aggregator {
            if !is_valid_http_url(&aggregator.endpoint) {
                return Err(ConfigError::ValidationError(
                    "Invalid aggregator endpoint: must start with http:// or https://".into(),
                ));
            }
            validate_severity(&aggregator.min_level, "aggregator min_level")?;
            if aggregator.queue_capacity == 0 {
                return Err(ConfigError::ValidationError(
                    "Aggregator queue_capacity must be greater than zero".into(),
                ));
            }
        }

        // Tracing
        if self.tracing.service_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Service name cannot be empty".into(),
            ));
        }

        let ratio = self.tracing.sampling.ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid sampling ratio {}: must be between 0.0 and 1.0",
                ratio
            )));
        }

        let exporter = &self.tracing.exporter;
        if !is_valid_http_url(&exporter.endpoint) {
            return Err(ConfigError::ValidationError(
                "Invalid exporter endpoint: must start with http:// or https://".into(),
            ));
        }
        if exporter.max_queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "Exporter max_queue_size must be greater than zero".into(),
            ));
        }
        if exporter.max_export_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "Exporter max_export_batch_size must be greater than zero".into(),
            ));
        }
        if exporter.initial_backoff_millis > exporter.max_backoff_millis {
            return Err(ConfigError::ValidationError(format!(
                "Exporter initial_backoff_millis ({}) exceeds max_backoff_millis ({})",
                exporter.initial_backoff_millis, exporter.max_backoff_millis
            )));
        }

        // Relay
        if self.relay.max_send_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "Relay max_send_attempts must be at least 1".into(),
            ));
        }
        if self.relay.send_timeout_millis == 0 {
            return Err(ConfigError::ValidationError(
                "Relay send_timeout_millis must be greater than zero".into(),
            ));
        }

        // Downstream
        if let Some(ref url) = self.downstream.backend_url {
            if !is_valid_http_url(url) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid backend_url '{}': must start with http:// or https://",
                    url
                )));
            }
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
        }
    }
}

fn default_server_address() -> String {
    "0.0.0.0:8080".to_string()
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Structured logging configuration.
///
/// # Example
///
/// ```yaml
/// logging:
///   console:
///     format: "json"
///     min_level: "info"
///   aggregator:
///     endpoint: "${SEQ_URL:-http://localhost:5341}"
///     min_level: "info"
///   failure_report_interval_seconds: 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub console: ConsoleConfig,

    /// Optional log aggregator. When absent only the console sink is used.
    #[serde(default)]
    pub aggregator: Option<AggregatorConfig>,

    /// Minimum interval between two failure reports for the same sink. Default: 30
    #[serde(default = "default_failure_report_interval")]
    pub failure_report_interval_seconds: u64,
}

impl LoggingConfig {
    pub fn failure_report_interval(&self) -> Duration {
        Duration::from_secs(self.failure_report_interval_seconds)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console: ConsoleConfig::default(),
            aggregator: None,
            failure_report_interval_seconds: default_failure_report_interval(),
        }
    }
}

fn default_failure_report_interval() -> u64 {
    30
}

/// Console sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// "pretty" for human-readable output, "json" for one object per line. Default: "pretty"
    #[serde(default = "default_console_format")]
    pub format: String,

    /// Minimum severity written to the console. Default: "info"
    #[serde(default = "default_min_level")]
    pub min_level: String,
}

impl ConsoleConfig {
    pub fn is_json(&self) -> bool {
        self.format == "json"
    }

    /// Parsed threshold; falls back to info for a value that never went through validation
    pub fn severity(&self) -> Severity {
        self.min_level.parse().unwrap_or(Severity::Info)
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            format: default_console_format(),
            min_level: default_min_level(),
        }
    }
}

fn default_console_format() -> String {
    "pretty".to_string()
}

fn default_min_level() -> String {
    "info".to_string()
}

/// Seq-compatible log aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Aggregator base URL. Supports ${VAR} expansion.
    #[serde(deserialize_with = "deserialize_with_env")]
    pub endpoint: String,

    #[serde(default = "default_min_level")]
    pub min_level: String,

    /// Records buffered for the delivery task. Default: 1024
    #[serde(default = "default_aggregator_queue_capacity")]
    pub queue_capacity: usize,

    /// Timeout for one delivery request in seconds. Default: 5
    #[serde(default = "default_aggregator_timeout")]
    pub timeout_seconds: u64,
}

impl AggregatorConfig {
    pub fn severity(&self) -> Severity {
        self.min_level.parse().unwrap_or(Severity::Info)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_aggregator_queue_capacity() -> usize {
    1024
}

fn default_aggregator_timeout() -> u64 {
    5
}

/// Custom deserializer for strings with environment variable expansion.
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

fn deserialize_option_with_env<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    Ok(s.map(|s| expand_env_vars(&s)))
}

// ============================================================================
// Tracing Configuration
// ============================================================================

/// Distributed tracing configuration.
///
/// # Example
///
/// ```yaml
/// tracing:
///   service_name: "trace-relay"
///   sampling:
///     ratio: 0.1  # Sample 10% of new traces
///   exporter:
///     endpoint: "${OTLP_ENDPOINT:-http://localhost:4318}"
///     max_queue_size: 2048
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Service name reported with every exported span. Supports ${VAR} expansion.
    /// Default: "trace-relay"
    #[serde(
        default = "default_service_name",
        deserialize_with = "deserialize_with_env"
    )]
    pub service_name: String,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub exporter: ExporterConfig,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            sampling: SamplingConfig::default(),
            exporter: ExporterConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "trace-relay".to_string()
}

/// Trace sampling configuration.
///
/// Inbound requests carrying a trace context always keep the caller's
/// decision; `ratio` applies only to traces started by this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Sampling ratio (0.0 to 1.0). Default: 1.0
    #[serde(default = "default_sampling_ratio")]
    pub ratio: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            ratio: default_sampling_ratio(),
        }
    }
}

fn default_sampling_ratio() -> f64 {
    1.0
}

/// Span exporter configuration.
///
/// Spans are buffered and exported when either the batch size or the
/// scheduled delay is reached. Failed batches are retried with exponential
/// backoff.
///
/// # Performance Tuning
/// - Increase `max_queue_size` for high-throughput scenarios
/// - Decrease `scheduled_delay_millis` for lower latency (more frequent exports)
/// - Adjust `max_export_batch_size` based on collector limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Collector base URL (OTLP/HTTP). Supports ${VAR} expansion.
    #[serde(
        default = "default_exporter_endpoint",
        deserialize_with = "deserialize_with_env"
    )]
    pub endpoint: String,

    /// Timeout for one export request in seconds. Default: 10
    #[serde(default = "default_exporter_timeout")]
    pub timeout_seconds: u64,

    /// Buffer capacity; the oldest span is evicted when full. Default: 2048
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Delay in milliseconds between scheduled exports. Default: 5000
    #[serde(default = "default_scheduled_delay")]
    pub scheduled_delay_millis: u64,

    /// Maximum number of spans per export batch. Default: 512
    #[serde(default = "default_max_export_batch_size")]
    pub max_export_batch_size: usize,

    /// Retries after the first failed attempt. Default: 3
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_millis: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_millis: u64,
}

impl ExporterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: default_exporter_endpoint(),
            timeout_seconds: default_exporter_timeout(),
            max_queue_size: default_max_queue_size(),
            scheduled_delay_millis: default_scheduled_delay(),
            max_export_batch_size: default_max_export_batch_size(),
            max_retries: default_max_retries(),
            initial_backoff_millis: default_initial_backoff(),
            max_backoff_millis: default_max_backoff(),
        }
    }
}

fn default_exporter_endpoint() -> String {
    "http://localhost:4318".to_string()
}

fn default_exporter_timeout() -> u64 {
    10
}

fn default_max_queue_size() -> usize {
    2048
}

fn default_scheduled_delay() -> u64 {
    5000
}

fn default_max_export_batch_size() -> usize {
    512
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    5000
}

// ============================================================================
// Relay / Downstream / Metrics
// ============================================================================

/// Broadcast relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Timeout for one delivery attempt to one subscriber. Default: 2000
    #[serde(default = "default_send_timeout")]
    pub send_timeout_millis: u64,

    /// Attempts per subscriber before it is disconnected. Default: 3
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
}

impl RelayConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_millis)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            send_timeout_millis: default_send_timeout(),
            max_send_attempts: default_max_send_attempts(),
        }
    }
}

fn default_send_timeout() -> u64 {
    2000
}

fn default_max_send_attempts() -> u32 {
    3
}

/// Downstream backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamConfig {
    /// Backend base URL. When set, accepted chat messages are also forwarded
    /// to `<backend_url>/api/chat/send`. Supports ${VAR} expansion.
    #[serde(default, deserialize_with = "deserialize_option_with_env")]
    pub backend_url: Option<String>,

    /// Timeout for one backend request in seconds. Default: 30
    #[serde(default = "default_downstream_timeout")]
    pub timeout_seconds: u64,
}

impl DownstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            timeout_seconds: default_downstream_timeout(),
        }
    }
}

fn default_downstream_timeout() -> u64 {
    30
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl MetricsConfig {
    /// `host:port` for the scrape listener
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.address, "0.0.0.0:8080");
        assert_eq!(config.tracing.exporter.max_queue_size, 2048);
        assert_eq!(config.relay.max_send_attempts, 3);
        assert!(config.downstream.backend_url.is_none());
    }

    #[test]
    fn test_config_validation_rejects_bad_ratio() {
        let mut config = Config::default();
        config.tracing.sampling.ratio = 1.5;
        assert!(config.validate().is_err());

        config.tracing.sampling.ratio = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_zero_capacity() {
        let mut config = Config::default();
        config.tracing.exporter.max_queue_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_zero_attempts() {
        let mut config = Config::default();
        config.relay.max_send_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_unknown_format() {
        let mut config = Config::default();
        config.logging.console.format = "xml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_is_valid_http_url() {
        assert!(is_valid_http_url("http://localhost:4318"));
        assert!(is_valid_http_url("https://collector"));
        assert!(!is_valid_http_url("grpc://collector"));
        assert!(!is_valid_http_url("http://"));
    }

    #[test]
    fn test_expand_env_vars_default_syntax() {
        assert_eq!(
            expand_env_vars("${TRACE_RELAY_SURELY_UNSET_VAR:-fallback}"),
            "fallback"
        );
        assert_eq!(
            expand_env_vars("keep ${TRACE_RELAY_SURELY_UNSET_VAR}"),
            "keep ${TRACE_RELAY_SURELY_UNSET_VAR}"
        );
    }
}
