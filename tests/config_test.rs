//! Configuration Loading Tests
//!
//! YAML files on disk, environment expansion and validation failures.

use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;
use trace_relay::config::{Config, ConfigError};
use trace_relay::logging::Severity;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_config() {
    let file = write_config(
        r#"
server:
  address: "127.0.0.1:8081"
logging:
  console:
    format: json
    min_level: debug
  aggregator:
    endpoint: "http://seq:5341"
    min_level: warn
    queue_capacity: 64
  failure_report_interval_seconds: 10
tracing:
  service_name: edge-api
  sampling:
    ratio: 0.25
  exporter:
    endpoint: "http://collector:4318"
    max_queue_size: 100
    max_export_batch_size: 10
relay:
  send_timeout_millis: 500
  max_send_attempts: 2
downstream:
  backend_url: "http://backend:5000"
metrics:
  enabled: false
  host: "127.0.0.1"
  port: 9191
"#,
    );

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.server.address, "127.0.0.1:8081");
    assert!(config.logging.console.is_json());
    assert_eq!(config.logging.console.severity(), Severity::Debug);
    let aggregator = config.logging.aggregator.as_ref().unwrap();
    assert_eq!(aggregator.endpoint, "http://seq:5341");
    assert_eq!(aggregator.severity(), Severity::Warn);
    assert_eq!(aggregator.queue_capacity, 64);
    assert_eq!(config.tracing.service_name, "edge-api");
    assert_eq!(config.tracing.sampling.ratio, 0.25);
    assert_eq!(config.tracing.exporter.max_export_batch_size, 10);
    assert_eq!(config.relay.max_send_attempts, 2);
    assert_eq!(
        config.downstream.backend_url.as_deref(),
        Some("http://backend:5000")
    );
    assert!(!config.metrics.enabled);
    assert_eq!(config.metrics.address(), "127.0.0.1:9191");
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = write_config("{}\n");
    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.server.address, "0.0.0.0:8080");
    assert_eq!(config.tracing.sampling.ratio, 1.0);
    assert!(config.logging.aggregator.is_none());
    assert!(config.downstream.backend_url.is_none());
    assert_eq!(config.relay.max_send_attempts, 3);
}

#[test]
#[serial]
fn test_env_expansion() {
    std::env::set_var("TRACE_RELAY_TEST_BACKEND", "http://backend.test:7000");
    let file = write_config(
        r#"
downstream:
  backend_url: "${TRACE_RELAY_TEST_BACKEND}"
tracing:
  exporter:
    endpoint: "${TRACE_RELAY_TEST_MISSING:-http://fallback:4318}"
"#,
    );

    let config = Config::load(file.path()).unwrap();
    std::env::remove_var("TRACE_RELAY_TEST_BACKEND");

    assert_eq!(
        config.downstream.backend_url.as_deref(),
        Some("http://backend.test:7000")
    );
    assert_eq!(config.tracing.exporter.endpoint, "http://fallback:4318");
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        "tracing:\n  sampling:\n    ratio: 1.5\n",
        "tracing:\n  service_name: \"\"\n",
        "logging:\n  console:\n    format: xml\n",
        "logging:\n  console:\n    min_level: loud\n",
        "relay:\n  max_send_attempts: 0\n",
        "downstream:\n  backend_url: \"ftp://backend\"\n",
        "tracing:\n  exporter:\n    initial_backoff_millis: 10000\n    max_backoff_millis: 100\n",
    ];

    for yaml in cases {
        let file = write_config(yaml);
        assert!(
            matches!(Config::load(file.path()), Err(ConfigError::ValidationError(_))),
            "accepted invalid config:\n{}",
            yaml
        );
    }
}

#[test]
fn test_missing_file() {
    assert!(matches!(
        Config::load("/nonexistent/trace-relay.yaml"),
        Err(ConfigError::IoError(_))
    ));
}

#[test]
fn test_malformed_yaml() {
    let file = write_config("server: [unclosed\n");
    assert!(matches!(
        Config::load(file.path()),
        Err(ConfigError::ParseError(_))
    ));
}
