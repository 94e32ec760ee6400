//! Integration tests for configuration loading

use std::io::Write;

use skillswap_sync::config::{AppConfig, LoggingConfig, RetryConfig};
use skillswap_sync::error::SyncError;
use tempfile::Builder;

fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn test_default_sync_values() {
    let config = AppConfig::default();

    assert_eq!(config.sync.reconcile_interval_secs, 30);
    assert_eq!(config.sync.inbox_message_window, 1000);
    assert_eq!(config.sync.echo_match_window_secs, 120);
    assert_eq!(config.sync.feed_buffer, 256);
}

#[test]
fn test_default_retry_and_session_values() {
    let config = AppConfig::default();

    assert_eq!(
        config.retry,
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
        }
    );
    assert_eq!(config.session.tick_millis, 1000);
    assert_eq!(config.session.reminder_check_secs, 60);
    assert_eq!(config.session.reminder_lead_minutes, 15);
}

#[test]
fn test_default_logging_config() {
    let config = AppConfig::default();

    assert_eq!(
        config.logging,
        LoggingConfig {
            level: "info".to_string(),
            file_path: None,
            format: "text".to_string(),
        }
    );
}

#[test]
fn test_load_from_file_overrides_only_given_keys() {
    let file = yaml_file(
        "sync:\n  reconcile_interval_secs: 5\nlogging:\n  level: debug\n  format: json\n",
    );

    let config = AppConfig::load_from(file.path()).expect("config loads");

    assert_eq!(config.sync.reconcile_interval_secs, 5);
    assert_eq!(config.sync.inbox_message_window, 1000);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.format, "json");
    assert_eq!(config.retry.max_attempts, 3);
}

#[test]
fn test_load_from_file_rejects_invalid_values() {
    let file = yaml_file("retry:\n  initial_backoff_ms: 900\n  max_backoff_ms: 100\n");

    let result = AppConfig::load_from(file.path());

    assert!(matches!(result, Err(SyncError::Config(_))));
}

#[test]
fn test_validation_rejects_unknown_level_and_format() {
    let mut config = AppConfig::default();
    config.logging.level = "verbose".to_string();
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.logging.format = "xml".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_zero_periods() {
    let mut config = AppConfig::default();
    config.sync.reconcile_interval_secs = 0;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.session.tick_millis = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_yaml_rendering_round_trips_through_a_file() {
    let mut config = AppConfig::default();
    config.sync.echo_match_window_secs = 45;
    let rendered = config.to_yaml().expect("renders");
    assert!(rendered.contains("echo_match_window_secs: 45"));

    let file = yaml_file(&rendered);
    let loaded = AppConfig::load_from(file.path()).expect("rendered config loads");
    assert_eq!(loaded, config);
}
