use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Application configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Feed, cache and reconciliation settings
    pub sync: SyncConfig,
    /// Retry policy for idempotent reads
    pub retry: RetryConfig,
    /// Meeting clock settings
    pub session: SessionConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Feed, cache and reconciliation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the authoritative unread recount
    pub reconcile_interval_secs: u64,
    /// Number of recent messages the inbox composes previews from
    pub inbox_message_window: usize,
    /// How far apart an optimistic message and its echo may be
    pub echo_match_window_secs: u64,
    /// Pending signals a subscription may buffer before it is marked lagged
    pub feed_buffer: usize,
}

/// Retry policy for idempotent reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first
    pub max_attempts: u32,
    /// First backoff ceiling
    pub initial_backoff_ms: u64,
    /// Backoff cap
    pub max_backoff_ms: u64,
}

/// Meeting clock settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Phase re-evaluation period
    pub tick_millis: u64,
    /// Reminder check period
    pub reminder_check_secs: u64,
    /// Minutes before start at which the reminder fires
    pub reminder_lead_minutes: i64,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: String,
    /// Directory-qualified file for JSON logs
    pub file_path: Option<String>,
    /// "text" or "json"
    pub format: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 30,
            inbox_message_window: 1000,
            echo_match_window_secs: 120,
            feed_buffer: 256,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_millis: 1000,
            reminder_check_secs: 60,
            reminder_lead_minutes: 15,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            format: "text".to_string(),
        }
    }
}

const ENV_PREFIX: &str = "SKILLSWAP";

impl AppConfig {
    /// Load configuration from multiple sources with precedence:
    /// defaults, `config/default`, `config/local`, then `SKILLSWAP_*` env vars.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Load defaults overlaid with a single explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from(path))
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.sync.reconcile_interval_secs == 0 {
            return Err(invalid("sync.reconcile_interval_secs must be greater than 0"));
        }
        if self.sync.inbox_message_window == 0 {
            return Err(invalid("sync.inbox_message_window must be greater than 0"));
        }
        if self.sync.feed_buffer == 0 {
            return Err(invalid("sync.feed_buffer must be greater than 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be greater than 0"));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(invalid(
                "retry.max_backoff_ms must not be below retry.initial_backoff_ms",
            ));
        }

        if self.session.tick_millis == 0 || self.session.reminder_check_secs == 0 {
            return Err(invalid("session tick periods must be greater than 0"));
        }
        if self.session.reminder_lead_minutes < 0 {
            return Err(invalid("session.reminder_lead_minutes must not be negative"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(invalid(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(invalid(format!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format, valid_formats
            )));
        }

        Ok(())
    }

    /// Get log level from environment or config
    #[must_use]
    pub fn get_log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.logging.level.clone())
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| SyncError::Config(e.to_string()))
    }
}

fn invalid(message: impl Into<String>) -> SyncError {
    SyncError::Config(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.sync.reconcile_interval_secs, 30);
        assert_eq!(config.sync.inbox_message_window, 1000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.session.reminder_lead_minutes, 15);
    }

    #[test]
    fn test_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = AppConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
