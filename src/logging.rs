use std::path::Path;
use std::time::Instant;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::LoggingConfig;
use crate::error::{Result, SyncError};

const DEFAULT_LOG_FILE: &str = "skillswap-sync.log";

/// Initialize structured logging from the logging section of the configuration
pub fn init_from_config(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    init_logging(
        Some(&config.level),
        config.file_path.as_deref().map(Path::new),
        config.format == "json",
    )
}

/// Initialize structured logging.
///
/// `RUST_LOG` wins over `log_level`. Console output goes to stderr; when
/// `log_file` is given, JSON lines are also written to a daily rolling file
/// next to it. Keep the returned guard alive until shutdown so buffered file
/// output is flushed.
pub fn init_logging(
    log_level: Option<&str>,
    log_file: Option<&Path>,
    json_console: bool,
) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.unwrap_or("info")))
        .map_err(|e| SyncError::Config(format!("Failed to create log filter: {e}")))?;

    let text_console = (!json_console).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
    });
    let json_layer = json_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .json()
    });

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(DEFAULT_LOG_FILE);
            let (writer, guard) = non_blocking(rolling::daily(directory, file_name));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(env_filter)
        .with(text_console)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| SyncError::Config(format!("Failed to install subscriber: {e}")))?;

    info!(file = ?log_file, "Logging system initialized");
    Ok(guard)
}

/// Logs how long an operation took
#[derive(Debug)]
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
    reported: bool,
}

impl OperationTimer {
    /// Start timing `operation`
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
            reported: false,
        }
    }

    /// Report at info level and return the elapsed milliseconds
    pub fn finish(mut self) -> u128 {
        let duration = self.start.elapsed().as_millis();
        info!(
            operation = self.operation,
            duration_ms = duration,
            "Operation completed"
        );
        self.reported = true;
        duration
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        if !self.reported && !std::thread::panicking() {
            tracing::debug!(
                operation = self.operation,
                duration_ms = self.start.elapsed().as_millis(),
                "Operation ended early"
            );
        }
    }
}
