//! Error types for the skillswap-sync library.
//!
//! Every failure is classified into one of the user-facing classes the screens
//! surface: authentication, read, write and subscription failures, plus local
//! failures (validation, configuration, malformed rows) that never touched the
//! remote store.

use thiserror::Error;

/// Errors that can occur while synchronizing with the remote store.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The session is missing or was rejected
    #[error("Authentication error: {0}")]
    Auth(String),

    /// A read query or read-only procedure failed
    #[error("Query failed ({operation}): {message}")]
    Query {
        /// Operation that issued the read
        operation: &'static str,
        /// Message returned by the store
        message: String,
    },

    /// An insert, update, delete or mutating procedure failed
    #[error("Write failed ({operation}): {message}")]
    Write {
        /// Operation that issued the write
        operation: &'static str,
        /// Message returned by the store
        message: String,
    },

    /// The change feed could not be opened or was lost
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// A row received from the store did not match its table's shape
    #[error("Malformed {table} row: {reason}")]
    MalformedRow {
        /// Table the row came from
        table: &'static str,
        /// Why the row was rejected
        reason: String,
    },

    /// User input rejected before reaching the store
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store rejected the write because of a uniqueness rule
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Result with `SyncError`
pub type Result<T> = std::result::Result<T, SyncError>;

/// Surface class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Session errors; never retried
    Auth,
    /// Read errors; the screen keeps its loading or stale state
    Read,
    /// Write errors; the attempted mutation is rolled back locally
    Write,
    /// Feed errors; logged and answered with a reload
    Subscription,
    /// Failures detected on the client before or after any remote call
    Local,
}

impl SyncError {
    /// Build a read error for `operation`.
    pub fn query(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Query {
            operation,
            message: message.into(),
        }
    }

    /// Build a write error for `operation`.
    pub fn write(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Write {
            operation,
            message: message.into(),
        }
    }

    /// Build a malformed-row error for `table`.
    pub fn malformed(table: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedRow {
            table,
            reason: reason.into(),
        }
    }

    /// Classify the error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Auth(_) => ErrorClass::Auth,
            Self::Query { .. } => ErrorClass::Read,
            Self::Write { .. } | Self::Conflict(_) => ErrorClass::Write,
            Self::Subscription(_) => ErrorClass::Subscription,
            Self::MalformedRow { .. }
            | Self::Validation(_)
            | Self::NotFound(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::Io(_) => ErrorClass::Local,
        }
    }

    /// Only idempotent reads may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Read)
    }

    /// Blocking alert for this error, titled after the failed action.
    #[must_use]
    pub fn alert(&self, title: &str) -> UserAlert {
        UserAlert {
            title: title.to_string(),
            message: match self {
                Self::Query { message, .. } | Self::Write { message, .. } => message.clone(),
                other => other.to_string(),
            },
        }
    }
}

/// A blocking alert shown to the user when an action fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAlert {
    /// Short title naming the failed action, e.g. "Send error"
    pub title: String,
    /// Detail text
    pub message: String,
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
