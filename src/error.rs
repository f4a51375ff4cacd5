//! Error types for TimeCamp Pulse.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Time source error: {0}")]
    Source(#[from] SourceError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Threshold error: {0}")]
    Threshold(#[from] ThresholdError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid cron expression for {key}: {message}")]
    InvalidSchedule { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Failures that mean the store itself is unusable, not just one query.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, DatabaseError::Pool(_))
    }

    /// Map a libsql error, classifying busy/locked results as conflicts.
    pub(crate) fn from_libsql(context: &str, err: libsql::Error) -> Self {
        match err {
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
            libsql::Error::SqliteFailure(code, ref msg) if matches!(code & 0xff, 5 | 6) => {
                DatabaseError::Conflict(format!("{context}: {msg}"))
            }
            libsql::Error::ConnectionFailed(ref msg) => {
                DatabaseError::Pool(format!("{context}: {msg}"))
            }
            other => DatabaseError::Query(format!("{context}: {other}")),
        }
    }
}

/// Errors from the time-tracking source API.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Request to {endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("All {attempts} attempts to {endpoint} failed: {last_error}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },
}

/// Errors from the chat platform.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("Failed to send message to {recipient}: {reason}")]
    SendFailed { recipient: String, reason: String },

    #[error("Platform rejected message to {recipient}: {error}")]
    Rejected { recipient: String, error: String },

    #[error("Rate limited sending to {recipient}, retry after {retry_after:?}")]
    RateLimited {
        recipient: String,
        retry_after: Option<Duration>,
    },
}

/// Errors surfaced by the threshold engine to its caller.
#[derive(Debug, thiserror::Error)]
pub enum ThresholdError {
    #[error("Store unavailable during threshold check: {0}")]
    StoreUnavailable(#[source] DatabaseError),

    #[error("Could not load recipients or projects: {0}")]
    RoutingUnavailable(#[source] DatabaseError),
}

/// Sync job errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Fetching {what} failed: {source}")]
    Fetch {
        what: &'static str,
        #[source]
        source: SourceError,
    },

    #[error("Storing {what} failed: {source}")]
    Store {
        what: &'static str,
        #[source]
        source: DatabaseError,
    },

    #[error("Threshold check after sync failed: {0}")]
    Threshold(#[from] ThresholdError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_conflict() {
        let err = DatabaseError::from_libsql(
            "claim",
            libsql::Error::SqliteFailure(5, "database is locked".into()),
        );
        assert!(matches!(err, DatabaseError::Conflict(_)));
        assert!(!err.is_connection_failure());
    }

    #[test]
    fn extended_busy_code_maps_to_conflict() {
        // SQLITE_BUSY_SNAPSHOT = 517
        let err = DatabaseError::from_libsql(
            "claim",
            libsql::Error::SqliteFailure(517, "snapshot".into()),
        );
        assert!(matches!(err, DatabaseError::Conflict(_)));
    }

    #[test]
    fn pool_is_connection_failure() {
        assert!(DatabaseError::Pool("gone".into()).is_connection_failure());
        assert!(!DatabaseError::Query("bad".into()).is_connection_failure());
        assert!(!DatabaseError::Timeout(Duration::from_secs(1)).is_connection_failure());
    }
}
