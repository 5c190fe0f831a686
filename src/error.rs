//! TierSync Error Types

use thiserror::Error;

/// Result type alias for TierSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// TierSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Table {table} misconfigured: {reason}")]
    TableConfig { table: String, reason: String },

    // Store errors
    #[error("Connection failed to {store} store: {reason}")]
    ConnectionFailed { store: String, reason: String },

    #[error("Timed out after {secs}s talking to {store} store")]
    ConnectionTimeout { store: String, secs: u64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Query failed on {store} store: {reason}")]
    Query { store: String, reason: String },

    #[error("Write to cold store failed for {table}: {reason}")]
    Write { table: String, reason: String },

    #[error("Write verification failed: expected {expected} rows, store confirmed {written}")]
    WriteVerification { expected: u64, written: u64 },

    #[error("Row decode error: {0}")]
    Decode(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    #[error("State serialization error: {0}")]
    StateSerialization(#[from] serde_json::Error),

    #[error("Another run holds the lock at {0}")]
    Locked(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error means a store could not be reached at all
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout { .. } => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
            ),
            Error::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

    /// Check if this error is a configuration problem
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigParse(_) | Error::TableConfig { .. }
        )
    }

    /// Check if the next external trigger is expected to recover from this error
    pub fn is_retryable(&self) -> bool {
        self.is_connectivity()
            || matches!(
                self,
                Error::Query { .. } | Error::Write { .. } | Error::WriteVerification { .. }
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let e = Error::ConnectionFailed {
            store: "hot".into(),
            reason: "refused".into(),
        };
        assert!(e.is_connectivity());
        assert!(e.is_retryable());

        let e = Error::ConnectionTimeout {
            store: "cold".into(),
            secs: 30,
        };
        assert!(e.is_connectivity());

        let e = Error::TableConfig {
            table: "trades".into(),
            reason: "window_ms must be positive".into(),
        };
        assert!(e.is_config());
        assert!(!e.is_connectivity());
        assert!(!e.is_retryable());

        let e = Error::Database(sqlx::Error::PoolTimedOut);
        assert!(e.is_connectivity());

        let e = Error::WriteVerification {
            expected: 10,
            written: 3,
        };
        assert!(!e.is_connectivity());
        assert!(e.is_retryable());
    }
}
