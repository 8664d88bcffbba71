//! Error types for the pool manager.
//!
//! `PoolError` is what callers of the registry and pools see. `DriverError` is the
//! narrower error a driver session reports; the connection layer maps it onto
//! `QueryFailed`/`CommandFailed` and uses its `fatal` flag to retire the session.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Connection failed: {message}")]
    ConnectFailed { message: String },

    #[error("Query failed: {message}")]
    QueryFailed { message: String },

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Pool '{pool_id}' exhausted: all {max_connections} connections are in use")]
    PoolExhausted {
        pool_id: String,
        max_connections: u32,
    },

    #[error("Timed out after {waited_ms}ms waiting for a connection from pool '{pool_id}'")]
    AcquireTimeout { pool_id: String, waited_ms: u64 },

    #[error("Pool not found: {pool_id}")]
    PoolNotFound { pool_id: String },

    #[error("Pool already exists: {pool_id}")]
    DuplicatePool { pool_id: String },

    #[error("Pool '{pool_id}' is closed")]
    PoolClosed { pool_id: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("No driver registered for backend '{backend}'")]
    UnsupportedBackend { backend: String },
}

impl PoolError {
    /// Create a connect failure.
    pub fn connect_failed(message: impl Into<String>) -> Self {
        Self::ConnectFailed {
            message: message.into(),
        }
    }

    /// Create a query failure.
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::QueryFailed {
            message: message.into(),
        }
    }

    /// Create a command failure.
    pub fn command_failed(message: impl Into<String>) -> Self {
        Self::CommandFailed {
            message: message.into(),
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(pool_id: impl Into<String>, max_connections: u32) -> Self {
        Self::PoolExhausted {
            pool_id: pool_id.into(),
            max_connections,
        }
    }

    /// Create an acquire timeout error.
    pub fn acquire_timeout(pool_id: impl Into<String>, waited_ms: u64) -> Self {
        Self::AcquireTimeout {
            pool_id: pool_id.into(),
            waited_ms,
        }
    }

    /// Create a pool not found error.
    pub fn pool_not_found(pool_id: impl Into<String>) -> Self {
        Self::PoolNotFound {
            pool_id: pool_id.into(),
        }
    }

    /// Create a duplicate pool error.
    pub fn duplicate_pool(pool_id: impl Into<String>) -> Self {
        Self::DuplicatePool {
            pool_id: pool_id.into(),
        }
    }

    /// Create a pool closed error.
    pub fn pool_closed(pool_id: impl Into<String>) -> Self {
        Self::PoolClosed {
            pool_id: pool_id.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an unsupported backend error.
    pub fn unsupported_backend(backend: impl Into<String>) -> Self {
        Self::UnsupportedBackend {
            backend: backend.into(),
        }
    }

    /// Short stable name of the error kind, used in logs and batch results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectFailed { .. } => "ConnectFailed",
            Self::QueryFailed { .. } => "QueryFailed",
            Self::CommandFailed { .. } => "CommandFailed",
            Self::PoolExhausted { .. } => "PoolExhausted",
            Self::AcquireTimeout { .. } => "AcquireTimeout",
            Self::PoolNotFound { .. } => "PoolNotFound",
            Self::DuplicatePool { .. } => "DuplicatePool",
            Self::PoolClosed { .. } => "PoolClosed",
            Self::ValidationError { .. } => "ValidationError",
            Self::InvalidConfig { .. } => "InvalidConfig",
            Self::UnsupportedBackend { .. } => "UnsupportedBackend",
        }
    }

    /// Check if retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. } | Self::PoolExhausted { .. } | Self::AcquireTimeout { .. }
        )
    }

    /// True for failures that mean the pool itself is not serving connections.
    pub(crate) fn is_pool_level(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. } | Self::PoolClosed { .. })
    }
}

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Error reported by a driver session.
///
/// `fatal` marks errors after which the session cannot be trusted (broken socket,
/// protocol desync, timeout mid-statement). Such sessions are never returned to
/// the idle set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
    pub fatal: bool,
}

impl DriverError {
    /// A statement-level error; the session stays usable.
    pub fn statement(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    /// A session-level error; the session must be discarded.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

/// Convert sqlx errors to DriverError, classifying which ones break the session.
impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => DriverError::statement(format!("{} (code: {})", db_err.message(), code)),
                None => DriverError::statement(db_err.message()),
            },
            sqlx::Error::Configuration(msg) => {
                DriverError::fatal(format!("Configuration error: {}", msg))
            }
            sqlx::Error::Io(io_err) => DriverError::fatal(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DriverError::fatal(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => DriverError::fatal(format!("Protocol error: {}", msg)),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                DriverError::fatal("Driver connection is no longer available")
            }
            sqlx::Error::WorkerCrashed => DriverError::fatal("Database worker crashed"),
            sqlx::Error::RowNotFound => DriverError::statement("No rows returned"),
            sqlx::Error::ColumnNotFound(col) => {
                DriverError::statement(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DriverError::statement(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DriverError::statement(format!("Decode error: {}", source)),
            other => DriverError::statement(format!("Database error: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PoolError::pool_not_found("analytics");
        assert_eq!(err.to_string(), "Pool not found: analytics");

        let err = PoolError::pool_exhausted("main", 5);
        assert!(err.to_string().contains("all 5 connections"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(PoolError::duplicate_pool("a").kind(), "DuplicatePool");
        assert_eq!(PoolError::validation("bad").kind(), "ValidationError");
        assert_eq!(PoolError::acquire_timeout("a", 10).kind(), "AcquireTimeout");
    }

    #[test]
    fn test_error_retryable() {
        assert!(PoolError::connect_failed("refused").is_retryable());
        assert!(PoolError::pool_exhausted("p", 1).is_retryable());
        assert!(PoolError::acquire_timeout("p", 100).is_retryable());
        assert!(!PoolError::query_failed("syntax").is_retryable());
        assert!(!PoolError::pool_not_found("p").is_retryable());
    }

    #[test]
    fn test_pool_level_errors() {
        assert!(PoolError::connect_failed("refused").is_pool_level());
        assert!(PoolError::pool_closed("p").is_pool_level());
        assert!(!PoolError::command_failed("constraint").is_pool_level());
    }

    #[test]
    fn test_sqlx_io_error_is_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: DriverError = sqlx::Error::Io(io).into();
        assert!(err.fatal);
        assert!(err.message.contains("reset"));
    }

    #[test]
    fn test_sqlx_row_not_found_is_not_fatal() {
        let err: DriverError = sqlx::Error::RowNotFound.into();
        assert!(!err.fatal);
    }
}
