//! Backend kinds a pool can target.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported database engines.
///
/// Only the sqlx-backed kinds (PostgreSQL, MySQL, SQLite) ship with a driver;
/// the others need one registered through [`DriverRegistry`](crate::db::DriverRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    MsSql,
    PostgreSql,
    /// Includes MariaDB
    MySql,
    Sqlite,
    Redis,
    InfluxDb,
}

impl BackendKind {
    pub const ALL: [BackendKind; 6] = [
        Self::MsSql,
        Self::PostgreSql,
        Self::MySql,
        Self::Sqlite,
        Self::Redis,
        Self::InfluxDb,
    ];

    /// Parse a backend kind from a URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "mssql" | "sqlserver" => Some(Self::MsSql),
            "postgres" | "postgresql" => Some(Self::PostgreSql),
            "mysql" | "mariadb" => Some(Self::MySql),
            "sqlite" => Some(Self::Sqlite),
            "redis" | "rediss" => Some(Self::Redis),
            "influxdb" | "influx" => Some(Self::InfluxDb),
            _ => None,
        }
    }

    /// Parse a backend kind from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let scheme = connection_string.split(':').next()?;
        Self::from_scheme(scheme)
    }

    /// Canonical lowercase name, as used in config maps and serialized output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MsSql => "mssql",
            Self::PostgreSql => "postgresql",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
            Self::Redis => "redis",
            Self::InfluxDb => "influxdb",
        }
    }

    /// Get the display name for this backend.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MsSql => "SQL Server",
            Self::PostgreSql => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Sqlite => "SQLite",
            Self::Redis => "Redis",
            Self::InfluxDb => "InfluxDB",
        }
    }

    /// Get the default port for this backend. SQLite is file based.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::MsSql => Some(1433),
            Self::PostgreSql => Some(5432),
            Self::MySql => Some(3306),
            Self::Sqlite => None,
            Self::Redis => Some(6379),
            Self::InfluxDb => Some(8086),
        }
    }

    /// Whether the backend is addressed by file path rather than host.
    pub fn is_file_based(&self) -> bool {
        matches!(self, Self::Sqlite)
    }

    /// Whether a pool for this backend must name a database.
    pub fn requires_database(&self) -> bool {
        !matches!(self, Self::Redis)
    }

    /// Cheap read-only statement used by health checks.
    pub fn health_probe(&self) -> &'static str {
        match self {
            Self::Redis => "PING",
            Self::InfluxDb => "SHOW DATABASES",
            _ => "SELECT 1",
        }
    }

    /// Statements that open, commit and roll back a transaction, if the backend has them.
    pub fn transaction_statements(&self) -> Option<TransactionStatements> {
        match self {
            Self::MsSql => Some(TransactionStatements {
                begin: "BEGIN TRANSACTION",
                commit: "COMMIT TRANSACTION",
                rollback: "ROLLBACK TRANSACTION",
            }),
            Self::PostgreSql | Self::MySql | Self::Sqlite => Some(TransactionStatements {
                begin: "BEGIN",
                commit: "COMMIT",
                rollback: "ROLLBACK",
            }),
            Self::Redis => Some(TransactionStatements {
                begin: "MULTI",
                commit: "EXEC",
                rollback: "DISCARD",
            }),
            Self::InfluxDb => None,
        }
    }
}

/// Backend-specific transaction control statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStatements {
    pub begin: &'static str,
    pub commit: &'static str,
    pub rollback: &'static str,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_scheme(s.trim()).ok_or_else(|| {
            format!(
                "Unknown backend '{}'. Expected one of: mssql, postgresql, mysql, sqlite, redis, influxdb",
                s
            )
        })
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
