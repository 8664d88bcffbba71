//! Built-in driver for PostgreSQL, MySQL and SQLite on top of sqlx.
//!
//! Each session owns a single sqlx connection; pooling is done by
//! [`Pool`](crate::db::Pool), not by sqlx.

use crate::config::PoolConfig;
use crate::db::driver::{Driver, Session};
use crate::db::macros::impl_session_dispatch;
use crate::db::types::rows_to_result;
use crate::error::DriverError;
use crate::models::{BackendKind, QueryParam, QueryResult};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Executor};
use std::str::FromStr;
use tracing::debug;

/// Driver for the backends sqlx supports natively.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxDriver;

/// Backend-specific sqlx connection (avoids `AnyConnection` limitations).
pub(crate) enum SqlxSession {
    Sqlite(SqliteConnection),
    Postgres(PgConnection),
    MySql(MySqlConnection),
}

#[async_trait]
impl Driver for SqlxDriver {
    fn name(&self) -> &'static str {
        "sqlx"
    }

    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn Session>, DriverError> {
        let url = config.connection_url().map_err(DriverError::fatal)?;
        debug!(
            backend = %config.backend,
            url = %config.masked_url(),
            "Opening sqlx connection"
        );

        let session = match config.backend {
            BackendKind::Sqlite => {
                let options = SqliteConnectOptions::from_str(&url)?;
                SqlxSession::Sqlite(options.connect().await?)
            }
            BackendKind::PostgreSql => {
                let options = PgConnectOptions::from_str(&url)?;
                SqlxSession::Postgres(options.connect().await?)
            }
            BackendKind::MySql => {
                let options = MySqlConnectOptions::from_str(&url)?;
                SqlxSession::MySql(options.connect().await?)
            }
            other => {
                return Err(DriverError::fatal(format!(
                    "sqlx driver does not support {}",
                    other.display_name()
                )));
            }
        };
        Ok(Box::new(session))
    }
}

#[async_trait]
impl Session for SqlxSession {
    async fn validate(&mut self) -> bool {
        let result = match self {
            SqlxSession::Sqlite(conn) => conn.ping().await,
            SqlxSession::Postgres(conn) => conn.ping().await,
            SqlxSession::MySql(conn) => conn.ping().await,
        };
        result.is_ok()
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<QueryResult, DriverError> {
        // Unprepared when there is nothing to bind; some statements refuse preparation
        impl_session_dispatch!(self, conn, bind => {
            let rows = if params.is_empty() {
                conn.fetch_all(sql).await?
            } else {
                bind(sql, params).fetch_all(&mut *conn).await?
            };
            Ok(rows_to_result(&rows))
        })
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> Result<u64, DriverError> {
        impl_session_dispatch!(self, conn, bind => {
            let done = if params.is_empty() {
                conn.execute(sql).await?
            } else {
                bind(sql, params).execute(&mut *conn).await?
            };
            Ok(done.rows_affected())
        })
    }

    async fn close(self: Box<Self>) {
        let result = match *self {
            SqlxSession::Sqlite(conn) => conn.close().await,
            SqlxSession::Postgres(conn) => conn.close().await,
            SqlxSession::MySql(conn) => conn.close().await,
        };
        if let Err(e) = result {
            debug!(error = %e, "Error while closing sqlx connection");
        }
    }
}
