//! A single physical connection owned by a pool.
//!
//! [`Connection`] wraps one driver [`Session`] and tracks identity, timestamps
//! and the lifecycle state `Idle ⇄ Active → (Invalid | Closed)`. The pool
//! decides who may use a connection; this type only enforces that a closed or
//! broken session is never used again.

use crate::config::{PoolConfig, TimeoutConfig};
use crate::db::driver::{Driver, Session};
use crate::error::{DriverError, PoolError, PoolResult};
use crate::models::{BackendKind, QueryParam, QueryResult};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::debug;
use uuid::Uuid;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Active = 1,
    /// Broken or expired; will be closed instead of reused
    Invalid = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Active,
            2 => Self::Invalid,
            _ => Self::Closed,
        }
    }

    /// Whether the connection can still be handed out or returned to idle.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Idle | Self::Active)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Invalid => "invalid",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One driver session plus pool bookkeeping.
pub struct Connection {
    id: String,
    pool_id: String,
    backend: BackendKind,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    state: AtomicU8,
    timeouts: TimeoutConfig,
    // Only contended when a force-close races an in-flight statement
    session: tokio::sync::Mutex<Option<Box<dyn Session>>>,
}

impl Connection {
    /// Open a new session through `driver`, bounded by the connect timeout.
    pub async fn open(
        driver: &dyn Driver,
        pool_id: &str,
        config: &PoolConfig,
    ) -> PoolResult<Self> {
        let connect_timeout = config.timeouts.connect;
        let session = match timeout(connect_timeout, driver.connect(config)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(PoolError::connect_failed(e.message)),
            Err(_) => {
                return Err(PoolError::connect_failed(format!(
                    "Connect timed out after {}ms",
                    connect_timeout.as_millis()
                )));
            }
        };

        let now = Instant::now();
        let connection = Self {
            id: Uuid::new_v4().to_string(),
            pool_id: pool_id.to_string(),
            backend: config.backend,
            created_at: now,
            last_used_at: Mutex::new(now),
            state: AtomicU8::new(ConnectionState::Idle as u8),
            timeouts: config.timeouts,
            session: tokio::sync::Mutex::new(Some(session)),
        };
        debug!(
            pool_id = %pool_id,
            connection_id = %connection.id,
            driver = driver.name(),
            "Connection opened"
        );
        Ok(connection)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        *self
            .last_used_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Time since the connection was opened, measured at `now`.
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Time since the connection was last used, measured at `now`.
    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at())
    }

    fn touch(&self) {
        *self
            .last_used_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    /// Move between `Idle` and `Active`. Fails if the connection is no longer usable.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the connection unusable unless it is already closed.
    pub(crate) fn invalidate(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                ConnectionState::from_u8(current)
                    .is_usable()
                    .then_some(ConnectionState::Invalid as u8)
            });
    }

    /// Liveness probe. Never fails; a failed probe marks the connection invalid.
    pub async fn validate(&self) -> bool {
        if !self.state().is_usable() {
            return false;
        }
        let valid = match self.session.lock().await.as_mut() {
            Some(session) => session.validate().await,
            None => false,
        };
        if !valid {
            self.invalidate();
        }
        valid
    }

    /// Run a row-returning statement, bounded by the query timeout.
    pub async fn execute_query(&self, sql: &str, params: &[QueryParam]) -> PoolResult<QueryResult> {
        let mut guard = self.session.lock().await;
        let session = self.usable_session(&mut guard, PoolError::query_failed)?;
        let outcome = timeout(self.timeouts.query, session.query(sql, params)).await;
        drop(guard);
        self.touch();
        self.settle(outcome, self.timeouts.query, PoolError::query_failed)
    }

    /// Run a statement and return the affected row count, bounded by the command timeout.
    pub async fn execute_command(&self, sql: &str, params: &[QueryParam]) -> PoolResult<u64> {
        let mut guard = self.session.lock().await;
        let session = self.usable_session(&mut guard, PoolError::command_failed)?;
        let outcome = timeout(self.timeouts.command, session.execute(sql, params)).await;
        drop(guard);
        self.touch();
        self.settle(outcome, self.timeouts.command, PoolError::command_failed)
    }

    fn usable_session<'a>(
        &self,
        slot: &'a mut Option<Box<dyn Session>>,
        failed: fn(String) -> PoolError,
    ) -> PoolResult<&'a mut Box<dyn Session>> {
        match self.state() {
            ConnectionState::Closed => Err(PoolError::pool_closed(&self.pool_id)),
            ConnectionState::Invalid => Err(failed(format!(
                "Connection {} was invalidated by an earlier error",
                self.id
            ))),
            _ => slot
                .as_mut()
                .ok_or_else(|| PoolError::pool_closed(&self.pool_id)),
        }
    }

    fn settle<T>(
        &self,
        outcome: Result<Result<T, DriverError>, tokio::time::error::Elapsed>,
        limit: Duration,
        failed: fn(String) -> PoolError,
    ) -> PoolResult<T> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.fatal {
                    self.invalidate();
                }
                // A force-close during the call wins over the driver's complaint
                if self.state() == ConnectionState::Closed {
                    return Err(PoolError::pool_closed(&self.pool_id));
                }
                Err(failed(e.message))
            }
            Err(_) => {
                // Session state unknown after an abandoned statement
                self.invalidate();
                Err(failed(format!(
                    "Statement timed out after {}ms",
                    limit.as_millis()
                )))
            }
        }
    }

    /// Close the session. Idempotent: returns true only for the call that closed it.
    pub async fn close(&self) -> bool {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        let session = self.session.lock().await.take();
        match session {
            Some(session) => {
                session.close().await;
                debug!(
                    pool_id = %self.pool_id,
                    connection_id = %self.id,
                    "Connection closed"
                );
                true
            }
            None => false,
        }
    }

    /// Mark closed without waiting for an in-flight statement.
    ///
    /// The session is closed now if it is free, otherwise by whoever holds it
    /// when it is released.
    pub(crate) async fn force_close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        let session = match self.session.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(session) = session {
            session.close().await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("backend", &self.backend)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::driver::scripted::ScriptedDriver;
    use std::sync::atomic::Ordering;

    fn config() -> PoolConfig {
        PoolConfig::sqlite("unused.db")
    }

    async fn open(driver: &ScriptedDriver) -> Connection {
        Connection::open(driver, "test", &config()).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_starts_idle() {
        let driver = ScriptedDriver::default();
        let conn = open(&driver).await;
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.pool_id(), "test");
        assert_eq!(conn.id().len(), 36);
        assert!(conn.validate().await);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let driver = ScriptedDriver::default();
        driver.script.fail_connect.store(true, Ordering::SeqCst);
        let err = Connection::open(&driver, "test", &config()).await.unwrap_err();
        assert_eq!(err.kind(), "ConnectFailed");
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_statement_error_keeps_connection_usable() {
        let driver = ScriptedDriver::default();
        let conn = open(&driver).await;
        let err = conn.execute_query("FAIL here", &[]).await.unwrap_err();
        assert_eq!(err.kind(), "QueryFailed");
        assert!(conn.state().is_usable());
        assert!(conn.execute_query("SELECT 1", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_fatal_error_invalidates() {
        let driver = ScriptedDriver::default();
        let conn = open(&driver).await;
        let err = conn.execute_command("FATAL", &[]).await.unwrap_err();
        assert_eq!(err.kind(), "CommandFailed");
        assert_eq!(conn.state(), ConnectionState::Invalid);
        assert!(!conn.validate().await);
        assert!(conn.execute_command("UPDATE t SET x = 1", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_statement_timeout_invalidates() {
        let driver = ScriptedDriver::default();
        let mut cfg = config();
        cfg.timeouts.query = Duration::from_millis(20);
        let conn = Connection::open(&driver, "test", &cfg).await.unwrap();
        let err = conn.execute_query("SLEEP 500", &[]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(conn.state(), ConnectionState::Invalid);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let driver = ScriptedDriver::default();
        let conn = open(&driver).await;
        assert!(conn.close().await);
        assert!(!conn.close().await);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(driver.script.closes.load(Ordering::SeqCst), 1);

        let err = conn.execute_query("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), "PoolClosed");
    }

    #[tokio::test]
    async fn test_transition_requires_expected_state() {
        let driver = ScriptedDriver::default();
        let conn = open(&driver).await;
        assert!(conn.transition(ConnectionState::Idle, ConnectionState::Active));
        assert!(!conn.transition(ConnectionState::Idle, ConnectionState::Active));
        conn.invalidate();
        assert!(!conn.transition(ConnectionState::Active, ConnectionState::Idle));
        conn.force_close().await;
        conn.invalidate();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_last_used_advances_on_use() {
        let driver = ScriptedDriver::default();
        let conn = open(&driver).await;
        let before = conn.last_used_at();
        tokio::time::sleep(Duration::from_millis(5)).await;
        conn.execute_query("SELECT 1", &[]).await.unwrap();
        assert!(conn.last_used_at() > before);
        assert!(conn.age_at(Instant::now()) >= Duration::from_millis(5));
    }
}
