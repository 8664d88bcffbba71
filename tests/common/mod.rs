//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use db_pool_manager::config::{PoolConfig, PoolOptions};
use db_pool_manager::db::{Driver, DriverRegistry, Pool, PoolManager, Session};
use db_pool_manager::error::DriverError;
use db_pool_manager::models::{BackendKind, QueryParam, QueryResult};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Knobs and counters shared by a [`FakeDriver`] and all its sessions.
#[derive(Debug, Default)]
pub struct FakeState {
    pub refuse_connections: AtomicBool,
    /// Milliseconds each connect takes
    pub connect_delay_ms: AtomicU64,
    pub fail_validation: AtomicBool,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    /// Sessions currently running a statement
    pub in_use: AtomicUsize,
    pub statements: Mutex<Vec<String>>,
}

impl FakeState {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

/// In-memory backend.
///
/// `FAIL...` is a statement error, `FATAL...` breaks the session,
/// `SLEEP <ms>` waits. Queries return the session number in column `session`.
#[derive(Debug, Clone, Default)]
pub struct FakeDriver {
    pub state: Arc<FakeState>,
}

struct FakeSession {
    number: usize,
    state: Arc<FakeState>,
    broken: bool,
}

#[async_trait]
impl Driver for FakeDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn connect(&self, _config: &PoolConfig) -> Result<Box<dyn Session>, DriverError> {
        let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(DriverError::fatal("connection refused"));
        }
        let number = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(FakeSession {
            number,
            state: Arc::clone(&self.state),
            broken: false,
        }))
    }
}

impl FakeSession {
    async fn run(&mut self, sql: &str) -> Result<(), DriverError> {
        self.state.statements.lock().unwrap().push(sql.to_string());
        self.state.in_use.fetch_add(1, Ordering::SeqCst);
        let outcome = if sql.starts_with("FATAL") {
            self.broken = true;
            Err(DriverError::fatal("server closed the connection"))
        } else if sql.starts_with("FAIL") {
            Err(DriverError::statement(format!("syntax error near '{}'", sql)))
        } else {
            if let Some(ms) = sql.strip_prefix("SLEEP ") {
                let ms = ms.trim().parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Ok(())
        };
        self.state.in_use.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn validate(&mut self) -> bool {
        !self.broken && !self.state.fail_validation.load(Ordering::SeqCst)
    }

    async fn query(&mut self, sql: &str, _params: &[QueryParam]) -> Result<QueryResult, DriverError> {
        self.run(sql).await?;
        Ok(QueryResult::new(
            vec!["session".to_string()],
            vec![vec![json!(self.number)]],
        ))
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> Result<u64, DriverError> {
        self.run(sql).await?;
        Ok(params.len().max(1) as u64)
    }

    async fn close(self: Box<Self>) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn options(min: u32, max: u32) -> PoolOptions {
    PoolOptions {
        min_connections: Some(min),
        max_connections: Some(max),
        ..Default::default()
    }
}

pub fn fake_config(options: PoolOptions) -> PoolConfig {
    fake_config_for(BackendKind::PostgreSql, options)
}

pub fn fake_config_for(backend: BackendKind, options: PoolOptions) -> PoolConfig {
    PoolConfig::new(backend)
        .with_database("fake")
        .with_options(options)
}

pub fn fake_pool(options: PoolOptions) -> (Pool, Arc<FakeState>) {
    let driver = FakeDriver::default();
    let state = Arc::clone(&driver.state);
    (Pool::new("fake", fake_config(options), Arc::new(driver)), state)
}

pub fn fake_manager() -> (PoolManager, Arc<FakeState>) {
    let driver = FakeDriver::default();
    let state = Arc::clone(&driver.state);
    let drivers = DriverRegistry::new().with_driver(BackendKind::PostgreSql, Arc::new(driver));
    (PoolManager::with_drivers(drivers), state)
}

/// A manager with independent fake backends: PostgreSQL pools use the first
/// state, MySQL pools the second.
pub fn fake_manager_pair() -> (PoolManager, Arc<FakeState>, Arc<FakeState>) {
    let primary = FakeDriver::default();
    let secondary = FakeDriver::default();
    let states = (Arc::clone(&primary.state), Arc::clone(&secondary.state));
    let drivers = DriverRegistry::new()
        .with_driver(BackendKind::PostgreSql, Arc::new(primary))
        .with_driver(BackendKind::MySql, Arc::new(secondary));
    (PoolManager::with_drivers(drivers), states.0, states.1)
}
