//! Backend driver abstraction.
//!
//! A [`Driver`] knows how to open a [`Session`] for one backend kind. Pools
//! never talk to a backend directly; they hold sessions through
//! [`Connection`](crate::db::Connection) wrappers and the driver is resolved
//! once, at pool creation, from a [`DriverRegistry`].

use crate::config::PoolConfig;
use crate::db::sqlx_driver::SqlxDriver;
use crate::error::{DriverError, PoolError, PoolResult};
use crate::models::{BackendKind, QueryParam, QueryResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Opens sessions for a backend.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Open a new session. Errors here surface as `ConnectFailed`.
    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn Session>, DriverError>;
}

/// A single open session with a backend.
///
/// Sessions are used by one caller at a time; the pool enforces that.
#[async_trait]
pub trait Session: Send {
    /// Cheap liveness probe. Must not panic or error, only report.
    async fn validate(&mut self) -> bool;

    /// Run a statement that returns rows.
    async fn query(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<QueryResult, DriverError>;

    /// Run a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> Result<u64, DriverError>;

    /// Close the session. Best effort.
    async fn close(self: Box<Self>);
}

/// Maps backend kinds to the drivers that serve them.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<BackendKind, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in sqlx drivers for PostgreSQL, MySQL and SQLite.
    pub fn with_defaults() -> Self {
        let sqlx: Arc<dyn Driver> = Arc::new(SqlxDriver);
        let mut registry = Self::new();
        for kind in [BackendKind::PostgreSql, BackendKind::MySql, BackendKind::Sqlite] {
            registry.register(kind, Arc::clone(&sqlx));
        }
        registry
    }

    /// Register (or replace) the driver for a backend kind.
    pub fn register(&mut self, kind: BackendKind, driver: Arc<dyn Driver>) -> &mut Self {
        self.drivers.insert(kind, driver);
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with_driver(mut self, kind: BackendKind, driver: Arc<dyn Driver>) -> Self {
        self.register(kind, driver);
        self
    }

    /// Resolve the driver for a backend kind.
    pub fn get(&self, kind: BackendKind) -> PoolResult<Arc<dyn Driver>> {
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| PoolError::unsupported_backend(kind.as_str()))
    }

    /// Backend kinds with a registered driver, in canonical order.
    pub fn backends(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| self.drivers.contains_key(kind))
            .collect()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}
