//! Multi-backend database connection pool manager.
//!
//! Named pools of reusable connections to PostgreSQL, MySQL, SQLite or any
//! backend with a registered [`Driver`](db::Driver), with bounded capacity,
//! saturation policies, health tracking and per-pool metrics.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, PoolConfig, PoolOptions};
pub use db::{Pool, PoolManager};
pub use error::{DriverError, PoolError, PoolResult};
