//! Database layer.
//!
//! - `driver` / `sqlx_driver`: the backend capability and its sqlx implementation
//! - `params`, `types`, `macros`: parameter binding, row decoding and per-backend dispatch
//! - `connection`: one physical connection and its lifecycle state
//! - `pool`: bounded pool engine with checkout guards
//! - `metrics`, `monitor`: latency window, derived statistics, health and alerts
//! - `batch`: isolated and transactional batch execution
//! - `manager`: registry of named pools

pub mod batch;
pub mod connection;
pub mod driver;
#[macro_use]
pub mod macros;
pub mod manager;
pub mod metrics;
pub mod monitor;
pub mod params;
pub mod pool;
pub mod sqlx_driver;
pub mod types;

pub use connection::{Connection, ConnectionState};
pub use driver::{Driver, DriverRegistry, Session};
pub use manager::PoolManager;
pub use metrics::{LATENCY_WINDOW_SIZE, LatencyWindow};
pub use monitor::{Alert, AlertManager, AlertRule, AlertSeverity, HealthTracker, PoolHealth};
pub use pool::{Pool, PooledConnection};
pub use sqlx_driver::SqlxDriver;
