//! Data models for the pool manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod backend;
pub mod query;
pub mod status;

// Re-export commonly used types
pub use backend::{BackendKind, TransactionStatements};
pub use query::{BatchOperation, BatchResult, ExecuteResult, QueryParam, QueryResult};
pub use status::{PoolMetrics, PoolStatus};
