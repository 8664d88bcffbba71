//! Pool status and metrics records returned to callers.

use super::BackendKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of a pool's connections and health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub pool_id: String,
    pub backend: BackendKind,
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
    /// Callers currently waiting for a free connection
    pub waiting_requests: u32,
    pub min_connections: u32,
    pub max_connections: u32,
    pub is_healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub uptime_seconds: u64,
}

/// Throughput, latency and error statistics derived from a pool's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub pool_id: String,
    pub total_queries: u64,
    pub total_errors: u64,
    /// total_queries / uptime_seconds
    pub qps: f64,
    /// Mean over the recent latency window
    pub avg_latency_ms: f64,
    /// 99th percentile over the recent latency window
    pub p99_latency_ms: f64,
    /// total_errors / max(total_queries, 1)
    pub error_rate: f64,
    /// active_connections / max_connections
    pub connection_utilization: f64,
    pub uptime_seconds: f64,
}
