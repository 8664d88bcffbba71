//! Pool statistics.
//!
//! Counters live on the pool as atomics; this module owns the bounded latency
//! window and the derivation of [`PoolMetrics`] from a counter snapshot.

use crate::models::PoolMetrics;
use std::collections::VecDeque;
use std::time::Duration;

/// Number of recent latency samples kept per pool.
pub const LATENCY_WINDOW_SIZE: usize = 1000;

/// Fixed-capacity ring buffer of recent latencies in milliseconds.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::with_capacity(LATENCY_WINDOW_SIZE)
    }
}

impl LatencyWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a sample, evicting the oldest when full.
    pub fn record(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency.as_nanos() as f64 / 1_000_000.0);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean of the window, 0.0 when empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Value at index `floor(len * q)` of the sorted window (clamped), 0.0 when empty.
    pub fn percentile(&self, q: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let idx = ((sorted.len() as f64 * q.clamp(0.0, 1.0)).floor() as usize).min(sorted.len() - 1);
        sorted[idx]
    }
}

/// Raw counters read from a pool at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterSnapshot {
    pub total_queries: u64,
    pub total_errors: u64,
    pub active_connections: u32,
    pub max_connections: u32,
    pub uptime: Duration,
}

/// Derive throughput, latency and error statistics.
pub fn aggregate(pool_id: &str, counters: CounterSnapshot, window: &LatencyWindow) -> PoolMetrics {
    let uptime_seconds = counters.uptime.as_secs_f64();
    let qps = if uptime_seconds > 0.0 {
        counters.total_queries as f64 / uptime_seconds
    } else {
        0.0
    };
    let connection_utilization = if counters.max_connections > 0 {
        counters.active_connections as f64 / counters.max_connections as f64
    } else {
        0.0
    };

    PoolMetrics {
        pool_id: pool_id.to_string(),
        total_queries: counters.total_queries,
        total_errors: counters.total_errors,
        qps,
        avg_latency_ms: window.average(),
        p99_latency_ms: window.percentile(0.99),
        error_rate: counters.total_errors as f64 / counters.total_queries.max(1) as f64,
        connection_utilization,
        uptime_seconds,
    }
}
