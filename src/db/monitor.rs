//! Health tracking and threshold alerts.
//!
//! [`HealthTracker`] remembers the outcome of the latest health check per pool.
//! [`AlertManager`] compares pool metrics against fixed rules and keeps one
//! alert per rule and pool while the condition holds.

use crate::models::PoolMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// Resolved alerts kept for inspection.
const RESOLVED_HISTORY: usize = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Latest health check outcome for one pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolHealth {
    pub pool_id: String,
    pub is_healthy: bool,
    pub last_check: DateTime<Utc>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct HealthTracker {
    entries: Mutex<HashMap<String, PoolHealth>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, pool_id: &str) {
        let mut entries = lock(&self.entries);
        let entry = entries
            .entry(pool_id.to_string())
            .or_insert_with(|| PoolHealth {
                pool_id: pool_id.to_string(),
                is_healthy: true,
                last_check: Utc::now(),
                consecutive_failures: 0,
                last_error: None,
            });
        entry.is_healthy = true;
        entry.last_check = Utc::now();
        entry.consecutive_failures = 0;
    }

    pub fn record_failure(&self, pool_id: &str, error: impl Into<String>) {
        let mut entries = lock(&self.entries);
        let entry = entries
            .entry(pool_id.to_string())
            .or_insert_with(|| PoolHealth {
                pool_id: pool_id.to_string(),
                is_healthy: false,
                last_check: Utc::now(),
                consecutive_failures: 0,
                last_error: None,
            });
        entry.is_healthy = false;
        entry.last_check = Utc::now();
        entry.consecutive_failures += 1;
        entry.last_error = Some(error.into());
    }

    pub fn get(&self, pool_id: &str) -> Option<PoolHealth> {
        lock(&self.entries).get(pool_id).cloned()
    }

    pub fn remove(&self, pool_id: &str) {
        lock(&self.entries).remove(pool_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Metric a rule watches; each fires when the value exceeds the rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertCondition {
    ErrorRate,
    P99LatencyMs,
    ConnectionUtilization,
}

impl AlertCondition {
    fn value(self, metrics: &PoolMetrics) -> f64 {
        match self {
            Self::ErrorRate => metrics.error_rate,
            Self::P99LatencyMs => metrics.p99_latency_ms,
            Self::ConnectionUtilization => metrics.connection_utilization,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub id: String,
    pub condition: AlertCondition,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub description: String,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        condition: AlertCondition,
        threshold: f64,
        severity: AlertSeverity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            condition,
            threshold,
            severity,
            description: description.into(),
        }
    }

    /// Error rate above 5%, p99 latency above one second, utilization above 90%.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(
                "high_error_rate",
                AlertCondition::ErrorRate,
                0.05,
                AlertSeverity::Warning,
                "Error rate above 5%",
            ),
            Self::new(
                "high_latency",
                AlertCondition::P99LatencyMs,
                1000.0,
                AlertSeverity::Warning,
                "P99 latency above 1000ms",
            ),
            Self::new(
                "high_connection_utilization",
                AlertCondition::ConnectionUtilization,
                0.9,
                AlertSeverity::Critical,
                "Connection utilization above 90%",
            ),
        ]
    }

    pub fn is_triggered(&self, metrics: &PoolMetrics) -> bool {
        self.condition.value(metrics) > self.threshold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// `{rule_id}_{pool_id}`
    pub id: String,
    pub rule_id: String,
    pub pool_id: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub triggered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct AlertManager {
    rules: Vec<AlertRule>,
    active: Mutex<HashMap<String, Alert>>,
    resolved: Mutex<VecDeque<Alert>>,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::with_rules(AlertRule::defaults())
    }
}

impl AlertManager {
    pub fn with_rules(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            active: Mutex::new(HashMap::new()),
            resolved: Mutex::new(VecDeque::new()),
        }
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Check every rule against `metrics`.
    ///
    /// Returns alerts that started firing with this evaluation; alerts already
    /// active stay as they are, and alerts whose condition cleared are resolved.
    pub fn evaluate(&self, metrics: &PoolMetrics) -> Vec<Alert> {
        let mut active = lock(&self.active);
        let mut triggered = Vec::new();
        for rule in &self.rules {
            let id = format!("{}_{}", rule.id, metrics.pool_id);
            if rule.is_triggered(metrics) {
                if active.contains_key(&id) {
                    continue;
                }
                let alert = Alert {
                    id: id.clone(),
                    rule_id: rule.id.clone(),
                    pool_id: metrics.pool_id.clone(),
                    message: format!(
                        "{} (current: {:.3}, threshold: {})",
                        rule.description,
                        rule.condition.value(metrics),
                        rule.threshold
                    ),
                    severity: rule.severity,
                    triggered_at: Utc::now(),
                    resolved_at: None,
                };
                warn!(
                    pool_id = %alert.pool_id,
                    alert_id = %alert.id,
                    severity = ?alert.severity,
                    "{}",
                    alert.message
                );
                active.insert(id, alert.clone());
                triggered.push(alert);
            } else if let Some(mut alert) = active.remove(&id) {
                alert.resolved_at = Some(Utc::now());
                info!(pool_id = %alert.pool_id, alert_id = %alert.id, "Alert resolved");
                let mut resolved = lock(&self.resolved);
                if resolved.len() == RESOLVED_HISTORY {
                    resolved.pop_front();
                }
                resolved.push_back(alert);
            }
        }
        triggered
    }

    /// Unresolved alerts, oldest first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = lock(&self.active).values().cloned().collect();
        alerts.sort_by(|a, b| a.triggered_at.cmp(&b.triggered_at).then_with(|| a.id.cmp(&b.id)));
        alerts
    }

    /// Recently resolved alerts, oldest first.
    pub fn resolved_alerts(&self) -> Vec<Alert> {
        lock(&self.resolved).iter().cloned().collect()
    }

    /// Drop alerts belonging to a removed pool.
    pub fn clear_pool(&self, pool_id: &str) {
        lock(&self.active).retain(|_, alert| alert.pool_id != pool_id);
    }
}
