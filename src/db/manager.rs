//! Pool registry.
//!
//! [`PoolManager`] owns every named pool and is the entry point for running
//! statements: calls name a pool id, the manager resolves it and delegates.
//! With a [`FailoverStrategy`] other than `LocalOnly`, statements for an
//! unhealthy or missing pool are routed to a healthy alternate.

use crate::config::{FailoverStrategy, PoolConfig, validate_pool_id};
use crate::db::batch;
use crate::db::driver::DriverRegistry;
use crate::db::monitor::{Alert, AlertManager, HealthTracker, PoolHealth};
use crate::db::pool::Pool;
use crate::error::{PoolError, PoolResult};
use crate::models::{
    BatchOperation, BatchResult, ExecuteResult, PoolMetrics, PoolStatus, QueryParam, QueryResult,
};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PoolManager {
    pools: Arc<RwLock<HashMap<String, Pool>>>,
    drivers: DriverRegistry,
    health: Arc<HealthTracker>,
    alerts: Arc<AlertManager>,
    failover: Arc<RwLock<FailoverStrategy>>,
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolManager {
    /// Create a manager with the built-in sqlx drivers.
    pub fn new() -> Self {
        Self::with_drivers(DriverRegistry::with_defaults())
    }

    pub fn with_drivers(drivers: DriverRegistry) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            drivers,
            health: Arc::new(HealthTracker::new()),
            alerts: Arc::new(AlertManager::default()),
            failover: Arc::new(RwLock::new(FailoverStrategy::LocalOnly)),
        }
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// Create a pool and open its initial connections.
    ///
    /// A pool that cannot reach `min_connections` is still registered; the
    /// failure shows up in its status as `last_error` and `is_healthy == false`.
    pub async fn create_pool(
        &self,
        pool_id: impl Into<String>,
        config: PoolConfig,
    ) -> PoolResult<PoolStatus> {
        let pool_id = pool_id.into();
        validate_pool_id(&pool_id).map_err(PoolError::invalid_config)?;
        config.validate().map_err(PoolError::invalid_config)?;
        let driver = self.drivers.get(config.backend)?;

        // Early check for existing pool
        {
            let pools = self.pools.read().await;
            if pools.contains_key(&pool_id) {
                return Err(PoolError::duplicate_pool(&pool_id));
            }
        }

        info!(
            pool_id = %pool_id,
            backend = %config.backend,
            url = %config.masked_url(),
            min_connections = config.options.min_connections_or_default(),
            max_connections = config.options.max_connections_or_default(),
            "Creating pool"
        );

        let pool = Pool::new(pool_id.clone(), config, driver);
        if let Err(e) = pool.fill_to_min().await {
            warn!(pool_id = %pool_id, error = %e, "Pool created in degraded state");
        }

        // Re-check after async work to prevent TOCTOU race
        let duplicate = {
            let mut pools = self.pools.write().await;
            if pools.contains_key(&pool_id) {
                true
            } else {
                pools.insert(pool_id.clone(), pool.clone());
                false
            }
        };

        if duplicate {
            pool.close().await;
            return Err(PoolError::duplicate_pool(&pool_id));
        }

        let status = pool.status();
        info!(
            pool_id = %pool_id,
            connections = status.total_connections,
            healthy = status.is_healthy,
            "Pool ready"
        );
        Ok(status)
    }

    /// Unregister a pool and close it.
    pub async fn remove_pool(&self, pool_id: &str) -> PoolResult<()> {
        let pool = {
            let mut pools = self.pools.write().await;
            let pool = pools
                .remove(pool_id)
                .ok_or_else(|| PoolError::pool_not_found(pool_id))?;
            // Cleared under the write lock; health_check records under the read lock
            self.health.remove(pool_id);
            self.alerts.clear_pool(pool_id);
            pool
        };

        pool.close().await;
        info!(pool_id = %pool_id, "Pool removed");
        Ok(())
    }

    /// Replace a pool with a fresh one built from the same configuration.
    ///
    /// The new pool is filled before the swap, so callers keep using the old
    /// pool until the new one is registered. Returns the new pool's status.
    pub async fn recreate_pool(&self, pool_id: &str) -> PoolResult<PoolStatus> {
        let old = self.get_pool(pool_id).await?;
        let config = old.config().clone();
        let driver = self.drivers.get(config.backend)?;

        info!(pool_id = %pool_id, "Recreating pool");
        let pool = Pool::new(pool_id, config, driver);
        if let Err(e) = pool.fill_to_min().await {
            warn!(pool_id = %pool_id, error = %e, "Recreated pool is degraded");
        }

        let replaced = {
            let mut pools = self.pools.write().await;
            match pools.get_mut(pool_id) {
                Some(slot) => {
                    let previous = std::mem::replace(slot, pool.clone());
                    self.health.remove(pool_id);
                    Some(previous)
                }
                None => None,
            }
        };

        match replaced {
            Some(previous) => {
                previous.close().await;
                Ok(pool.status())
            }
            None => {
                // Removed while the new pool was filling
                pool.close().await;
                Err(PoolError::pool_not_found(pool_id))
            }
        }
    }

    /// Set how statements are routed away from unhealthy pools.
    pub async fn set_failover_strategy(&self, strategy: FailoverStrategy) -> PoolResult<()> {
        strategy.validate().map_err(PoolError::invalid_config)?;
        info!(strategy = ?strategy, "Failover strategy set");
        *self.failover.write().await = strategy;
        Ok(())
    }

    pub async fn failover_strategy(&self) -> FailoverStrategy {
        self.failover.read().await.clone()
    }

    /// Pick the pool that serves statements for `pool_id`.
    ///
    /// A healthy pool serves itself. Otherwise the failover alternates are tried
    /// in order, and the named pool is the last resort so a degraded pool can
    /// still recover on its next connect.
    async fn route(&self, pool_id: &str) -> PoolResult<Pool> {
        let pools = self.pools.read().await;
        let local = pools.get(pool_id);
        if let Some(pool) = local.filter(|pool| pool.is_healthy()) {
            return Ok(pool.clone());
        }

        let strategy = self.failover.read().await;
        for alternate in strategy.alternates(pool_id) {
            if let Some(pool) = pools.get(alternate).filter(|pool| pool.is_healthy()) {
                warn!(pool_id = %pool_id, routed_to = %alternate, "Routing around unavailable pool");
                return Ok(pool.clone());
            }
        }

        local
            .cloned()
            .ok_or_else(|| PoolError::pool_not_found(pool_id))
    }

    /// Look up a pool by id.
    pub async fn get_pool(&self, pool_id: &str) -> PoolResult<Pool> {
        self.pools
            .read()
            .await
            .get(pool_id)
            .cloned()
            .ok_or_else(|| PoolError::pool_not_found(pool_id))
    }

    pub async fn query(
        &self,
        pool_id: &str,
        sql: &str,
        params: &[QueryParam],
    ) -> PoolResult<QueryResult> {
        self.route(pool_id).await?.query(sql, params).await
    }

    pub async fn execute(
        &self,
        pool_id: &str,
        sql: &str,
        params: &[QueryParam],
    ) -> PoolResult<ExecuteResult> {
        self.route(pool_id).await?.execute(sql, params).await
    }

    /// Run operations independently; one result per operation.
    pub async fn execute_batch(
        &self,
        pool_id: &str,
        operations: &[BatchOperation],
    ) -> PoolResult<Vec<BatchResult>> {
        let pool = self.route(pool_id).await?;
        Ok(batch::execute_batch(&pool, operations).await)
    }

    /// Run operations atomically on one connection.
    pub async fn execute_transaction(
        &self,
        pool_id: &str,
        operations: &[BatchOperation],
    ) -> PoolResult<Vec<BatchResult>> {
        let pool = self.route(pool_id).await?;
        batch::execute_transaction(&pool, operations).await
    }

    pub async fn get_pool_status(&self, pool_id: &str) -> PoolResult<PoolStatus> {
        Ok(self.get_pool(pool_id).await?.status())
    }

    pub async fn get_pool_metrics(&self, pool_id: &str) -> PoolResult<PoolMetrics> {
        Ok(self.get_pool(pool_id).await?.metrics())
    }

    /// Run the backend's probe statement. Never fails; unknown pools are unhealthy.
    pub async fn health_check(&self, pool_id: &str) -> bool {
        let Ok(pool) = self.get_pool(pool_id).await else {
            debug!(pool_id = %pool_id, "Health check for unknown pool");
            return false;
        };

        let outcome = pool.query(pool.backend().health_probe(), &[]).await;

        // Only record for a pool that is still registered, so a concurrent
        // remove_pool cannot be followed by a stale entry
        let pools = self.pools.read().await;
        let registered = pools.contains_key(pool_id);
        match outcome {
            Ok(_) => {
                if registered {
                    self.health.record_success(pool_id);
                }
                true
            }
            Err(e) => {
                warn!(pool_id = %pool_id, error = %e, "Health check failed");
                if registered {
                    self.health.record_failure(pool_id, e.to_string());
                }
                false
            }
        }
    }

    /// Latest health check outcome, if the pool has been checked.
    pub fn pool_health(&self, pool_id: &str) -> Option<PoolHealth> {
        self.health.get(pool_id)
    }

    /// Evaluate alert rules against a pool's current metrics.
    ///
    /// Returns the alerts that started firing with this evaluation.
    pub async fn evaluate_alerts(&self, pool_id: &str) -> PoolResult<Vec<Alert>> {
        let metrics = self.get_pool_metrics(pool_id).await?;
        Ok(self.alerts.evaluate(&metrics))
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.active_alerts()
    }

    /// Identifiers of all registered pools, sorted.
    pub async fn list_pools(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn exists(&self, pool_id: &str) -> bool {
        self.pools.read().await.contains_key(pool_id)
    }

    /// Close every pool and clear the registry.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Pool)> = {
            let mut pools = self.pools.write().await;
            let drained: Vec<(String, Pool)> = pools.drain().collect();
            for (pool_id, _) in &drained {
                self.health.remove(pool_id);
                self.alerts.clear_pool(pool_id);
            }
            drained
        };
        join_all(drained.iter().map(|(pool_id, pool)| async move {
            info!(pool_id = %pool_id, "Closing pool");
            pool.close().await;
        }))
        .await;
        info!(count = drained.len(), "All pools closed");
    }
}
