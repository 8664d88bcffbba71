//! Connection pool engine.
//!
//! A [`Pool`] lends [`Connection`]s for one logical database target. Callers
//! check out a [`PooledConnection`] with [`Pool::acquire`] and hand it back
//! with [`PooledConnection::release`]; [`Pool::query`] and [`Pool::execute`]
//! wrap that cycle and record metrics.
//!
//! # Design Decisions
//!
//! - **Fair `Semaphore` for capacity**: one permit per checkout and
//!   `max_connections` permits in total. Waiters are served in FIFO order and a
//!   cancelled wait gives nothing back because it never held anything.
//! - **`std::sync::Mutex` for bookkeeping**: the idle queue, active map and
//!   pending-connect count change together under one lock that is never held
//!   across an `.await`.
//! - **Packed `AtomicU64` for counts**: idle and active are published as one
//!   word whenever they change, so `status()` reads a consistent pair without
//!   locking.
//! - **`GrowthReservation` guard**: a connect in flight counts against
//!   capacity until it is registered or dropped.
//! - **Weak reaper handle**: the background task exits once the pool is gone.
//!
//! # Accounting
//!
//! At every instant `idle + active + pending <= max_connections`. Growth only
//! happens while holding a permit, whether for a checkout with the idle queue
//! empty or for `fill_to_min`. A checked-out connection keeps its permit
//! until it is back in the idle queue or closed.

use crate::config::{AcquirePolicy, PoolConfig, QueueStrategy};
use crate::db::connection::{Connection, ConnectionState};
use crate::db::driver::Driver;
use crate::db::metrics::{self, CounterSnapshot, LatencyWindow};
use crate::error::{PoolError, PoolResult};
use crate::models::{BackendKind, ExecuteResult, PoolMetrics, PoolStatus, QueryParam, QueryResult};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const IDLE_MASK: u64 = 0xFFFF_FFFF;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct PoolStats {
    total_queries: AtomicU64,
    total_errors: AtomicU64,
    /// `active << 32 | idle`
    counts: AtomicU64,
    waiting: AtomicU32,
}

#[derive(Default)]
struct PoolInternals {
    idle: VecDeque<Arc<Connection>>,
    active: HashMap<String, Arc<Connection>>,
    /// Connects in flight
    pending: u32,
}

impl PoolInternals {
    fn total(&self) -> u32 {
        (self.idle.len() + self.active.len()) as u32 + self.pending
    }
}

struct SharedPool {
    pool_id: String,
    config: PoolConfig,
    driver: Arc<dyn Driver>,
    semaphore: Arc<Semaphore>,
    internals: Mutex<PoolInternals>,
    stats: PoolStats,
    latencies: Mutex<LatencyWindow>,
    last_error: Mutex<Option<String>>,
    healthy: AtomicBool,
    closed: AtomicBool,
    started: Instant,
    created_at: DateTime<Utc>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

enum Claim {
    Idle(Arc<Connection>),
    Grow(GrowthReservation),
}

/// Holds one `pending` slot while a connection is being opened.
struct GrowthReservation {
    shared: Arc<SharedPool>,
    armed: bool,
}

impl Drop for GrowthReservation {
    fn drop(&mut self) {
        if self.armed {
            let mut internals = lock(&self.shared.internals);
            internals.pending = internals.pending.saturating_sub(1);
        }
    }
}

/// Counts a caller in `waiting_requests` for as long as it is alive.
struct WaitingGuard<'a>(&'a AtomicU32);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SharedPool {
    fn max_connections(&self) -> u32 {
        self.config.options.max_connections_or_default()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn publish(&self, internals: &PoolInternals) {
        let packed = ((internals.active.len() as u64) << 32) | internals.idle.len() as u64;
        self.stats.counts.store(packed, Ordering::Release);
    }

    fn reserve(self: &Arc<Self>, internals: &mut PoolInternals) -> GrowthReservation {
        internals.pending += 1;
        GrowthReservation {
            shared: Arc::clone(self),
            armed: true,
        }
    }

    fn record_error(&self, err: &PoolError) {
        *lock(&self.last_error) = Some(err.to_string());
        if err.is_pool_level() {
            self.healthy.store(false, Ordering::Release);
        }
    }

    /// Record one statement: a latency sample, and the error if it failed.
    fn record_statement(&self, elapsed: Duration, error: Option<&PoolError>) {
        self.stats.total_queries.fetch_add(1, Ordering::Relaxed);
        lock(&self.latencies).record(elapsed);
        match error {
            Some(err) => {
                self.stats.total_errors.fetch_add(1, Ordering::Relaxed);
                self.record_error(err);
            }
            None => self.healthy.store(true, Ordering::Release),
        }
    }

    fn is_expired(&self, conn: &Connection, now: Instant) -> bool {
        self.config
            .options
            .max_lifetime()
            .is_some_and(|lifetime| conn.age_at(now) >= lifetime)
    }

    /// Take a capacity slot according to the acquire policy.
    async fn acquire_permit(&self) -> PoolResult<OwnedSemaphorePermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(PoolError::pool_closed(&self.pool_id)),
            Err(TryAcquireError::NoPermits) => {}
        }

        let policy = self.config.options.acquire_policy();
        if policy == AcquirePolicy::FailFast {
            return Err(PoolError::pool_exhausted(
                &self.pool_id,
                self.max_connections(),
            ));
        }

        let _waiting = WaitingGuard::new(&self.stats.waiting);
        let wait_started = Instant::now();
        let acquired = match policy {
            AcquirePolicy::Timeout(limit) => {
                match tokio::time::timeout(limit, Arc::clone(&self.semaphore).acquire_owned()).await
                {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(PoolError::acquire_timeout(
                            &self.pool_id,
                            wait_started.elapsed().as_millis() as u64,
                        ));
                    }
                }
            }
            _ => Arc::clone(&self.semaphore).acquire_owned().await,
        };
        acquired.map_err(|_| PoolError::pool_closed(&self.pool_id))
    }

    /// Under the lock: move an idle connection to active, or reserve room to grow.
    fn claim(self: &Arc<Self>) -> PoolResult<Claim> {
        let mut internals = lock(&self.internals);
        if self.is_closed() {
            return Err(PoolError::pool_closed(&self.pool_id));
        }

        loop {
            let candidate = match self.config.options.queue_strategy_or_default() {
                QueueStrategy::Fifo => internals.idle.pop_front(),
                QueueStrategy::Lifo => internals.idle.pop_back(),
            };
            let Some(conn) = candidate else { break };
            if conn.transition(ConnectionState::Idle, ConnectionState::Active) {
                internals
                    .active
                    .insert(conn.id().to_string(), Arc::clone(&conn));
                self.publish(&internals);
                return Ok(Claim::Idle(conn));
            }
            debug!(
                pool_id = %self.pool_id,
                connection_id = %conn.id(),
                state = %conn.state(),
                "Dropping unusable idle connection"
            );
        }

        let max = self.max_connections();
        if internals.total() >= max {
            self.publish(&internals);
            warn!(
                pool_id = %self.pool_id,
                total = internals.total(),
                max_connections = max,
                "Capacity slot held but pool is full"
            );
            return Err(PoolError::pool_exhausted(&self.pool_id, max));
        }
        let reservation = self.reserve(&mut internals);
        self.publish(&internals);
        Ok(Claim::Grow(reservation))
    }

    /// Add a freshly opened connection. Hands it back if the pool closed meanwhile.
    fn register(
        &self,
        conn: Arc<Connection>,
        mut reservation: GrowthReservation,
        active: bool,
    ) -> Result<(), Arc<Connection>> {
        let mut internals = lock(&self.internals);
        reservation.armed = false;
        internals.pending = internals.pending.saturating_sub(1);
        if self.is_closed() {
            return Err(conn);
        }
        if active {
            internals.active.insert(conn.id().to_string(), conn);
        } else {
            internals.idle.push_back(conn);
        }
        self.publish(&internals);
        self.healthy.store(true, Ordering::Release);
        Ok(())
    }

    async fn open(&self) -> PoolResult<Arc<Connection>> {
        Connection::open(self.driver.as_ref(), &self.pool_id, &self.config)
            .await
            .map(Arc::new)
    }

    async fn acquire(self: &Arc<Self>) -> PoolResult<PooledConnection> {
        let mut permit = Some(self.acquire_permit().await?);
        loop {
            let slot = match permit.take() {
                Some(permit) => permit,
                None => self.acquire_permit().await?,
            };
            match self.claim()? {
                Claim::Idle(conn) => {
                    let mut pooled = PooledConnection::new(Arc::clone(self), conn, slot);
                    if !self.config.options.test_before_acquire_or_default()
                        || pooled.conn.validate().await
                    {
                        return Ok(pooled);
                    }
                    debug!(
                        pool_id = %self.pool_id,
                        connection_id = %pooled.id(),
                        "Idle connection failed validation, replacing"
                    );
                    permit = pooled.retire().await;
                }
                Claim::Grow(reservation) => {
                    let conn = self.open().await?;
                    conn.transition(ConnectionState::Idle, ConnectionState::Active);
                    if let Err(conn) = self.register(Arc::clone(&conn), reservation, true) {
                        conn.close().await;
                        return Err(PoolError::pool_closed(&self.pool_id));
                    }
                    debug!(
                        pool_id = %self.pool_id,
                        connection_id = %conn.id(),
                        "Pool grew by one connection"
                    );
                    return Ok(PooledConnection::new(Arc::clone(self), conn, slot));
                }
            }
        }
    }

    async fn close_connection(&self, conn: &Connection, reason: &str) {
        conn.invalidate();
        if conn.close().await {
            debug!(
                pool_id = %self.pool_id,
                connection_id = %conn.id(),
                reason,
                "Connection retired"
            );
        }
    }

    /// Return a checked-out connection: back to idle if still good, else closed.
    async fn check_in(&self, conn: &Arc<Connection>) {
        let reusable = conn.state() == ConnectionState::Active
            && !self.is_closed()
            && !self.is_expired(conn, Instant::now())
            && conn.validate().await;

        let returned = {
            let mut internals = lock(&self.internals);
            let tracked = internals.active.remove(conn.id()).is_some();
            let returned = tracked
                && reusable
                && !self.is_closed()
                && conn.transition(ConnectionState::Active, ConnectionState::Idle);
            if returned {
                internals.idle.push_back(Arc::clone(conn));
            }
            self.publish(&internals);
            returned
        };

        if !returned {
            self.close_connection(conn, "not reusable on release").await;
        }
    }

    /// Remove a checked-out connection from the pool and close it.
    async fn discard(&self, conn: &Arc<Connection>) {
        {
            let mut internals = lock(&self.internals);
            internals.active.remove(conn.id());
            self.publish(&internals);
        }
        self.close_connection(conn, "discarded").await;
    }

    /// Synchronous fallback when no runtime is available to run `check_in`.
    fn forget(&self, conn: &Connection) {
        let mut internals = lock(&self.internals);
        internals.active.remove(conn.id());
        self.publish(&internals);
        conn.invalidate();
    }

    async fn fill_to_min(self: &Arc<Self>) -> PoolResult<u32> {
        let target = self
            .config
            .options
            .min_connections_or_default()
            .min(self.max_connections());
        let mut opened = 0;
        loop {
            // A growing connect holds a permit like any checkout, so a waiter
            // that got a permit always finds room or an idle connection
            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => return Err(PoolError::pool_closed(&self.pool_id)),
                Err(TryAcquireError::NoPermits) => {
                    debug!(
                        pool_id = %self.pool_id,
                        opened,
                        "Every slot is checked out, deferring fill"
                    );
                    break;
                }
            };
            let reservation = {
                let mut internals = lock(&self.internals);
                if self.is_closed() {
                    return Err(PoolError::pool_closed(&self.pool_id));
                }
                if internals.total() >= target {
                    break;
                }
                self.reserve(&mut internals)
            };

            let conn = match self.open().await {
                Ok(conn) => conn,
                Err(e) => {
                    self.record_error(&e);
                    warn!(
                        pool_id = %self.pool_id,
                        opened,
                        min_connections = target,
                        error = %e,
                        "Pool is below min_connections"
                    );
                    return Err(e);
                }
            };
            if let Err(conn) = self.register(conn, reservation, false) {
                conn.close().await;
                return Err(PoolError::pool_closed(&self.pool_id));
            }
            drop(permit);
            opened += 1;
        }
        Ok(opened)
    }

    /// Close idle connections past `idle_timeout` (down to `min_connections`)
    /// or past `max_lifetime`.
    async fn reap(&self, now: Instant) -> usize {
        let options = &self.config.options;
        let idle_timeout = options.idle_timeout();
        let min = options.min_connections_or_default();

        let expired: Vec<Arc<Connection>> = {
            let mut internals = lock(&self.internals);
            let mut total = internals.total();
            let mut expired = Vec::new();
            let candidates = std::mem::take(&mut internals.idle);
            for conn in candidates {
                let too_old = self.is_expired(&conn, now);
                let too_idle =
                    idle_timeout.is_some_and(|limit| conn.idle_at(now) >= limit) && total > min;
                if too_old || too_idle {
                    total -= 1;
                    expired.push(conn);
                } else {
                    internals.idle.push_back(conn);
                }
            }
            self.publish(&internals);
            expired
        };

        for conn in &expired {
            self.close_connection(conn, "expired").await;
        }
        if !expired.is_empty() {
            debug!(
                pool_id = %self.pool_id,
                reaped = expired.len(),
                "Reaped idle connections"
            );
        }
        expired.len()
    }

    async fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.semaphore.close();
        if let Some(handle) = lock(&self.reaper).take() {
            handle.abort();
        }

        let (idle, active) = {
            let mut internals = lock(&self.internals);
            let idle: Vec<Arc<Connection>> = internals.idle.drain(..).collect();
            let active: Vec<Arc<Connection>> =
                internals.active.drain().map(|(_, conn)| conn).collect();
            self.publish(&internals);
            (idle, active)
        };

        for conn in &idle {
            conn.close().await;
        }
        for conn in &active {
            conn.force_close().await;
        }
        info!(
            pool_id = %self.pool_id,
            idle = idle.len(),
            active = active.len(),
            "Pool closed"
        );
        true
    }

    /// Background task: reap expired connections, then top back up to `min_connections`.
    ///
    /// Holds only a weak reference between ticks so it never keeps the pool alive.
    async fn reaper_task(weak: Weak<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(shared) = weak.upgrade() else {
                debug!("Pool dropped, reaper exiting");
                return;
            };
            if shared.is_closed() {
                return;
            }
            if shared.reap(Instant::now()).await > 0 {
                // Failures are recorded in last_error by fill_to_min
                let _ = shared.fill_to_min().await;
            }
        }
    }
}

/// A bounded pool of connections for one database target.
///
/// Cheap to clone; clones share the same connections and counters.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<SharedPool>,
}

impl Pool {
    /// Create an empty pool. Call [`fill_to_min`](Self::fill_to_min) to open
    /// the initial connections.
    ///
    /// When called inside a tokio runtime and idle/lifetime limits are enabled,
    /// a reaper task is started.
    pub fn new(pool_id: impl Into<String>, config: PoolConfig, driver: Arc<dyn Driver>) -> Self {
        let max = config.options.max_connections_or_default();
        let shared = Arc::new(SharedPool {
            pool_id: pool_id.into(),
            driver,
            semaphore: Arc::new(Semaphore::new(max as usize)),
            internals: Mutex::new(PoolInternals::default()),
            stats: PoolStats::default(),
            latencies: Mutex::new(LatencyWindow::default()),
            last_error: Mutex::new(None),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            started: Instant::now(),
            created_at: Utc::now(),
            reaper: Mutex::new(None),
            config,
        });

        let options = &shared.config.options;
        let reaps = options.idle_timeout().is_some() || options.max_lifetime().is_some();
        if reaps {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let task = SharedPool::reaper_task(
                    Arc::downgrade(&shared),
                    options.cleanup_interval_or_default(),
                );
                *lock(&shared.reaper) = Some(handle.spawn(task));
            }
        }

        Self { shared }
    }

    pub fn pool_id(&self) -> &str {
        &self.shared.pool_id
    }

    pub fn backend(&self) -> BackendKind {
        self.shared.config.backend
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Open and not degraded by a pool-level failure.
    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Acquire) && !self.shared.is_closed()
    }

    /// Open connections until the pool holds `min_connections`.
    ///
    /// Each connect holds a capacity slot, so the fill stops early when every
    /// slot is checked out. Stops at the first failure, which is recorded as
    /// `last_error` and returned; connections opened so far are kept.
    pub async fn fill_to_min(&self) -> PoolResult<u32> {
        self.shared.fill_to_min().await
    }

    /// Check out a connection.
    ///
    /// Failures (exhaustion, timeout, connect errors, shutdown) are recorded as
    /// `last_error` but are not counted as queries.
    pub async fn acquire(&self) -> PoolResult<PooledConnection> {
        let result = self.shared.acquire().await;
        if let Err(e) = &result {
            self.shared.record_error(e);
        }
        result
    }

    /// Run a row-returning statement on a pooled connection.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> PoolResult<QueryResult> {
        let conn = self.acquire().await?;
        let started = Instant::now();
        let result = conn.query(sql, params).await;
        let elapsed = started.elapsed();
        conn.release().await;

        self.shared.record_statement(elapsed, result.as_ref().err());
        let mut result = result?;
        result.execution_time_ms = elapsed.as_millis() as u64;
        Ok(result)
    }

    /// Run a statement on a pooled connection and return the affected row count.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> PoolResult<ExecuteResult> {
        let conn = self.acquire().await?;
        let started = Instant::now();
        let result = conn.execute(sql, params).await;
        let elapsed = started.elapsed();
        conn.release().await;

        self.shared.record_statement(elapsed, result.as_ref().err());
        Ok(ExecuteResult {
            affected_rows: result?,
            execution_time_ms: elapsed.as_millis() as u64,
        })
    }

    /// Record a statement run on a connection obtained through [`acquire`](Self::acquire).
    pub(crate) fn record_statement(&self, elapsed: Duration, error: Option<&PoolError>) {
        self.shared.record_statement(elapsed, error);
    }

    /// Lock-free snapshot of connection counts and health.
    pub fn status(&self) -> PoolStatus {
        let shared = &self.shared;
        let counts = shared.stats.counts.load(Ordering::Acquire);
        let idle = (counts & IDLE_MASK) as u32;
        let active = (counts >> 32) as u32;
        PoolStatus {
            pool_id: shared.pool_id.clone(),
            backend: shared.config.backend,
            total_connections: idle + active,
            active_connections: active,
            idle_connections: idle,
            waiting_requests: shared.stats.waiting.load(Ordering::Acquire),
            min_connections: shared.config.options.min_connections_or_default(),
            max_connections: shared.max_connections(),
            is_healthy: self.is_healthy(),
            last_error: lock(&shared.last_error).clone(),
            created_at: shared.created_at,
            uptime_seconds: shared.started.elapsed().as_secs(),
        }
    }

    /// Throughput, latency and error statistics.
    pub fn metrics(&self) -> PoolMetrics {
        let shared = &self.shared;
        let counters = CounterSnapshot {
            total_queries: shared.stats.total_queries.load(Ordering::Relaxed),
            total_errors: shared.stats.total_errors.load(Ordering::Relaxed),
            active_connections: (shared.stats.counts.load(Ordering::Acquire) >> 32) as u32,
            max_connections: shared.max_connections(),
            uptime: shared.started.elapsed(),
        };
        metrics::aggregate(&shared.pool_id, counters, &lock(&shared.latencies))
    }

    /// Close expired idle connections now. Returns how many were closed.
    pub async fn reap(&self) -> usize {
        self.shared.reap(Instant::now()).await
    }

    /// Shut the pool down. Idempotent.
    ///
    /// Waiters and later acquirers get `PoolClosed`; idle connections are
    /// closed and checked-out ones are force-closed, so their holders get
    /// `PoolClosed` on the next statement.
    pub async fn close(&self) {
        self.shared.shutdown().await;
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("pool_id", &self.shared.pool_id)
            .field("backend", &self.shared.config.backend)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

/// A checked-out connection.
///
/// Call [`release`](Self::release) when done. If the guard is dropped
/// instead (early return, panic, cancelled task) the release is scheduled on
/// the runtime.
pub struct PooledConnection {
    shared: Arc<SharedPool>,
    conn: Arc<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    released: bool,
}

impl PooledConnection {
    fn new(shared: Arc<SharedPool>, conn: Arc<Connection>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            shared,
            conn,
            permit: Some(permit),
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        self.conn.id()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> PoolResult<QueryResult> {
        self.conn.execute_query(sql, params).await
    }

    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> PoolResult<u64> {
        self.conn.execute_command(sql, params).await
    }

    /// Return the connection to the pool (or close it if it is no longer usable).
    pub async fn release(mut self) {
        self.released = true;
        self.shared.check_in(&self.conn).await;
        // Permit drops with self, after the connection is back
    }

    /// Close the connection instead of returning it.
    pub async fn discard(mut self) {
        self.released = true;
        self.shared.discard(&self.conn).await;
    }

    /// Discard the connection but keep the capacity slot for another attempt.
    async fn retire(&mut self) -> Option<OwnedSemaphorePermit> {
        self.released = true;
        self.shared.discard(&self.conn).await;
        self.permit.take()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let conn = Arc::clone(&self.conn);
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    shared.check_in(&conn).await;
                    drop(permit);
                    warn!(
                        pool_id = %shared.pool_id,
                        connection_id = %conn.id(),
                        "Connection released via Drop - consider using explicit release()"
                    );
                });
            }
            Err(_) => {
                shared.forget(&conn);
                drop(permit);
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool_id", &self.shared.pool_id)
            .field("connection", &self.conn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExhaustedAction, PoolOptions};
    use crate::db::driver::scripted::{Script, ScriptedDriver};
    use std::collections::HashSet;
    use tokio_test::{assert_pending, assert_ready_ok};

    fn limits(min: u32, max: u32) -> PoolOptions {
        PoolOptions {
            min_connections: Some(min),
            max_connections: Some(max),
            ..Default::default()
        }
    }

    fn pool_with(options: PoolOptions) -> (Pool, Arc<Script>) {
        let driver = ScriptedDriver::default();
        let script = Arc::clone(&driver.script);
        let config = PoolConfig::sqlite("scripted.db").with_options(options);
        (Pool::new("test", config, Arc::new(driver)), script)
    }

    async fn settle(pool: &Pool, idle: u32) {
        for _ in 0..100 {
            if pool.status().idle_connections == idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("pool never reached {idle} idle connections: {:?}", pool.status());
    }

    #[tokio::test]
    async fn test_fill_to_min() {
        let (pool, script) = pool_with(limits(2, 5));
        assert_eq!(pool.fill_to_min().await.unwrap(), 2);
        let status = pool.status();
        assert_eq!(status.total_connections, 2);
        assert_eq!(status.idle_connections, 2);
        assert_eq!(status.active_connections, 0);
        assert_eq!(script.connects.load(Ordering::SeqCst), 2);
        // Already at min
        assert_eq!(pool.fill_to_min().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fill_failure_degrades() {
        let (pool, script) = pool_with(limits(3, 5));
        script.fail_connect.store(true, Ordering::SeqCst);
        let err = pool.fill_to_min().await.unwrap_err();
        assert_eq!(err.kind(), "ConnectFailed");
        let status = pool.status();
        assert_eq!(status.total_connections, 0);
        assert!(!status.is_healthy);
        assert!(status.last_error.unwrap().contains("connection refused"));

        // Retried lazily
        script.fail_connect.store(false, Ordering::SeqCst);
        pool.query("SELECT 1", &[]).await.unwrap();
        assert!(pool.status().is_healthy);
    }

    #[tokio::test]
    async fn test_acquire_reuses_idle_connection() {
        let (pool, script) = pool_with(limits(1, 5));
        pool.fill_to_min().await.unwrap();
        let conn = pool.acquire().await.unwrap();
        let first = conn.id().to_string();
        assert_eq!(pool.status().active_connections, 1);
        conn.release().await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), first);
        conn.release().await;
        assert_eq!(script.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_strategy_order() {
        for (strategy, expect_oldest) in [(QueueStrategy::Fifo, true), (QueueStrategy::Lifo, false)] {
            let (pool, _) = pool_with(PoolOptions {
                queue_strategy: Some(strategy),
                ..limits(0, 2)
            });
            let a = pool.acquire().await.unwrap();
            let b = pool.acquire().await.unwrap();
            let (a_id, b_id) = (a.id().to_string(), b.id().to_string());
            a.release().await;
            b.release().await;

            let next = pool.acquire().await.unwrap();
            let expected = if expect_oldest { &a_id } else { &b_id };
            assert_eq!(next.id(), expected, "{strategy:?}");
            next.release().await;
        }
    }

    #[tokio::test]
    async fn test_fail_fast_when_saturated() {
        let (pool, script) = pool_with(PoolOptions {
            on_exhausted: Some(ExhaustedAction::Fail),
            ..limits(0, 2)
        });
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(
            err,
            PoolError::PoolExhausted {
                pool_id: "test".into(),
                max_connections: 2
            }
        );
        assert_eq!(script.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.status().total_connections, 2);
        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn test_timeout_when_saturated() {
        let (pool, _) = pool_with(PoolOptions {
            acquire_timeout_secs: Some(0.05),
            ..limits(0, 1)
        });
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "AcquireTimeout");
        let status = pool.status();
        assert_eq!(status.total_connections, 1);
        assert_eq!(status.waiting_requests, 0);
        assert!(status.last_error.unwrap().starts_with("Timed out"));
        // Exhaustion is not a query
        assert_eq!(pool.metrics().total_queries, 0);
        held.release().await;
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_release() {
        let (pool, _) = pool_with(PoolOptions {
            acquire_timeout_secs: Some(0.0),
            ..limits(0, 1)
        });
        let held = pool.acquire().await.unwrap();
        let held_id = held.id().to_string();

        let mut waiter = tokio_test::task::spawn(pool.acquire());
        assert_pending!(waiter.poll());
        assert_eq!(pool.status().waiting_requests, 1);

        held.release().await;
        assert!(waiter.is_woken());
        let conn = assert_ready_ok!(waiter.poll());
        assert_eq!(conn.id(), held_id);
        assert_eq!(pool.status().waiting_requests, 0);
        conn.release().await;
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaks_nothing() {
        let (pool, _) = pool_with(PoolOptions {
            acquire_timeout_secs: Some(0.0),
            ..limits(0, 1)
        });
        let held = pool.acquire().await.unwrap();
        let mut waiter = tokio_test::task::spawn(pool.acquire());
        assert_pending!(waiter.poll());
        drop(waiter);
        assert_eq!(pool.status().waiting_requests, 0);

        held.release().await;
        let conn = pool.acquire().await.unwrap();
        conn.release().await;
        assert_eq!(pool.status().total_connections, 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_returns_connection() {
        let (pool, _) = pool_with(limits(0, 1));
        let conn = pool.acquire().await.unwrap();
        drop(conn);
        settle(&pool, 1).await;
        assert_eq!(pool.status().active_connections, 0);
        pool.acquire().await.unwrap().release().await;
    }

    #[tokio::test]
    async fn test_invalid_connection_replaced_on_acquire() {
        let (pool, script) = pool_with(limits(1, 2));
        pool.fill_to_min().await.unwrap();
        script.invalid.store(true, Ordering::SeqCst);
        // Fresh connections are not validated before use
        let conn = pool.acquire().await.unwrap();
        assert_eq!(script.connects.load(Ordering::SeqCst), 2);
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);

        // Fails validation on release and is closed
        conn.release().await;
        assert_eq!(pool.status().total_connections, 0);
        assert_eq!(script.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_retires_connection() {
        let (pool, script) = pool_with(limits(0, 2));
        let err = pool.execute("FATAL", &[]).await.unwrap_err();
        assert_eq!(err.kind(), "CommandFailed");
        assert_eq!(pool.status().total_connections, 0);
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);

        let metrics = pool.metrics();
        assert_eq!(metrics.total_queries, 1);
        assert_eq!(metrics.total_errors, 1);
        assert_eq!(metrics.error_rate, 1.0);
        // Statement failures are not pool-level
        assert!(pool.status().is_healthy);
    }

    #[tokio::test]
    async fn test_metrics_after_two_queries() {
        let (pool, _) = pool_with(limits(1, 3));
        pool.fill_to_min().await.unwrap();
        pool.query("SELECT 1", &[]).await.unwrap();
        let result = pool.execute("UPDATE t SET a = ?", &[1i64.into()]).await.unwrap();
        assert_eq!(result.affected_rows, 1);

        let metrics = pool.metrics();
        assert_eq!(metrics.total_queries, 2);
        assert_eq!(metrics.total_errors, 0);
        assert_eq!(metrics.error_rate, 0.0);
        assert_eq!(metrics.connection_utilization, 0.0);
        assert!(metrics.p99_latency_ms >= metrics.avg_latency_ms);
    }

    #[tokio::test]
    async fn test_no_double_checkout_while_held() {
        let (pool, _) = pool_with(limits(0, 4));
        let held: Vec<_> = {
            let mut held = Vec::new();
            for _ in 0..4 {
                held.push(pool.acquire().await.unwrap());
            }
            held
        };
        let ids: HashSet<_> = held.iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids.len(), 4);
        let status = pool.status();
        assert_eq!(status.active_connections, 4);
        assert!(status.total_connections <= status.max_connections);
        for conn in held {
            conn.release().await;
        }
        assert_eq!(pool.status().idle_connections, 4);
    }

    #[tokio::test]
    async fn test_reap_idle_respects_min() {
        let (pool, script) = pool_with(PoolOptions {
            idle_timeout_secs: Some(10),
            ..limits(1, 3)
        });
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        for conn in [a, b, c] {
            conn.release().await;
        }

        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(pool.shared.reap(later).await, 2);
        assert_eq!(pool.status().total_connections, 1);
        assert_eq!(script.closes.load(Ordering::SeqCst), 2);
        // Fresh idle connections survive
        assert_eq!(pool.reap().await, 0);
    }

    #[tokio::test]
    async fn test_reap_max_lifetime_ignores_min() {
        let (pool, _) = pool_with(PoolOptions {
            max_lifetime_secs: Some(60),
            idle_timeout_secs: Some(0),
            ..limits(2, 2)
        });
        pool.fill_to_min().await.unwrap();
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(pool.shared.reap(later).await, 2);
        assert_eq!(pool.status().total_connections, 0);
        assert_eq!(pool.fill_to_min().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_receives_connection_opened_by_fill() {
        let (pool, script) = pool_with(PoolOptions {
            acquire_timeout_secs: Some(5.0),
            ..limits(1, 1)
        });
        script.connect_delay_ms.store(50, Ordering::SeqCst);
        let filler = tokio::spawn({
            let pool = pool.clone();
            async move { pool.fill_to_min().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The fill's connect is still in flight and holds the only slot
        let conn = pool.acquire().await.unwrap();
        assert_eq!(filler.await.unwrap().unwrap(), 1);
        assert_eq!(script.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().active_connections, 1);
        conn.release().await;
    }

    #[tokio::test]
    async fn test_fill_tops_up_around_checkouts() {
        let (pool, script) = pool_with(limits(2, 2));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        a.discard().await;
        assert_eq!(pool.fill_to_min().await.unwrap(), 1);
        assert_eq!(script.connects.load(Ordering::SeqCst), 3);
        assert_eq!(pool.status().total_connections, 2);
        b.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_recycles_expired_connections() {
        let (pool, script) = pool_with(PoolOptions {
            max_lifetime_secs: Some(60),
            idle_timeout_secs: Some(0),
            cleanup_interval_secs: Some(5),
            ..limits(2, 2)
        });
        pool.fill_to_min().await.unwrap();

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(script.closes.load(Ordering::SeqCst), 2);
        assert_eq!(script.connects.load(Ordering::SeqCst), 4);
        assert_eq!(pool.status().idle_connections, 2);

        // Detached so close() cannot abort it; the task must notice on its own
        let reaper = lock(&pool.shared.reaper).take().unwrap();
        pool.close().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(reaper.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_exits_when_pool_dropped() {
        let (pool, _) = pool_with(PoolOptions {
            idle_timeout_secs: Some(30),
            cleanup_interval_secs: Some(5),
            ..limits(0, 2)
        });
        let reaper = lock(&pool.shared.reaper).take().unwrap();
        assert!(!reaper.is_finished());
        drop(pool);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(reaper.is_finished());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_callers() {
        let (pool, script) = pool_with(limits(2, 3));
        pool.fill_to_min().await.unwrap();
        let held = pool.acquire().await.unwrap();

        pool.close().await;
        pool.close().await;
        let status = pool.status();
        assert_eq!(status.total_connections, 0);
        assert!(!status.is_healthy);

        // In-flight holder sees the shutdown on its next statement
        let err = held.query("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), "PoolClosed");
        held.release().await;
        assert_eq!(pool.status().total_connections, 0);
        assert_eq!(script.closes.load(Ordering::SeqCst), 2);

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "PoolClosed");
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_waiters() {
        let (pool, _) = pool_with(PoolOptions {
            acquire_timeout_secs: Some(0.0),
            ..limits(0, 1)
        });
        let held = pool.acquire().await.unwrap();
        let mut waiter = tokio_test::task::spawn(pool.acquire());
        assert_pending!(waiter.poll());

        pool.close().await;
        assert!(waiter.is_woken());
        match waiter.poll() {
            std::task::Poll::Ready(Err(e)) => assert_eq!(e.kind(), "PoolClosed"),
            other => panic!("expected PoolClosed, got {other:?}"),
        }
        drop(waiter);
        held.release().await;
    }
}
