//! Database connection pool
//!
//! This module provides the pool that request handlers share:
//! - Circuit breaker admission before any connection is touched
//! - LIFO reuse of idle connections with validation by policy
//! - Growth up to the configured maximum with retry and backoff
//! - Bounded waiting when the pool is exhausted
//! - Statement caching, query limits and metrics
//! - Idle reaping and graceful draining

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::circuit::CircuitBreaker;
use super::connection::{ConnectionId, ConnectionInfo, NativeSlot, PooledConnection};
use super::error::PoolError;
use super::metrics::{HealthSummary, PoolMetrics, PoolStats};
use super::statement::{Statement, StatementCache, StatementKind};
use crate::config::PoolConfig;
use crate::driver::{Connector, DriverError, DriverErrorKind, Row, SqlxConnector, Value};

/// Interval at which `drain` re-checks for in-use connections
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Longest statement text written to a log line
const LOG_STATEMENT_CHARS: usize = 200;

/// Mutable pool bookkeeping, guarded by one short-lived lock
struct PoolState {
    /// Idle connections, most recently released last
    idle: Vec<PooledConnection>,

    /// Checked-out connections
    in_use: HashMap<ConnectionId, CheckedOut>,

    /// Slots reserved by connections being opened or validated
    pending: usize,

    /// Bumped by every drain; leases from older generations are closed on return
    generation: u64,

    /// Set by `drain` until the breaker is reset; nothing is handed out meanwhile
    draining: bool,
}

/// A leased connection as the pool sees it
struct CheckedOut {
    /// As it looked when handed out
    info: ConnectionInfo,

    /// Lets a timed-out drain close the connection under the lease
    native: NativeSlot,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.pending
    }
}

/// Outcome of returning a connection to the pool
#[derive(Debug)]
enum CheckIn {
    Pooled,
    /// Checked out before a drain; close it
    Retired(PooledConnection),
    /// Not checked out; never added to the idle stack
    Rejected(PooledConnection),
}

struct Shared {
    label: String,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    breaker: CircuitBreaker,
    state: Mutex<PoolState>,
    statements: Mutex<StatementCache>,
    metrics: PoolMetrics,
    available: Notify,
    next_id: AtomicU64,
}

/// A reserved pool slot, released on drop unless fulfilled
struct PendingSlot<'a> {
    shared: &'a Shared,
    fulfilled: bool,
}

impl<'a> PendingSlot<'a> {
    /// Caller must already have counted the slot in `pending`
    fn reserved(shared: &'a Shared) -> Self {
        Self {
            shared,
            fulfilled: false,
        }
    }

    /// Move the slot to the in-use set; returns the current generation, or
    /// `None` if a drain started while the connection was being prepared
    fn fulfil(mut self, conn: &PooledConnection) -> Option<u64> {
        let mut state = self.shared.state.lock();
        state.pending -= 1;
        self.fulfilled = true;
        if state.draining {
            return None;
        }
        state.in_use.insert(
            conn.id(),
            CheckedOut {
                info: conn.info(),
                native: conn.native_slot(),
            },
        );
        Some(state.generation)
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if !self.fulfilled {
            self.shared.state.lock().pending -= 1;
            self.shared.available.notify_one();
        }
    }
}

/// Breaker admission that must be resolved before it is dropped
///
/// Dropping an unresolved admission (pool exhausted, caller cancelled)
/// gives a half-open trial slot back.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    resolved: bool,
}

impl<'a> Admission<'a> {
    fn request(breaker: &'a CircuitBreaker) -> Result<Self, PoolError> {
        breaker.check_request()?;
        Ok(Self {
            breaker,
            resolved: false,
        })
    }

    fn succeed(mut self) {
        self.breaker.record_success();
        self.resolved = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.abandon();
        }
    }
}

fn released_error() -> PoolError {
    PoolError::Driver(DriverError::new(
        DriverErrorKind::Closed,
        "connection already returned to the pool",
    ))
}

/// The leased connection, unless it was returned or closed by a drain
fn live(conn: &mut Option<PooledConnection>) -> Result<&mut PooledConnection, PoolError> {
    let conn = conn.as_mut().ok_or_else(released_error)?;
    if !conn.is_open() {
        return Err(PoolError::Driver(DriverError::new(
            DriverErrorKind::Closed,
            "connection was closed by a pool drain",
        )));
    }
    Ok(conn)
}

impl Shared {
    /// Rejection for callers that reach the pool while it is draining
    fn draining_error(&self) -> PoolError {
        let circuit = self.breaker.stats();
        PoolError::CircuitOpen {
            failure_count: circuit.failure_count,
            retry_in: circuit
                .retry_in
                .unwrap_or_else(|| self.breaker.config().recovery_time()),
        }
    }

    /// Enforce query limits, fetch the statement from the cache, then check
    /// it against the supplied parameters
    ///
    /// Transaction control must go through the lease so its transaction
    /// marker matches the session; a stray `BEGIN` would otherwise return
    /// an open transaction to the idle stack.
    fn prepare(&self, sql: &str, params: &[Value]) -> Result<Arc<Statement>, PoolError> {
        if let Err(violation) = self.config.limits.check(sql, params) {
            PoolMetrics::incr(&self.metrics.dos_blocked);
            warn!(
                pool = %self.label,
                bytes = sql.len(),
                params = params.len(),
                violation = ?violation,
                "Rejected query exceeding limits"
            );
            return Err(violation.into());
        }

        let (statement, hit) = self.statements.lock().get_or_prepare(sql);
        debug!(pool = %self.label, fingerprint = &statement.fingerprint()[..12], hit, "Prepared statement");

        if statement.kind() == StatementKind::Transaction {
            return Err(PoolError::TransactionControl(statement.preview(LOG_STATEMENT_CHARS)));
        }
        if let Some(expected) = statement.placeholders().expected(self.config.driver) {
            if expected != params.len() {
                debug!(
                    pool = %self.label,
                    expected,
                    supplied = params.len(),
                    statement = %statement.preview(LOG_STATEMENT_CHARS),
                    "Rejected statement with mismatched parameters"
                );
                return Err(PoolError::ParameterMismatch {
                    expected,
                    supplied: params.len(),
                });
            }
        }
        Ok(statement)
    }

    /// Open one physical connection without retrying
    async fn connect_once(&self) -> Result<PooledConnection, DriverError> {
        match self.connector.connect(&self.config).await {
            Ok(native) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                PoolMetrics::incr(&self.metrics.connections_created);
                debug!(pool = %self.label, connection_id = id, "Opened connection");
                Ok(PooledConnection::new(id, native, self.config.pool.max_lifetime()))
            }
            Err(e) => {
                PoolMetrics::incr(&self.metrics.connection_failures);
                Err(e)
            }
        }
    }

    /// Open a connection, retrying transient failures with backoff
    ///
    /// Every failed attempt is reported to the breaker. Retrying stops at
    /// an authentication error, once attempts run out, or when the breaker
    /// has opened.
    async fn open_connection(&self) -> Result<PooledConnection, DriverError> {
        let policy = &self.config.retry;
        let mut retries = 0u32;

        loop {
            match self.connect_once().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    self.breaker.record_failure();

                    if !policy.is_retryable(&e) {
                        warn!(pool = %self.label, error = %e, "Authentication failed, not retrying");
                        return Err(e);
                    }
                    if retries >= policy.attempts {
                        warn!(pool = %self.label, attempts = retries + 1, error = %e, "Connection attempts exhausted");
                        return Err(e);
                    }
                    if self.breaker.state().is_open() {
                        warn!(pool = %self.label, error = %e, "Circuit opened, abandoning connection retries");
                        return Err(e);
                    }

                    retries += 1;
                    let delay = policy.delay_for(retries);
                    debug!(
                        pool = %self.label,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying connection"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One pass over the pool: reuse an idle connection, or grow
    ///
    /// Returns `None` when the pool is at capacity with nothing idle.
    async fn try_checkout(self: &Arc<Self>) -> Result<Option<Lease>, PoolError> {
        loop {
            let (slot, candidate) = {
                let mut state = self.state.lock();
                if state.draining {
                    drop(state);
                    return Err(self.draining_error());
                }
                match state.idle.pop() {
                    Some(conn) => {
                        state.pending += 1;
                        (PendingSlot::reserved(self), Some(conn))
                    }
                    None if state.total() < self.config.pool.max_connections => {
                        state.pending += 1;
                        (PendingSlot::reserved(self), None)
                    }
                    None => return Ok(None),
                }
            };

            let Some(mut conn) = candidate else {
                let conn = self.open_connection().await?;
                PoolMetrics::incr(&self.metrics.pool_misses);
                return self.checkout(slot, conn).map(Some);
            };

            if conn.should_refresh() {
                debug!(pool = %self.label, connection_id = conn.id(), "Recycling connection past max lifetime");
                self.close_connection(conn).await;
                continue;
            }

            if self.config.validation.requires_validation(conn.since_last_validation()) {
                if let Err(e) = conn.ping().await {
                    warn!(
                        pool = %self.label,
                        connection_id = conn.id(),
                        error = %e,
                        "Evicting connection after failed ping"
                    );
                    PoolMetrics::incr(&self.metrics.evictions);
                    self.close_connection(conn).await;
                    continue;
                }
            }

            PoolMetrics::incr(&self.metrics.pool_hits);
            debug!(
                pool = %self.label,
                connection_id = conn.id(),
                query_count = conn.query_count(),
                age_secs = conn.age().as_secs(),
                "Reusing connection"
            );
            return self.checkout(slot, conn).map(Some);
        }
    }

    fn checkout(self: &Arc<Self>, slot: PendingSlot<'_>, mut conn: PooledConnection) -> Result<Lease, PoolError> {
        conn.acquire()?;
        let Some(generation) = slot.fulfil(&conn) else {
            debug!(pool = %self.label, connection_id = conn.id(), "Pool draining, dropping new checkout");
            self.discard(conn);
            return Err(self.draining_error());
        };
        Ok(Lease {
            id: conn.id(),
            conn: Some(conn),
            shared: Arc::clone(self),
            generation,
        })
    }

    fn check_in(&self, mut conn: PooledConnection, generation: u64) -> CheckIn {
        let mut state = self.state.lock();
        let checked_out = state.in_use.remove(&conn.id()).is_some();
        // A timed-out drain already dropped its leases from the in-use set
        if generation != state.generation || state.draining {
            drop(state);
            self.available.notify_one();
            return CheckIn::Retired(conn);
        }
        if !checked_out {
            warn!(
                pool = %self.label,
                connection_id = conn.id(),
                "Ignoring release of a connection that is not checked out"
            );
            return CheckIn::Rejected(conn);
        }

        conn.mark_idle();
        state.idle.push(conn);
        drop(state);
        self.available.notify_one();
        CheckIn::Pooled
    }

    /// Drop a checked-out connection from the in-use set
    fn forget(&self, id: ConnectionId) {
        if self.state.lock().in_use.remove(&id).is_some() {
            PoolMetrics::incr(&self.metrics.evictions);
        }
        self.available.notify_one();
    }

    async fn evict(&self, conn: PooledConnection, reason: &'static str) {
        warn!(pool = %self.label, connection_id = conn.id(), reason, "Evicting connection");
        self.forget(conn.id());
        self.close_connection(conn).await;
    }

    async fn close_connection(&self, conn: PooledConnection) {
        let id = conn.id();
        match conn.close().await {
            Ok(true) => {}
            // Already closed and counted by a drain
            Ok(false) => return,
            Err(e) => {
                debug!(pool = %self.label, connection_id = id, error = %e, "Error while closing connection");
            }
        }
        PoolMetrics::incr(&self.metrics.connections_closed);
    }

    /// Close a native handle taken from a lease by a timed-out drain
    async fn force_close(&self, id: ConnectionId, native: NativeSlot) -> bool {
        // Waits for a statement already running on it
        let handle = native.lock().await.take();
        let Some(handle) = handle else {
            return false;
        };
        if let Err(e) = handle.close().await {
            debug!(pool = %self.label, connection_id = id, error = %e, "Error while force-closing connection");
        }
        PoolMetrics::incr(&self.metrics.connections_closed);
        true
    }

    /// Close without awaiting, for drop paths
    fn discard(&self, conn: PooledConnection) {
        if conn.is_open() {
            debug!(pool = %self.label, connection_id = conn.id(), "Discarding connection");
            PoolMetrics::incr(&self.metrics.connections_closed);
        }
        drop(conn);
    }

    /// Account for one finished statement
    fn observe(&self, conn: &mut PooledConnection, statement: &Statement, elapsed: Duration, error: Option<&DriverError>) {
        conn.record_query(elapsed);
        let slow = self.config.limits.is_slow(elapsed);
        self.metrics.record_query(elapsed, error.is_some(), slow);

        if slow {
            warn!(
                pool = %self.label,
                connection_id = conn.id(),
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.config.limits.slow_query_ms,
                statement = %statement.preview(LOG_STATEMENT_CHARS),
                "Slow query"
            );
        }
        if let Some(e) = error {
            self.breaker.record_failure();
            debug!(
                pool = %self.label,
                connection_id = conn.id(),
                error = %e,
                statement = %statement.preview(LOG_STATEMENT_CHARS),
                "Query failed"
            );
        }
    }
}

/// Shared handle to a database connection pool
///
/// Cloning is cheap; every clone drives the same pool.
#[derive(Clone)]
pub struct DatabasePool {
    shared: Arc<Shared>,
}

impl DatabasePool {
    /// Create a pool over `connector`
    ///
    /// The configuration is validated first. With `warm_up` set the
    /// minimum number of connections is opened up front; failures are
    /// logged and the pool grows lazily instead.
    pub async fn new<C: Connector>(config: PoolConfig, connector: C) -> Result<Self, PoolError> {
        config.validate()?;

        let label = format!("{}/{}", config.driver, config.database);
        let shared = Shared {
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            statements: Mutex::new(StatementCache::new(config.statement_cache_size)),
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(config.pool.max_connections),
                in_use: HashMap::new(),
                pending: 0,
                generation: 0,
                draining: false,
            }),
            metrics: PoolMetrics::default(),
            available: Notify::new(),
            next_id: AtomicU64::new(0),
            connector: Arc::new(connector),
            label,
            config,
        };
        let pool = Self {
            shared: Arc::new(shared),
        };

        info!(
            pool = %pool.shared.label,
            min_connections = pool.shared.config.pool.min_connections,
            max_connections = pool.shared.config.pool.max_connections,
            "Database pool created"
        );

        if pool.shared.config.pool.warm_up {
            pool.warm_up().await;
        }
        Ok(pool)
    }

    /// Create a pool backed by the sqlx driver
    pub async fn connect(config: PoolConfig) -> Result<Self, PoolError> {
        Self::new(config, SqlxConnector::new()).await
    }

    /// Open connections until the pool holds its configured minimum
    ///
    /// Returns the number of connections opened.
    pub async fn warm_up(&self) -> usize {
        let shared = &self.shared;
        let target = shared.config.pool.min_connections;
        let mut created = 0;

        for _ in 0..target {
            {
                let state = shared.state.lock();
                if state.draining || state.total() >= target {
                    break;
                }
            }
            match shared.connect_once().await {
                Ok(conn) => {
                    shared.state.lock().idle.push(conn);
                    created += 1;
                }
                Err(e) => {
                    warn!(pool = %shared.label, error = %e, "Warm-up connection failed");
                }
            }
        }

        info!(pool = %shared.label, created, target, "Warm-up complete");
        created
    }

    /// Check out a connection
    ///
    /// Fails fast with `CircuitOpen` while the breaker rejects requests,
    /// and with `PoolExhausted` when no connection frees up within the
    /// wait timeout.
    pub async fn acquire(&self) -> Result<Lease, PoolError> {
        let shared = &self.shared;
        let admission = Admission::request(&shared.breaker)?;

        let wait_timeout = shared.config.pool.wait_timeout();
        let deadline = tokio::time::Instant::now() + wait_timeout;

        loop {
            // Registered before the pass so a release or drain during it still wakes us
            let notified = shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = shared.try_checkout().await? {
                admission.succeed();
                return Ok(lease);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                PoolMetrics::incr(&shared.metrics.wait_timeouts);
                warn!(
                    pool = %shared.label,
                    max_connections = shared.config.pool.max_connections,
                    wait_ms = wait_timeout.as_millis() as u64,
                    "Pool exhausted"
                );
                return Err(PoolError::PoolExhausted {
                    max_connections: shared.config.pool.max_connections,
                    wait_timeout,
                });
            }
        }
    }

    /// Return a leased connection; same as [`Lease::release`]
    pub async fn release(&self, lease: Lease) -> Result<(), PoolError> {
        lease.release().await
    }

    /// Run a query and return its rows
    ///
    /// A failed query counts against the circuit breaker, but the checkout
    /// before it records a success and resets the failure streak. Failures
    /// through this method therefore never accumulate past one; to trip a
    /// higher threshold on query errors alone they must come from a single
    /// held [`Lease`]. Connection failures accumulate either way.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, PoolError> {
        let statement = self.shared.prepare(sql, params)?;
        let mut lease = self.acquire().await?;

        let result = lease.query_prepared(&statement, params).await;
        let released = lease.release().await;
        let rows = result?;
        released?;
        Ok(rows)
    }

    /// Run a statement and return the affected row count
    ///
    /// Breaker accounting is the same as for [`query`](Self::query).
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, PoolError> {
        let statement = self.shared.prepare(sql, params)?;
        let mut lease = self.acquire().await?;

        let result = lease.execute_prepared(&statement, params).await;
        let released = lease.release().await;
        let affected = result?;
        released?;
        Ok(affected)
    }

    /// Check out a connection with an open transaction
    ///
    /// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback).
    pub async fn begin_transaction(&self) -> Result<Lease, PoolError> {
        let mut lease = self.acquire().await?;
        if let Err(e) = lease.begin().await {
            if let Err(release_err) = lease.release().await {
                debug!(pool = %self.shared.label, error = %release_err, "Release after failed BEGIN failed");
            }
            return Err(e);
        }
        Ok(lease)
    }

    /// Commit and return the connection to the pool
    ///
    /// A failed commit leaves the transaction open, so release rolls it back.
    pub async fn commit(&self, mut lease: Lease) -> Result<(), PoolError> {
        let result = lease.commit().await;
        let released = lease.release().await;
        result?;
        released
    }

    /// Roll back and return the connection to the pool
    ///
    /// A connection whose rollback fails is evicted.
    pub async fn rollback(&self, mut lease: Lease) -> Result<(), PoolError> {
        match lease.rollback().await {
            Ok(()) => lease.release().await,
            Err(e) => {
                lease.discard().await;
                Err(e)
            }
        }
    }

    /// Run `work` inside a transaction
    ///
    /// Commits when `work` succeeds and rolls back when it fails.
    pub async fn transaction<T, F>(&self, work: F) -> Result<T, PoolError>
    where
        F: for<'l> FnOnce(&'l mut Lease) -> BoxFuture<'l, Result<T, PoolError>>,
    {
        let mut lease = self.begin_transaction().await?;
        match work(&mut lease).await {
            Ok(value) => {
                self.commit(lease).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback(lease).await {
                    warn!(pool = %self.shared.label, error = %rollback_err, "Rollback after failed transaction failed");
                }
                Err(e)
            }
        }
    }

    /// Close idle connections past the idle timeout or max lifetime
    ///
    /// Never shrinks the pool below `min_connections`. Returns the number
    /// of connections closed.
    pub async fn reap_idle(&self) -> usize {
        let shared = &self.shared;
        let idle_timeout = shared.config.pool.idle_timeout();
        let min = shared.config.pool.min_connections;

        let reaped = {
            let mut state = shared.state.lock();
            let mut total = state.total();
            let mut reaped = Vec::new();

            // Bottom of the stack holds the longest-idle connections
            let mut i = 0;
            while i < state.idle.len() && total > min {
                let conn = &state.idle[i];
                if conn.should_refresh() || conn.idle_time() > idle_timeout {
                    reaped.push(state.idle.remove(i));
                    total -= 1;
                } else {
                    i += 1;
                }
            }
            reaped
        };

        let count = reaped.len();
        for conn in reaped {
            shared.close_connection(conn).await;
        }
        if count > 0 {
            debug!(pool = %shared.label, reaped = count, "Reaped idle connections");
        }
        count
    }

    /// Stop admitting work and close every connection
    ///
    /// Forces the breaker open and fails callers already waiting for a
    /// connection, then waits up to `timeout` for checked-out connections to
    /// come back. Returns `false` if some were still out; those are closed
    /// under their leases, whose later statements fail with a `Closed`
    /// driver error. The pool stays closed until
    /// [`reset_circuit_breaker`](Self::reset_circuit_breaker).
    pub async fn drain(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        info!(pool = %shared.label, timeout_ms = timeout.as_millis() as u64, "Draining pool");
        shared.breaker.force_open();
        shared.state.lock().draining = true;
        shared.available.notify_waiters();

        let deadline = Instant::now() + timeout;
        let graceful = loop {
            let in_use = shared.state.lock().in_use.len();
            if in_use == 0 {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            debug!(pool = %shared.label, in_use, "Waiting for connections to be returned");
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        };

        let (idle, leased) = {
            let mut state = shared.state.lock();
            state.generation += 1;
            let leased: Vec<(ConnectionId, NativeSlot)> =
                state.in_use.drain().map(|(id, out)| (id, out.native)).collect();
            (std::mem::take(&mut state.idle), leased)
        };
        let closed = idle.len();
        for conn in idle {
            shared.close_connection(conn).await;
        }

        let mut forced = 0usize;
        for (id, native) in leased {
            warn!(pool = %shared.label, connection_id = id, "Force-closing connection still in use");
            if shared.force_close(id, native).await {
                forced += 1;
            }
        }
        shared.statements.lock().clear();

        if graceful {
            info!(pool = %shared.label, closed, "Pool drained");
        } else {
            warn!(pool = %shared.label, closed, forced, "Drain timed out, in-use connections force-closed");
        }
        graceful
    }

    /// Return the breaker to Closed and reopen a drained pool
    pub fn reset_circuit_breaker(&self) {
        self.shared.state.lock().draining = false;
        self.shared.breaker.reset();
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.shared.metrics
    }

    pub fn get_stats(&self) -> PoolStats {
        let shared = &self.shared;
        let (idle, in_use, pending) = {
            let state = shared.state.lock();
            (state.idle.len(), state.in_use.len(), state.pending)
        };
        let (cache_size, cache_hits, cache_misses) = {
            let cache = shared.statements.lock();
            (cache.len(), cache.hits(), cache.misses())
        };

        PoolStats {
            driver: shared.config.driver.name(),
            size: idle + in_use,
            idle,
            in_use,
            pending,
            min_connections: shared.config.pool.min_connections,
            max_connections: shared.config.pool.max_connections,
            statement_cache_size: cache_size,
            statement_cache_hits: cache_hits,
            statement_cache_misses: cache_misses,
            metrics: shared.metrics.snapshot(),
            circuit: shared.breaker.stats(),
        }
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        self.get_stats().health_summary()
    }

    /// Per-connection details, ordered by id
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.shared.state.lock();
        let mut infos: Vec<ConnectionInfo> = state
            .idle
            .iter()
            .map(PooledConnection::info)
            .chain(state.in_use.values().map(|out| out.info.clone()))
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

impl std::fmt::Debug for DatabasePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DatabasePool")
            .field("pool", &self.shared.label)
            .field("idle", &state.idle.len())
            .field("in_use", &state.in_use.len())
            .field("breaker", &self.shared.breaker.state().name())
            .finish()
    }
}

/// A connection checked out of a [`DatabasePool`]
///
/// Return it with [`release`](Self::release). A lease dropped without
/// release goes back to the pool on its own, unless a transaction is still
/// open; then the connection is discarded. A drain that times out closes
/// the connection under the lease.
pub struct Lease {
    id: ConnectionId,
    conn: Option<PooledConnection>,
    shared: Arc<Shared>,
    generation: u64,
}

impl Lease {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.conn.as_ref().is_some_and(PooledConnection::in_transaction)
    }

    pub fn info(&self) -> Option<ConnectionInfo> {
        self.conn.as_ref().map(PooledConnection::info)
    }

    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, PoolError> {
        let statement = self.shared.prepare(sql, params)?;
        self.query_prepared(&statement, params).await
    }

    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, PoolError> {
        let statement = self.shared.prepare(sql, params)?;
        self.execute_prepared(&statement, params).await
    }

    async fn query_prepared(&mut self, statement: &Statement, params: &[Value]) -> Result<Vec<Row>, PoolError> {
        let conn = live(&mut self.conn)?;
        let started = Instant::now();
        let result = conn.query(statement, params).await;
        self.shared.observe(conn, statement, started.elapsed(), result.as_ref().err());
        Ok(result?)
    }

    async fn execute_prepared(&mut self, statement: &Statement, params: &[Value]) -> Result<u64, PoolError> {
        let conn = live(&mut self.conn)?;
        let started = Instant::now();
        let result = conn.execute(statement, params).await;
        self.shared.observe(conn, statement, started.elapsed(), result.as_ref().err());
        Ok(result?)
    }

    pub async fn begin(&mut self) -> Result<(), PoolError> {
        let conn = live(&mut self.conn)?;
        if conn.in_transaction() {
            return Err(PoolError::TransactionAlreadyOpen(conn.id()));
        }
        if let Err(e) = conn.begin().await {
            self.shared.breaker.record_failure();
            return Err(e.into());
        }
        PoolMetrics::incr(&self.shared.metrics.transactions_begun);
        debug!(pool = %self.shared.label, connection_id = conn.id(), "Transaction started");
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<(), PoolError> {
        let conn = live(&mut self.conn)?;
        if !conn.in_transaction() {
            return Err(PoolError::NoActiveTransaction(conn.id()));
        }
        if let Err(e) = conn.commit().await {
            self.shared.breaker.record_failure();
            return Err(e.into());
        }
        PoolMetrics::incr(&self.shared.metrics.transactions_committed);
        debug!(pool = %self.shared.label, connection_id = conn.id(), "Transaction committed");
        Ok(())
    }

    /// Roll back the open transaction
    ///
    /// On failure the transaction stays marked open, so releasing the
    /// lease evicts the connection.
    pub async fn rollback(&mut self) -> Result<(), PoolError> {
        let conn = live(&mut self.conn)?;
        if !conn.in_transaction() {
            return Err(PoolError::NoActiveTransaction(conn.id()));
        }
        if let Err(e) = conn.rollback().await {
            PoolMetrics::incr(&self.shared.metrics.rollback_failures);
            return Err(PoolError::RollbackFailed {
                connection_id: conn.id(),
                source: e,
            });
        }
        PoolMetrics::incr(&self.shared.metrics.transactions_rolled_back);
        debug!(pool = %self.shared.label, connection_id = conn.id(), "Transaction rolled back");
        Ok(())
    }

    /// Return the connection to the pool
    ///
    /// An open transaction is rolled back first; if that fails the
    /// connection is evicted and `RollbackFailed` is returned.
    pub async fn release(mut self) -> Result<(), PoolError> {
        let had_transaction = self
            .conn
            .as_ref()
            .is_some_and(|conn| conn.in_transaction() && conn.is_open());
        // Stays in the lease while awaiting so a cancelled release falls back to Drop
        let outcome = match self.conn.as_mut() {
            Some(conn) => conn.release().await,
            None => return Ok(()),
        };
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);

        if let Err(e) = outcome {
            PoolMetrics::incr(&shared.metrics.rollback_failures);
            shared.evict(conn, "rollback failed").await;
            return Err(e);
        }
        if had_transaction {
            PoolMetrics::incr(&shared.metrics.transactions_rolled_back);
        }

        match shared.check_in(conn, self.generation) {
            CheckIn::Pooled => {}
            CheckIn::Retired(conn) | CheckIn::Rejected(conn) => shared.close_connection(conn).await,
        }
        Ok(())
    }

    /// Remove the connection from the pool and close it
    pub async fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            let shared = Arc::clone(&self.shared);
            shared.evict(conn, "discarded by caller").await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if conn.in_transaction() {
            warn!(
                pool = %self.shared.label,
                connection_id = conn.id(),
                "Lease dropped with an open transaction, discarding connection"
            );
            self.shared.forget(conn.id());
            self.shared.discard(conn);
            return;
        }

        match self.shared.check_in(conn, self.generation) {
            CheckIn::Pooled => {}
            CheckIn::Retired(conn) | CheckIn::Rejected(conn) => self.shared.discard(conn),
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("in_transaction", &self.in_transaction())
            .field("generation", &self.generation)
            .finish()
    }
}
