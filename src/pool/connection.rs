//! Pooled connection wrapper
//!
//! Wraps one native connection with the lifecycle metadata the pool needs:
//! - idle/in-use state and transaction marker
//! - creation, last-use and last-validation timestamps
//! - per-connection query statistics

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::error::PoolError;
use super::statement::Statement;
use crate::driver::{DriverError, DriverErrorKind, NativeConnection, Row, Value};

/// Native handle shared with the pool, so a drain can close it under a lease
pub(crate) type NativeSlot = Arc<AsyncMutex<Option<Box<dyn NativeConnection>>>>;

fn closed_error() -> DriverError {
    DriverError::new(DriverErrorKind::Closed, "connection was closed by a pool drain")
}

/// Pool-unique connection identifier
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    InUse,
}

/// Point-in-time description of one pooled connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub age: Duration,
    pub idle_time: Duration,
    pub since_validation: Duration,
    pub in_transaction: bool,
    pub query_count: u64,
    pub total_query_time: Duration,
}

/// One live native connection plus its lifecycle metadata
pub struct PooledConnection {
    id: ConnectionId,
    native: NativeSlot,
    state: ConnectionState,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    last_used: Instant,
    last_validated: Instant,
    in_transaction: bool,
    query_count: u64,
    total_query_time: Duration,
    max_lifetime: Duration,
}

impl PooledConnection {
    pub fn new(id: ConnectionId, native: Box<dyn NativeConnection>, max_lifetime: Duration) -> Self {
        let now = Instant::now();
        Self {
            id,
            native: Arc::new(AsyncMutex::new(Some(native))),
            state: ConnectionState::Idle,
            created_at: now,
            created_wall: Utc::now(),
            last_used: now,
            last_validated: now,
            in_transaction: false,
            query_count: 0,
            total_query_time: Duration::ZERO,
            max_lifetime,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Mark the connection in use
    ///
    /// Refuses a connection that still carries an open transaction.
    pub fn acquire(&mut self) -> Result<(), PoolError> {
        if self.in_transaction {
            return Err(PoolError::TransactionAlreadyOpen(self.id));
        }
        self.state = ConnectionState::InUse;
        self.last_used = Instant::now();
        Ok(())
    }

    /// Return the connection to idle, rolling back a transaction left open
    ///
    /// A failed rollback is returned so the pool can discard the connection.
    /// A transaction on a connection closed by a drain ended with it.
    pub async fn release(&mut self) -> Result<(), PoolError> {
        if self.in_transaction {
            let mut native = self.native.lock().await;
            if let Some(native) = native.as_mut() {
                debug!(connection_id = self.id, "Rolling back transaction left open at release");
                if let Err(e) = native.rollback().await {
                    warn!(connection_id = self.id, error = %e, "Rollback during release failed");
                    return Err(PoolError::RollbackFailed {
                        connection_id: self.id,
                        source: e,
                    });
                }
            }
            drop(native);
            self.in_transaction = false;
        }
        self.mark_idle();
        Ok(())
    }

    /// Return to idle without touching the native connection
    pub(crate) fn mark_idle(&mut self) {
        self.state = ConnectionState::Idle;
        self.last_used = Instant::now();
    }

    /// Cheap liveness check; refreshes the validation timestamp on success
    pub async fn ping(&mut self) -> Result<(), DriverError> {
        self.native
            .lock()
            .await
            .as_mut()
            .ok_or_else(closed_error)?
            .ping()
            .await?;
        self.last_validated = Instant::now();
        Ok(())
    }

    pub async fn query(&mut self, statement: &Statement, params: &[Value]) -> Result<Vec<Row>, DriverError> {
        let mut native = self.native.lock().await;
        native.as_mut().ok_or_else(closed_error)?.query(statement, params).await
    }

    pub async fn execute(&mut self, statement: &Statement, params: &[Value]) -> Result<u64, DriverError> {
        let mut native = self.native.lock().await;
        native.as_mut().ok_or_else(closed_error)?.execute(statement, params).await
    }

    /// Start a transaction on the native connection and mark it open
    pub async fn begin(&mut self) -> Result<(), DriverError> {
        self.native.lock().await.as_mut().ok_or_else(closed_error)?.begin().await?;
        self.in_transaction = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<(), DriverError> {
        self.native.lock().await.as_mut().ok_or_else(closed_error)?.commit().await?;
        self.in_transaction = false;
        Ok(())
    }

    /// Roll back; the transaction stays marked open if this fails
    pub async fn rollback(&mut self) -> Result<(), DriverError> {
        self.native.lock().await.as_mut().ok_or_else(closed_error)?.rollback().await?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        self.state == ConnectionState::Idle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Time since the connection was last handed out or returned
    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// True once the connection has outlived its maximum lifetime
    pub fn should_refresh(&self) -> bool {
        self.age() > self.max_lifetime
    }

    pub fn since_last_validation(&self) -> Duration {
        self.last_validated.elapsed()
    }

    pub fn record_query(&mut self, duration: Duration) {
        self.query_count += 1;
        self.total_query_time += duration;
        self.last_used = Instant::now();
    }

    pub fn query_count(&self) -> u64 {
        self.query_count
    }

    pub fn total_query_time(&self) -> Duration {
        self.total_query_time
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn native_slot(&self) -> NativeSlot {
        Arc::clone(&self.native)
    }

    /// False once a drain has closed the native connection
    ///
    /// A slot locked by a running statement counts as open.
    pub fn is_open(&self) -> bool {
        self.native.try_lock().map_or(true, |native| native.is_some())
    }

    /// Close the native connection
    ///
    /// Returns `false` when a drain already closed it.
    pub async fn close(self) -> Result<bool, DriverError> {
        let native = self.native.lock().await.take();
        match native {
            Some(native) => native.close().await.map(|()| true),
            None => Ok(false),
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            state: self.state,
            created_at: self.created_wall,
            age: self.age(),
            idle_time: self.idle_time(),
            since_validation: self.since_last_validation(),
            in_transaction: self.in_transaction,
            query_count: self.query_count,
            total_query_time: self.total_query_time,
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("in_transaction", &self.in_transaction)
            .field("query_count", &self.query_count)
            .finish()
    }
}
