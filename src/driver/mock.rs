//! Scriptable in-process driver
//!
//! Every connection shares one [`MockControls`] handle, so a test can flip
//! failure switches after the pool has been built and read back counters.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Connector, DriverError, NativeConnection, Row, Value};
use crate::config::PoolConfig;
use crate::pool::Statement;

#[derive(Debug, Default)]
struct MockState {
    connect_failures: Mutex<VecDeque<DriverError>>,
    fail_pings: AtomicBool,
    fail_rollbacks: AtomicBool,
    fail_queries: AtomicBool,
    rows: Mutex<Option<Vec<Row>>>,
    affected_rows: AtomicU64,
    query_latency_ms: AtomicU64,

    next_serial: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    queries: AtomicU64,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Shared switches and counters for every connection a [`MockConnector`] opens
#[derive(Debug, Clone, Default)]
pub struct MockControls {
    state: Arc<MockState>,
}

impl MockControls {
    /// Fail the next connect attempt with `error`
    pub fn fail_next_connect(&self, error: DriverError) {
        self.state.connect_failures.lock().push_back(error);
    }

    /// Fail the next `count` connect attempts with `error`
    pub fn fail_connects(&self, count: usize, error: DriverError) {
        let mut queue = self.state.connect_failures.lock();
        queue.extend(std::iter::repeat(error).take(count));
    }

    pub fn fail_pings(&self, fail: bool) {
        self.state.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn fail_rollbacks(&self, fail: bool) {
        self.state.fail_rollbacks.store(fail, Ordering::SeqCst);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.state.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Rows returned by every query; by default a query returns one row
    /// naming the serving connection
    pub fn set_rows(&self, rows: Vec<Row>) {
        *self.state.rows.lock() = Some(rows);
    }

    pub fn set_affected_rows(&self, affected: u64) {
        self.state.affected_rows.store(affected, Ordering::SeqCst);
    }

    pub fn set_query_latency(&self, latency: Duration) {
        self.state
            .query_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn opened(&self) -> u64 {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet closed
    pub fn live(&self) -> u64 {
        self.opened().saturating_sub(self.closed())
    }

    pub fn queries(&self) -> u64 {
        self.state.queries.load(Ordering::SeqCst)
    }

    pub fn begins(&self) -> u64 {
        self.state.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.state.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u64 {
        self.state.rollbacks.load(Ordering::SeqCst)
    }
}

/// Connector that hands out [`MockConnection`]s
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    controls: MockControls,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controls(&self) -> MockControls {
        self.controls.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _config: &PoolConfig) -> Result<Box<dyn NativeConnection>, DriverError> {
        let failure = self.controls.state.connect_failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let state = &self.controls.state;
        let serial = state.next_serial.fetch_add(1, Ordering::SeqCst) + 1;
        state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            serial,
            controls: self.controls.clone(),
            in_transaction: false,
            closed: false,
        }))
    }
}

/// One fake physical connection
#[derive(Debug)]
pub struct MockConnection {
    serial: u64,
    controls: MockControls,
    in_transaction: bool,
    closed: bool,
}

impl MockConnection {
    fn state(&self) -> &MockState {
        &self.controls.state
    }

    async fn run(&self) -> Result<(), DriverError> {
        let latency = self.state().query_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.state().queries.fetch_add(1, Ordering::SeqCst);
        if self.state().fail_queries.load(Ordering::SeqCst) {
            return Err(DriverError::query("mock query failure").with_code("HY000"));
        }
        Ok(())
    }
}

#[async_trait]
impl NativeConnection for MockConnection {
    async fn ping(&mut self) -> Result<(), DriverError> {
        if self.state().fail_pings.load(Ordering::SeqCst) {
            return Err(DriverError::connection("server has gone away"));
        }
        Ok(())
    }

    async fn query(&mut self, _statement: &Statement, _params: &[Value]) -> Result<Vec<Row>, DriverError> {
        self.run().await?;
        let rows = self.state().rows.lock().clone();
        Ok(rows.unwrap_or_else(|| {
            vec![std::iter::once(("connection", Value::Int(self.serial as i64))).collect()]
        }))
    }

    async fn execute(&mut self, _statement: &Statement, _params: &[Value]) -> Result<u64, DriverError> {
        self.run().await?;
        Ok(self.state().affected_rows.load(Ordering::SeqCst))
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        if self.in_transaction {
            return Err(DriverError::transaction("transaction already active"));
        }
        self.state().begins.fetch_add(1, Ordering::SeqCst);
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        if !self.in_transaction {
            return Err(DriverError::transaction("no active transaction"));
        }
        self.state().commits.fetch_add(1, Ordering::SeqCst);
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.state().rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.state().fail_rollbacks.load(Ordering::SeqCst) {
            return Err(DriverError::transaction("rollback failed: connection lost"));
        }
        self.in_transaction = false;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), DriverError> {
        self.closed = true;
        self.state().closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        // A handle dropped without close() still counts as closed
        if !self.closed {
            self.state().closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
