//! Pool counters and reporting snapshots

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::circuit::CircuitStats;

/// Query error rate at or above which the pool reports unhealthy
const UNHEALTHY_ERROR_RATE: f64 = 0.10;

/// Cumulative pool counters
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub queries: AtomicU64,
    pub failed_queries: AtomicU64,
    pub slow_queries: AtomicU64,
    pub query_time_us: AtomicU64,
    pub pool_hits: AtomicU64,
    pub pool_misses: AtomicU64,
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connection_failures: AtomicU64,
    pub evictions: AtomicU64,
    pub wait_timeouts: AtomicU64,
    pub transactions_begun: AtomicU64,
    pub transactions_committed: AtomicU64,
    pub transactions_rolled_back: AtomicU64,
    pub rollback_failures: AtomicU64,
    pub dos_blocked: AtomicU64,
}

impl PoolMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self, elapsed: Duration, failed: bool, slow: bool) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.query_time_us
            .fetch_add(elapsed.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
        if failed {
            self.failed_queries.fetch_add(1, Ordering::Relaxed);
        }
        if slow {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let queries = load(&self.queries);
        let query_time_us = load(&self.query_time_us);
        MetricsSnapshot {
            queries,
            failed_queries: load(&self.failed_queries),
            slow_queries: load(&self.slow_queries),
            avg_query_ms: if queries == 0 {
                0.0
            } else {
                query_time_us as f64 / queries as f64 / 1000.0
            },
            total_query_ms: query_time_us as f64 / 1000.0,
            pool_hits: load(&self.pool_hits),
            pool_misses: load(&self.pool_misses),
            connections_created: load(&self.connections_created),
            connections_closed: load(&self.connections_closed),
            connection_failures: load(&self.connection_failures),
            evictions: load(&self.evictions),
            wait_timeouts: load(&self.wait_timeouts),
            transactions_begun: load(&self.transactions_begun),
            transactions_committed: load(&self.transactions_committed),
            transactions_rolled_back: load(&self.transactions_rolled_back),
            rollback_failures: load(&self.rollback_failures),
            dos_blocked: load(&self.dos_blocked),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub queries: u64,
    pub failed_queries: u64,
    pub slow_queries: u64,
    pub avg_query_ms: f64,
    pub total_query_ms: f64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub connections_created: u64,
    pub connections_closed: u64,
    pub connection_failures: u64,
    pub evictions: u64,
    pub wait_timeouts: u64,
    pub transactions_begun: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub rollback_failures: u64,
    pub dos_blocked: u64,
}

impl MetricsSnapshot {
    /// Failed over total queries
    pub fn error_rate(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.failed_queries as f64 / self.queries as f64
        }
    }

    /// Share of acquisitions served from an idle connection
    pub fn hit_rate(&self) -> f64 {
        let total = self.pool_hits + self.pool_misses;
        if total == 0 {
            0.0
        } else {
            self.pool_hits as f64 / total as f64
        }
    }
}

/// Structured snapshot returned by `DatabasePool::get_stats`
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub driver: &'static str,
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Connections currently being opened
    pub pending: usize,
    pub min_connections: usize,
    pub max_connections: usize,
    pub statement_cache_size: usize,
    pub statement_cache_hits: u64,
    pub statement_cache_misses: u64,
    pub metrics: MetricsSnapshot,
    pub circuit: CircuitStats,
}

impl PoolStats {
    /// Percentage of the maximum pool size currently in use
    pub fn utilization(&self) -> f64 {
        if self.max_connections == 0 {
            0.0
        } else {
            self.in_use as f64 / self.max_connections as f64 * 100.0
        }
    }

    pub fn health_summary(&self) -> HealthSummary {
        let error_rate = self.metrics.error_rate();
        HealthSummary {
            healthy: self.circuit.state != "Open" && error_rate < UNHEALTHY_ERROR_RATE,
            utilization: self.utilization(),
            error_rate,
            circuit_state: self.circuit.state,
            in_use: self.in_use,
            max_connections: self.max_connections,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub healthy: bool,
    /// In-use connections as a percentage of the maximum
    pub utilization: f64,
    /// Failed over total queries
    pub error_rate: f64,
    pub circuit_state: &'static str,
    pub in_use: usize,
    pub max_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_averages() {
        let metrics = PoolMetrics::default();
        metrics.record_query(Duration::from_millis(10), false, false);
        metrics.record_query(Duration::from_millis(30), true, true);

        let snap = metrics.snapshot();
        assert_eq!(snap.queries, 2);
        assert_eq!(snap.failed_queries, 1);
        assert_eq!(snap.slow_queries, 1);
        assert!((snap.avg_query_ms - 20.0).abs() < 0.01);
        assert!((snap.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hit_rate() {
        let metrics = PoolMetrics::default();
        PoolMetrics::incr(&metrics.pool_hits);
        PoolMetrics::incr(&metrics.pool_hits);
        PoolMetrics::incr(&metrics.pool_hits);
        PoolMetrics::incr(&metrics.pool_misses);
        assert!((metrics.snapshot().hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
