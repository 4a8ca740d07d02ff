//! Integration tests for the connection pool and circuit breaker
//!
//! These run the pool against the in-process mock driver so failures can
//! be scripted and observed from the outside.

use dbpool::driver::{DriverError, DriverErrorKind, DriverKind, MockConnector, Value};
use dbpool::pool::{CircuitBreakerConfig, QueryLimits, RetryPolicy};
use dbpool::{DatabasePool, PoolConfig, PoolError};
use std::time::Duration;

fn config(min: usize, max: usize) -> PoolConfig {
    PoolConfig::new(DriverKind::Sqlite, ":memory:")
        .with_pool_size(min, max)
        .with_wait_timeout_ms(100)
        .with_retry(RetryPolicy::new(0, 1, 1))
}

fn breaker(failure_threshold: u32, recovery_time_ms: u64, half_open_successes: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        recovery_time_ms,
        half_open_successes,
    }
}

async fn pool_with(config: PoolConfig) -> (DatabasePool, MockConnector) {
    let mock = MockConnector::new();
    let pool = DatabasePool::new(config, mock.clone()).await.unwrap();
    (pool, mock)
}

#[tokio::test]
async fn test_circuit_opens_after_connection_failures() {
    let (pool, mock) = pool_with(config(0, 4).with_circuit_breaker(breaker(3, 60_000, 1))).await;
    mock.controls().fail_connects(10, DriverError::connection("connection refused"));

    for _ in 0..3 {
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Driver(ref e) if e.kind == DriverErrorKind::Connection));
    }
    assert_eq!(pool.circuit_breaker().state().name(), "Open");

    // Rejected without another connection attempt
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::CircuitOpen { failure_count: 3, .. }));
    assert!(err.is_admission());

    let stats = pool.get_stats();
    assert_eq!(stats.metrics.connection_failures, 3);
    assert_eq!(stats.circuit.total_rejected, 1);
    assert!(!pool.get_health_summary().healthy);
}

#[tokio::test]
async fn test_open_circuit_never_hands_out_connections() {
    let (pool, mock) = pool_with(config(2, 4).with_circuit_breaker(breaker(1, 60_000, 1))).await;
    assert_eq!(pool.get_stats().idle, 2);

    pool.circuit_breaker().record_failure();
    for _ in 0..5 {
        assert!(matches!(pool.acquire().await, Err(PoolError::CircuitOpen { .. })));
        assert!(matches!(pool.query("SELECT 1", &[]).await, Err(PoolError::CircuitOpen { .. })));
    }
    assert_eq!(mock.controls().queries(), 0);
    assert_eq!(pool.get_stats().in_use, 0);
}

#[tokio::test]
async fn test_half_open_trials_close_circuit() {
    let (pool, mock) = pool_with(config(0, 4).with_circuit_breaker(breaker(2, 50, 2))).await;
    mock.controls().fail_connects(2, DriverError::connection("connection refused"));

    assert!(pool.acquire().await.is_err());
    assert!(pool.acquire().await.is_err());
    assert!(pool.circuit_breaker().state().is_open());

    tokio::time::sleep(Duration::from_millis(70)).await;

    let first = pool.acquire().await.unwrap();
    assert_eq!(pool.circuit_breaker().state().name(), "HalfOpen");
    let second = pool.acquire().await.unwrap();
    assert_eq!(pool.circuit_breaker().state().name(), "Closed");

    first.release().await.unwrap();
    second.release().await.unwrap();
    assert!(pool.get_health_summary().healthy);
}

#[tokio::test]
async fn test_half_open_failure_reopens_circuit() {
    let (pool, mock) = pool_with(config(0, 4).with_circuit_breaker(breaker(1, 50, 1))).await;
    mock.controls().fail_next_connect(DriverError::connection("connection refused"));
    assert!(pool.acquire().await.is_err());
    assert!(pool.circuit_breaker().state().is_open());

    tokio::time::sleep(Duration::from_millis(70)).await;
    mock.controls().fail_next_connect(DriverError::connection("connection refused"));
    assert!(matches!(pool.acquire().await, Err(PoolError::Driver(_))));

    // Back to open with a fresh recovery window
    assert!(matches!(pool.acquire().await, Err(PoolError::CircuitOpen { .. })));
    assert_eq!(pool.get_stats().circuit.open_count, 2);
}

#[tokio::test]
async fn test_idle_connections_reused_lifo() {
    let (pool, _mock) = pool_with(config(0, 2)).await;

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let (a_id, b_id) = (a.id(), b.id());
    assert_ne!(a_id, b_id);

    pool.release(a).await.unwrap();
    pool.release(b).await.unwrap();

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!(first.id(), b_id);
    assert_eq!(second.id(), a_id);

    let stats = pool.get_stats();
    assert_eq!(stats.metrics.pool_misses, 2);
    assert_eq!(stats.metrics.pool_hits, 2);
}

#[tokio::test]
async fn test_exhausted_pool_times_out() {
    let (pool, mock) = pool_with(config(0, 1)).await;
    let _held = pool.acquire().await.unwrap();

    let err = pool.acquire().await.unwrap_err();
    match err {
        PoolError::PoolExhausted {
            max_connections,
            wait_timeout,
        } => {
            assert_eq!(max_connections, 1);
            assert_eq!(wait_timeout, Duration::from_millis(100));
        }
        other => panic!("expected PoolExhausted, got {:?}", other),
    }

    assert_eq!(mock.controls().opened(), 1);
    assert_eq!(pool.get_stats().metrics.wait_timeouts, 1);
    // Exhaustion is a capacity problem, not a database failure
    assert_eq!(pool.circuit_breaker().state().name(), "Closed");
}

#[tokio::test]
async fn test_waiter_gets_released_connection() {
    let (pool, mock) = pool_with(config(0, 1).with_wait_timeout_ms(2_000)).await;
    let held = pool.acquire().await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|lease| lease.id()) })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    held.release().await.unwrap();

    let id = waiter.await.unwrap().unwrap();
    assert_eq!(id, held_id);
    assert_eq!(mock.controls().opened(), 1);
}

#[tokio::test]
async fn test_concurrent_queries_stay_within_max() {
    let (pool, mock) = pool_with(config(1, 3).with_wait_timeout_ms(2_000)).await;
    mock.controls().set_query_latency(Duration::from_millis(10));

    let mut handles = Vec::new();
    for i in 0..12 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.query("SELECT * FROM users WHERE id = ?", &[Value::Int(i)]).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().len(), 1);
    }

    assert!(mock.controls().opened() <= 3);
    let stats = pool.get_stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.metrics.queries, 12);
}

#[tokio::test]
async fn test_parameter_limit_rejects_before_connecting() {
    let limits = QueryLimits {
        max_parameters: 2,
        ..QueryLimits::default()
    };
    let (pool, mock) = pool_with(config(0, 2).with_limits(limits)).await;

    let params = [Value::Int(1), Value::Int(2), Value::Int(3)];
    let err = pool
        .query("SELECT * FROM t WHERE a = ? AND b = ? AND c = ?", &params)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::TooManyParameters { count: 3, max: 2 }));

    let stats = pool.get_stats();
    assert_eq!(stats.metrics.connections_created, 0);
    assert_eq!(stats.metrics.dos_blocked, 1);
    assert_eq!(mock.controls().queries(), 0);
    assert_eq!(stats.circuit.total_requests, 0);
}

#[tokio::test]
async fn test_oversized_query_rejected() {
    let limits = QueryLimits {
        max_query_bytes: 32,
        ..QueryLimits::default()
    };
    let (pool, _mock) = pool_with(config(1, 2).with_limits(limits)).await;

    let sql = format!("SELECT * FROM t WHERE name = '{}'", "x".repeat(64));
    let err = pool.execute(&sql, &[]).await.unwrap_err();
    assert!(matches!(err, PoolError::QueryTooLarge { max: 32, .. }));
    assert!(err.is_validation());
    assert_eq!(pool.get_stats().metrics.dos_blocked, 1);
}

#[tokio::test]
async fn test_drain_closes_everything() {
    let (pool, mock) = pool_with(config(2, 4)).await;
    pool.query("SELECT 1", &[]).await.unwrap();

    assert!(pool.drain(Duration::from_millis(100)).await);
    assert_eq!(mock.controls().live(), 0);

    let stats = pool.get_stats();
    assert_eq!(stats.size, 0);
    assert_eq!(stats.statement_cache_size, 0);

    // Stays closed to new work until reset
    assert!(matches!(pool.acquire().await, Err(PoolError::CircuitOpen { .. })));
    pool.reset_circuit_breaker();
    pool.query("SELECT 1", &[]).await.unwrap();
}

#[tokio::test]
async fn test_drain_timeout_force_closes_leases() {
    let (pool, mock) = pool_with(config(1, 2)).await;
    let mut held = pool.acquire().await.unwrap();

    assert!(!pool.drain(Duration::from_millis(30)).await);
    let stats = pool.get_stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.size, 0);
    assert_eq!(mock.controls().live(), 0);

    // The lease outlived the drain but its connection did not
    let err = held.query("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, PoolError::Driver(ref e) if e.kind == DriverErrorKind::Closed));
    assert_eq!(mock.controls().queries(), 0);

    held.release().await.unwrap();
    assert_eq!(mock.controls().closed(), 1);
    assert_eq!(pool.get_stats().metrics.connections_closed, 1);
}

#[tokio::test]
async fn test_drain_fails_waiters_without_opening_connections() {
    let (pool, mock) = pool_with(config(0, 1).with_wait_timeout_ms(5_000)).await;
    let held = pool.acquire().await.unwrap();

    let waiting = pool.clone();
    let waiter = tokio::spawn(async move { waiting.acquire().await.map(|lease| lease.id()) });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(!pool.drain(Duration::from_millis(30)).await);
    held.release().await.unwrap();

    // Fails at drain time rather than at the end of its wait
    let result = tokio::time::timeout(Duration::from_millis(500), waiter)
        .await
        .expect("waiter still blocked after drain")
        .unwrap();
    assert!(matches!(result, Err(PoolError::CircuitOpen { .. })));
    assert_eq!(mock.controls().opened(), 1);
    assert_eq!(mock.controls().live(), 0);
    assert_eq!(pool.circuit_breaker().state().name(), "Open");
}

#[tokio::test]
async fn test_failed_rollback_evicts_connection() {
    let (pool, mock) = pool_with(config(0, 2)).await;

    let lease = pool.begin_transaction().await.unwrap();
    let id = lease.id();
    mock.controls().fail_rollbacks(true);

    let err = pool.rollback(lease).await.unwrap_err();
    assert!(matches!(err, PoolError::RollbackFailed { connection_id, .. } if connection_id == id));

    let stats = pool.get_stats();
    assert_eq!(stats.size, 0);
    assert_eq!(stats.metrics.rollback_failures, 1);
    assert_eq!(stats.metrics.evictions, 1);

    mock.controls().fail_rollbacks(false);
    let next = pool.acquire().await.unwrap();
    assert_ne!(next.id(), id);
}

#[tokio::test]
async fn test_release_rolls_back_open_transaction() {
    let (pool, mock) = pool_with(config(0, 1)).await;

    let mut lease = pool.begin_transaction().await.unwrap();
    lease.execute("UPDATE accounts SET balance = 0", &[]).await.unwrap();
    let id = lease.id();
    lease.release().await.unwrap();

    assert_eq!(mock.controls().rollbacks(), 1);
    let lease = pool.acquire().await.unwrap();
    assert_eq!(lease.id(), id);
    assert!(!lease.in_transaction());
}

#[tokio::test]
async fn test_transaction_state_errors() {
    let (pool, _mock) = pool_with(config(0, 1)).await;
    let mut lease = pool.acquire().await.unwrap();

    assert!(matches!(lease.commit().await, Err(PoolError::NoActiveTransaction(_))));
    lease.begin().await.unwrap();
    assert!(matches!(lease.begin().await, Err(PoolError::TransactionAlreadyOpen(_))));
    pool.commit(lease).await.unwrap();
    assert_eq!(pool.get_stats().metrics.transactions_committed, 1);
}

#[tokio::test]
async fn test_transaction_helper_commits() {
    let (pool, mock) = pool_with(config(0, 1)).await;
    mock.controls().set_affected_rows(2);

    let affected = pool
        .transaction(|tx| {
            Box::pin(async move {
                let a = tx.execute("UPDATE accounts SET balance = balance - ? WHERE id = ?", &[Value::Int(10), Value::Int(1)]).await?;
                let b = tx.execute("UPDATE accounts SET balance = balance + ? WHERE id = ?", &[Value::Int(10), Value::Int(2)]).await?;
                Ok(a + b)
            })
        })
        .await
        .unwrap();

    assert_eq!(affected, 4);
    assert_eq!(mock.controls().commits(), 1);
    assert_eq!(mock.controls().rollbacks(), 0);
    assert_eq!(pool.get_stats().idle, 1);
}

#[tokio::test]
async fn test_transaction_helper_rolls_back_on_error() {
    let (pool, mock) = pool_with(config(0, 1)).await;

    let result: Result<(), PoolError> = pool
        .transaction(|tx| {
            Box::pin(async move {
                tx.execute("DELETE FROM sessions", &[]).await?;
                Err(PoolError::Driver(DriverError::query("constraint violated")))
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(mock.controls().rollbacks(), 1);
    assert_eq!(mock.controls().commits(), 0);

    let stats = pool.get_stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.metrics.transactions_rolled_back, 1);
}

#[tokio::test]
async fn test_connect_retries_transient_failures() {
    let (pool, mock) = pool_with(config(0, 2).with_retry(RetryPolicy::new(2, 1, 2))).await;
    mock.controls().fail_connects(2, DriverError::connection("connection reset"));

    let lease = pool.acquire().await.unwrap();
    lease.release().await.unwrap();

    let stats = pool.get_stats();
    assert_eq!(stats.metrics.connection_failures, 2);
    assert_eq!(stats.metrics.connections_created, 1);
    assert_eq!(stats.circuit.state, "Closed");
    assert_eq!(stats.circuit.failure_count, 0);
}

#[tokio::test]
async fn test_authentication_failure_not_retried() {
    let (pool, mock) = pool_with(config(0, 2).with_retry(RetryPolicy::new(3, 1, 2))).await;
    mock.controls().fail_connects(4, DriverError::authentication("Access denied for user 'app'"));

    let err = pool.acquire().await.unwrap_err();
    assert!(err.driver_error().is_some_and(DriverError::is_authentication));
    assert!(!err.is_retryable());
    assert_eq!(pool.get_stats().metrics.connection_failures, 1);
}

#[tokio::test]
async fn test_query_failures_feed_breaker() {
    let (pool, mock) = pool_with(config(1, 2).with_circuit_breaker(breaker(2, 60_000, 1))).await;
    mock.controls().fail_queries(true);

    // A successful checkout resets the failure streak, so fail twice on one lease
    let mut lease = pool.acquire().await.unwrap();
    for _ in 0..2 {
        let err = lease.query("SELECT * FROM missing", &[]).await.unwrap_err();
        assert!(matches!(err, PoolError::Driver(ref e) if e.kind == DriverErrorKind::Query));
    }
    lease.release().await.unwrap();

    assert!(matches!(pool.query("SELECT 1", &[]).await, Err(PoolError::CircuitOpen { .. })));
    let health = pool.get_health_summary();
    assert!(!health.healthy);
    assert_eq!(health.circuit_state, "Open");
    assert_eq!(pool.get_stats().metrics.failed_queries, 2);
}

#[tokio::test]
async fn test_checkout_resets_query_failure_streak() {
    let (pool, mock) = pool_with(config(1, 2).with_circuit_breaker(breaker(2, 60_000, 1))).await;
    mock.controls().fail_queries(true);

    for _ in 0..5 {
        assert!(matches!(pool.query("SELECT 1", &[]).await, Err(PoolError::Driver(_))));
    }
    assert!(pool.circuit_breaker().is_healthy());
    assert_eq!(pool.circuit_breaker().failure_count(), 1);
    assert_eq!(pool.get_stats().metrics.failed_queries, 5);
}

#[tokio::test]
async fn test_statement_shape_checked_before_connecting() {
    let (pool, mock) = pool_with(config(0, 2)).await;

    let err = pool
        .query("SELECT * FROM users WHERE id = ? AND org_id = ?", &[Value::Int(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ParameterMismatch { expected: 2, supplied: 1 }));
    assert!(err.is_validation());

    let err = pool.execute("BEGIN", &[]).await.unwrap_err();
    assert!(matches!(err, PoolError::TransactionControl(_)));

    assert_eq!(mock.controls().opened(), 0);
    assert_eq!(pool.get_stats().circuit.total_requests, 0);

    // Savepoints stay available inside a pool transaction; ending it does not
    let mut tx = pool.begin_transaction().await.unwrap();
    tx.execute("SAVEPOINT before_cleanup", &[]).await.unwrap();
    assert!(matches!(tx.execute("COMMIT", &[]).await, Err(PoolError::TransactionControl(_))));
    assert!(tx.in_transaction());
    pool.commit(tx).await.unwrap();
    assert_eq!(mock.controls().commits(), 1);
}

#[tokio::test]
async fn test_statement_cache_stats() {
    let (pool, _mock) = pool_with(config(1, 2)).await;

    pool.query("SELECT id FROM users WHERE email = ?", &[Value::from("a@example.com")]).await.unwrap();
    pool.query("  SELECT id FROM users WHERE email = ?  ", &[Value::from("b@example.com")]).await.unwrap();
    pool.execute("DELETE FROM sessions WHERE user_id = ?", &[Value::Int(1)]).await.unwrap();

    let stats = pool.get_stats();
    assert_eq!(stats.statement_cache_size, 2);
    assert_eq!(stats.statement_cache_hits, 1);
    assert_eq!(stats.statement_cache_misses, 2);
}

#[tokio::test]
async fn test_failed_ping_evicts_before_handout() {
    let config = config(1, 2).with_validation(dbpool::config::ValidationPolicy::Always);
    let (pool, mock) = pool_with(config).await;
    let warm_id = pool.connections()[0].id;

    mock.controls().fail_pings(true);
    let lease = pool.acquire().await.unwrap();
    assert_ne!(lease.id(), warm_id);
    assert_eq!(pool.get_stats().metrics.evictions, 1);
}

#[tokio::test]
async fn test_stats_track_leases() {
    let (pool, _mock) = pool_with(config(2, 4)).await;

    let lease = pool.acquire().await.unwrap();
    let stats = pool.get_stats();
    assert_eq!(stats.driver, "sqlite");
    assert_eq!(stats.size, 2);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.in_use, 1);
    assert!((stats.utilization() - 25.0).abs() < f64::EPSILON);

    drop(lease);
    assert_eq!(pool.get_stats().in_use, 0);
}
