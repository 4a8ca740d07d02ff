//! Example demonstrating the database pool and its circuit breaker
//!
//! This example shows how to:
//! 1. Configure a pool against an in-memory SQLite database
//! 2. Run queries, statements and a transaction
//! 3. Watch the circuit breaker trip on a failing backend (mock driver)
//! 4. Monitor pool statistics and drain on shutdown
//!
//! Run with `cargo run --example pool_usage`.

use dbpool::driver::{DriverError, DriverKind, MockConnector, Value};
use dbpool::pool::{CircuitBreakerConfig, RetryPolicy};
use dbpool::{DatabasePool, PoolConfig, PoolError};
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    sqlite_walkthrough().await?;
    breaker_walkthrough().await?;
    Ok(())
}

async fn sqlite_walkthrough() -> Result<(), PoolError> {
    // In-memory databases are per connection, so keep a single one
    let config = PoolConfig::new(DriverKind::Sqlite, ":memory:").with_pool_size(1, 1);
    let pool = DatabasePool::connect(config).await?;

    pool.execute(
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL, balance INTEGER NOT NULL)",
        &[],
    )
    .await?;
    pool.execute(
        "INSERT INTO accounts (owner, balance) VALUES (?, ?), (?, ?)",
        &[Value::from("alice"), Value::Int(100), Value::from("bob"), Value::Int(20)],
    )
    .await?;

    // Move funds atomically
    pool.transaction(|tx| {
        Box::pin(async move {
            tx.execute("UPDATE accounts SET balance = balance - ? WHERE owner = ?", &[Value::Int(30), Value::from("alice")])
                .await?;
            tx.execute("UPDATE accounts SET balance = balance + ? WHERE owner = ?", &[Value::Int(30), Value::from("bob")])
                .await?;
            Ok(())
        })
    })
    .await?;

    for row in pool.query("SELECT owner, balance FROM accounts ORDER BY id", &[]).await? {
        info!(owner = ?row.get("owner"), balance = ?row.get("balance"), "Account");
    }

    let stats = pool.get_stats();
    info!(
        queries = stats.metrics.queries,
        cache_hits = stats.statement_cache_hits,
        committed = stats.metrics.transactions_committed,
        "SQLite pool stats"
    );

    pool.drain(Duration::from_secs(1)).await;
    Ok(())
}

async fn breaker_walkthrough() -> Result<(), PoolError> {
    let mock = MockConnector::new();
    let config = PoolConfig::new(DriverKind::Mysql, "admin")
        .with_host("db.internal", None)
        .with_pool_size(0, 4)
        .with_retry(RetryPolicy::new(1, 10, 50))
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_time_ms: 200,
            half_open_successes: 1,
        });
    let pool = DatabasePool::new(config, mock.clone()).await?;

    // The backend refuses connections for a while
    mock.controls().fail_connects(3, DriverError::connection("connection refused"));

    for i in 0..4 {
        match pool.query("SELECT 1", &[]).await {
            Ok(_) => info!(request = i, "Request succeeded"),
            Err(e) if e.is_admission() => warn!(request = i, error = %e, "Rejected without touching the database"),
            Err(e) => warn!(request = i, error = %e, "Request failed"),
        }
    }

    info!(state = pool.circuit_breaker().state().name(), "Waiting for recovery window");
    tokio::time::sleep(Duration::from_millis(250)).await;

    // First request after recovery is the half-open trial
    pool.query("SELECT 1", &[]).await?;
    let health = pool.get_health_summary();
    info!(
        healthy = health.healthy,
        circuit = health.circuit_state,
        error_rate = health.error_rate,
        "Recovered"
    );

    if let Ok(json) = serde_json::to_string_pretty(&pool.get_stats()) {
        println!("{}", json);
    }
    Ok(())
}
