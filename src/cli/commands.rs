use anyhow::{Context, Result};
use std::io::Write;
use std::time::{Duration, Instant};

use crate::core::Core;
use crate::driver::{Row, Value};
use crate::pool::HealthSummary;

/// Print a value as pretty JSON to stdout
fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value).context("Failed to serialize output")?;
    writeln!(out)?;
    Ok(())
}

fn print_health(health: &HealthSummary) {
    println!("Healthy: {}", if health.healthy { "yes" } else { "no" });
    println!("Circuit: {}", health.circuit_state);
    println!(
        "Utilization: {:.1}% ({}/{})",
        health.utilization, health.in_use, health.max_connections
    );
    println!("Error rate: {:.2}%", health.error_rate * 100.0);
}

/// Check command - run a trivial query and report pool health
pub async fn cmd_check(core: &Core) -> Result<()> {
    let started = Instant::now();
    let rows: Vec<Row> = core
        .pool
        .query("SELECT 1", &[])
        .await
        .context("Connectivity check failed")?;

    println!(
        "Connected to {} database '{}' in {} ms",
        core.config.driver,
        core.config.database,
        started.elapsed().as_millis()
    );
    if rows.is_empty() {
        println!("Warning: ping query returned no rows");
    }
    print_health(&core.pool.get_health_summary());
    Ok(())
}

/// Query command - run a statement and print its rows as JSON
pub async fn cmd_query(core: &Core, sql: &str, params: &[Value]) -> Result<()> {
    let rows = core.pool.query(sql, params).await?;
    print_json(&rows)?;
    eprintln!("{} row(s)", rows.len());
    Ok(())
}

/// Exec command - run a statement and print the affected row count
pub async fn cmd_exec(core: &Core, sql: &str, params: &[Value]) -> Result<()> {
    let affected = core.pool.execute(sql, params).await?;
    println!("{} row(s) affected", affected);
    Ok(())
}

/// Stats command - print the pool statistics snapshot
pub async fn cmd_stats(core: &Core, connections: bool) -> Result<()> {
    if connections {
        print_json(&core.pool.connections())?;
    } else {
        print_json(&core.pool.get_stats())?;
    }
    Ok(())
}

/// Drain command - stop admitting work and close every connection
pub async fn cmd_drain(core: &Core, timeout_ms: u64) -> Result<()> {
    let graceful = core.pool.drain(Duration::from_millis(timeout_ms)).await;
    let stats = core.pool.get_stats();

    if graceful {
        println!("Pool drained ({} connection(s) closed)", stats.metrics.connections_closed);
        Ok(())
    } else {
        anyhow::bail!(
            "Drain timed out after {} ms with {} connection(s) still in use",
            timeout_ms,
            stats.in_use
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::driver::{DriverKind, MockConnector};

    async fn mock_core() -> (Core, MockConnector) {
        let mock = MockConnector::new();
        let config = PoolConfig::new(DriverKind::Sqlite, ":memory:").with_pool_size(1, 2);
        let core = Core::with_connector(config, mock.clone()).await.unwrap();
        (core, mock)
    }

    #[tokio::test]
    async fn test_cmd_check_and_exec() {
        let (core, mock) = mock_core().await;
        cmd_check(&core).await.unwrap();

        mock.controls().set_affected_rows(3);
        cmd_exec(&core, "DELETE FROM sessions WHERE expired = ?", &[Value::Bool(true)])
            .await
            .unwrap();
        assert_eq!(mock.controls().queries(), 2);
    }

    #[tokio::test]
    async fn test_cmd_drain_reports_graceful() {
        let (core, mock) = mock_core().await;
        cmd_drain(&core, 100).await.unwrap();
        assert_eq!(mock.controls().live(), 0);
    }

    #[tokio::test]
    async fn test_cmd_drain_fails_when_connection_held() {
        let (core, _mock) = mock_core().await;
        let _held = core.pool.acquire().await.unwrap();
        assert!(cmd_drain(&core, 30).await.is_err());
    }
}
