//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - A bounded, LIFO database connection pool with leased connections
//! - Circuit breaker pattern for fault tolerance
//! - Retry with exponential backoff for connection attempts
//! - LRU statement cache and per-query DoS limits
//! - Pool metrics, stats snapshots and health summaries

pub mod backoff;
pub mod circuit;
pub mod connection;
pub mod database;
pub mod error;
pub mod metrics;
pub mod statement;

pub use backoff::RetryPolicy;
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats};
pub use connection::{ConnectionId, ConnectionInfo, ConnectionState, PooledConnection};
pub use database::{DatabasePool, Lease};
pub use error::PoolError;
pub use metrics::{HealthSummary, MetricsSnapshot, PoolMetrics, PoolStats};
pub use statement::{QueryLimits, QueryViolation, Statement, StatementCache, StatementKind};
