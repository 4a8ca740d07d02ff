//! dbpool - Database connection pool with circuit breaker, retry and statement caching

pub mod cli;
pub mod config;
pub mod core;
pub mod driver;
pub mod pool;

pub use crate::core::Core;
pub use config::PoolConfig;
pub use driver::{Row, Value};
pub use pool::{DatabasePool, Lease, PoolError};
