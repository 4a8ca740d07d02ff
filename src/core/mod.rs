use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::PoolConfig;
use crate::driver::{Connector, SqlxConnector};
use crate::pool::DatabasePool;

/// Loaded configuration plus the pool built from it
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone, Debug)]
pub struct Core {
    pub config: Arc<PoolConfig>,
    pub pool: DatabasePool,
}

impl Core {
    /// Build the pool with the sqlx driver
    pub async fn new(config: PoolConfig) -> Result<Self> {
        Self::with_connector(config, SqlxConnector::new()).await
    }

    /// Build the pool over any connector
    pub async fn with_connector<C: Connector>(config: PoolConfig, connector: C) -> Result<Self> {
        let pool = DatabasePool::new(config.clone(), connector)
            .await
            .context("Failed to create database pool")?;

        Ok(Self {
            config: Arc::new(config),
            pool,
        })
    }
}
