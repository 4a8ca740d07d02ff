use std::time::Duration;

use super::circuit::CircuitError;
use super::connection::ConnectionId;
use super::statement::QueryViolation;
use crate::config::ConfigError;
use crate::driver::DriverError;

/// Error types for pool operations
///
/// Admission errors (`CircuitOpen`, `PoolExhausted`) and validation errors
/// (`QueryTooLarge`, `TooManyParameters`, `ParameterMismatch`,
/// `TransactionControl`) are raised before any connection is touched.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Circuit breaker is open ({failure_count} consecutive failures), retry in {retry_in:?}")]
    CircuitOpen {
        failure_count: u32,
        retry_in: Duration,
    },

    #[error("Pool exhausted: all {max_connections} connections in use after waiting {wait_timeout:?}")]
    PoolExhausted {
        max_connections: usize,
        wait_timeout: Duration,
    },

    #[error("Query too large: {size} bytes exceeds limit of {max}")]
    QueryTooLarge { size: usize, max: usize },

    #[error("Too many parameters: {count} exceeds limit of {max}")]
    TooManyParameters { count: usize, max: usize },

    #[error("Statement expects {expected} parameters, {supplied} supplied")]
    ParameterMismatch { expected: usize, supplied: usize },

    #[error("Transaction control statement '{0}' must go through begin_transaction, commit or rollback")]
    TransactionControl(String),

    #[error("Connection {0} already has an open transaction")]
    TransactionAlreadyOpen(ConnectionId),

    #[error("Connection {0} has no open transaction")]
    NoActiveTransaction(ConnectionId),

    #[error("Rollback failed on connection {connection_id}: {source}")]
    RollbackFailed {
        connection_id: ConnectionId,
        #[source]
        source: DriverError,
    },

    #[error("Database error: {0}")]
    Driver(#[from] DriverError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl PoolError {
    /// Rejected by the breaker or pool capacity before any query ran
    pub fn is_admission(&self) -> bool {
        matches!(self, PoolError::CircuitOpen { .. } | PoolError::PoolExhausted { .. })
    }

    /// Rejected by query size or parameter limits
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PoolError::QueryTooLarge { .. }
                | PoolError::TooManyParameters { .. }
                | PoolError::ParameterMismatch { .. }
                | PoolError::TransactionControl(_)
        )
    }

    /// Whether retrying the same call later may succeed
    ///
    /// Query errors are excluded since statements may not be idempotent.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::CircuitOpen { .. } | PoolError::PoolExhausted { .. } => true,
            PoolError::Driver(e) => e.kind == crate::driver::DriverErrorKind::Connection,
            _ => false,
        }
    }

    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            PoolError::Driver(e) => Some(e),
            PoolError::RollbackFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<CircuitError> for PoolError {
    fn from(err: CircuitError) -> Self {
        match err {
            CircuitError::Open { failure_count, retry_in }
            | CircuitError::HalfOpenLimitReached { failure_count, retry_in } => {
                PoolError::CircuitOpen { failure_count, retry_in }
            }
        }
    }
}

impl From<QueryViolation> for PoolError {
    fn from(violation: QueryViolation) -> Self {
        match violation {
            QueryViolation::TooLarge { size, max } => PoolError::QueryTooLarge { size, max },
            QueryViolation::TooManyParameters { count, max } => PoolError::TooManyParameters { count, max },
        }
    }
}
