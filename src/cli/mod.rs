//! CLI module for dbpool
//!
//! Operational commands that run against a configured pool:
//!
//! ```bash
//! # Warm up, ping and report health
//! dbpool --config pool.yaml check
//!
//! # Run a query, rows printed as JSON
//! dbpool query "SELECT id, email FROM users WHERE id = ?" --param 42
//!
//! # Run a statement
//! dbpool exec "UPDATE users SET active = ? WHERE id = ?" --param false --param 42
//!
//! # Pool statistics
//! dbpool stats
//!
//! # Graceful drain
//! dbpool drain --timeout-ms 5000
//! ```

pub mod commands;

use crate::driver::Value;

/// Convert `--param` values into statement parameters
pub fn parse_params(raw: &[String]) -> Vec<Value> {
    raw.iter().map(|p| Value::infer(p)).collect()
}
