use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::driver::DriverKind;
use crate::pool::{CircuitBreakerConfig, QueryLimits, RetryPolicy};

/// Configuration rejected by [`PoolConfig::validate`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Pool sizing and connection lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Connections kept open by warm-up and never reaped below
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Hard upper bound on open connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle time after which the reaper closes a connection
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Age after which a connection is recycled
    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,

    /// How long `acquire` waits on an exhausted pool
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// Pre-create `min_connections` at construction
    #[serde(default = "default_warm_up")]
    pub warm_up: bool,
}

fn default_min_connections() -> usize {
    1
}

fn default_max_connections() -> usize {
    10
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_max_lifetime_ms() -> u64 {
    3_600_000
}

fn default_wait_timeout_ms() -> u64 {
    5_000
}

fn default_warm_up() -> bool {
    true
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_lifetime_ms: default_max_lifetime_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
            warm_up: default_warm_up(),
        }
    }
}

/// When idle connections are pinged before being handed out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Ping on every acquire
    Always,

    /// Ping when the last validation is older than the interval
    Interval {
        #[serde(default = "default_validation_interval_ms")]
        interval_ms: u64,
    },
}

fn default_validation_interval_ms() -> u64 {
    30_000
}

impl ValidationPolicy {
    /// Whether a connection last validated `since_validation` ago needs a ping
    pub fn requires_validation(&self, since_validation: Duration) -> bool {
        match self {
            ValidationPolicy::Always => true,
            ValidationPolicy::Interval { interval_ms } => {
                since_validation > Duration::from_millis(*interval_ms)
            }
        }
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        ValidationPolicy::Interval {
            interval_ms: default_validation_interval_ms(),
        }
    }
}

/// TLS negotiation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

/// TLS material for server connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(default = "default_ssl_mode")]
    pub mode: SslMode,

    /// CA bundle used to verify the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,

    /// Client certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,

    /// Client private key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

fn default_ssl_mode() -> SslMode {
    SslMode::Prefer
}

/// Per-driver session settings applied to every new connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialectConfig {
    /// Connection charset (mysql: utf8mb4, pgsql: UTF8 when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    /// pgsql `statement_timeout`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_timeout_ms: Option<u64>,

    /// pgsql `application_name`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,

    /// sqlite `busy_timeout` (5000 when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy_timeout_ms: Option<u64>,

    /// sqlite `journal_mode`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_mode: Option<String>,
}

/// Validated, immutable pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub driver: DriverKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name, or file path for sqlite (`:memory:` for in-memory)
    pub database: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing, default)]
    pub password: Option<String>,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub validation: ValidationPolicy,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub limits: QueryLimits,

    /// Prepared statement cache capacity (0 disables caching)
    #[serde(default = "default_statement_cache_size")]
    pub statement_cache_size: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<SslConfig>,

    #[serde(default)]
    pub dialect: DialectConfig,
}

fn default_statement_cache_size() -> usize {
    100
}

impl PoolConfig {
    /// Configuration with defaults for everything but the target database
    pub fn new(driver: DriverKind, database: impl Into<String>) -> Self {
        Self {
            driver,
            host: None,
            port: None,
            database: database.into(),
            username: None,
            password: None,
            pool: PoolSettings::default(),
            validation: ValidationPolicy::default(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            limits: QueryLimits::default(),
            statement_cache_size: default_statement_cache_size(),
            ssl: None,
            dialect: DialectConfig::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.host = Some(host.into());
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.pool.min_connections = min;
        self.pool.max_connections = max;
        self
    }

    pub fn with_wait_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.pool.wait_timeout_ms = timeout_ms;
        self
    }

    pub fn with_warm_up(mut self, warm_up: bool) -> Self {
        self.pool.warm_up = warm_up;
        self
    }

    pub fn with_validation(mut self, validation: ValidationPolicy) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_limits(mut self, limits: QueryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }

    /// Port to connect to, falling back to the driver default
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.driver.default_port())
    }

    /// Fail fast on settings the pool cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::Missing("database"));
        }
        if self.driver != DriverKind::Sqlite
            && self.host.as_deref().map(str::trim).unwrap_or_default().is_empty()
        {
            return Err(ConfigError::Missing("host"));
        }

        let pool = &self.pool;
        if pool.max_connections == 0 {
            return Err(invalid("pool.max_connections", "must be at least 1"));
        }
        if pool.min_connections > pool.max_connections {
            return Err(invalid(
                "pool.min_connections",
                format!(
                    "{} exceeds max_connections {}",
                    pool.min_connections, pool.max_connections
                ),
            ));
        }
        for (field, value) in [
            ("pool.idle_timeout_ms", pool.idle_timeout_ms),
            ("pool.max_lifetime_ms", pool.max_lifetime_ms),
            ("pool.wait_timeout_ms", pool.wait_timeout_ms),
            ("retry.base_delay_ms", self.retry.base_delay_ms),
            ("retry.max_delay_ms", self.retry.max_delay_ms),
            ("circuit_breaker.recovery_time_ms", self.circuit_breaker.recovery_time_ms),
            ("limits.slow_query_ms", self.limits.slow_query_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if let ValidationPolicy::Interval { interval_ms: 0 } = self.validation {
            return Err(invalid("validation.interval_ms", "must be greater than zero"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.base_delay_ms",
                format!("{} exceeds max_delay_ms {}", self.retry.base_delay_ms, self.retry.max_delay_ms),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if self.circuit_breaker.half_open_successes == 0 {
            return Err(invalid("circuit_breaker.half_open_successes", "must be at least 1"));
        }
        if self.limits.max_query_bytes == 0 {
            return Err(invalid("limits.max_query_bytes", "must be at least 1"));
        }
        if self.limits.max_parameters == 0 {
            return Err(invalid("limits.max_parameters", "must be at least 1"));
        }
        if let Some(ssl) = &self.ssl {
            if matches!(ssl.mode, SslMode::VerifyCa | SslMode::VerifyFull) && ssl.ca.is_none() {
                return Err(invalid("ssl.ca", "required when verifying the server certificate"));
            }
            if ssl.cert.is_some() != ssl.key.is_some() {
                return Err(invalid("ssl.cert", "client cert and key must be given together"));
            }
        }
        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<PoolConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: PoolConfig = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    config.validate().context("Invalid pool configuration")?;
    Ok(config)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

/// Load configuration from environment variables
///
/// - DB_DRIVER (mysql, pgsql, sqlite)
/// - DB_DATABASE
/// - DB_HOST / DB_PORT (not needed for sqlite)
/// - DB_USERNAME / DB_PASSWORD
/// - DB_POOL_MIN / DB_POOL_MAX / DB_WAIT_TIMEOUT_MS (optional)
/// - DB_SSL_MODE / DB_SSL_CA (optional)
pub fn load_from_env() -> Result<PoolConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let driver: DriverKind = std::env::var("DB_DRIVER")
        .context("DB_DRIVER environment variable not set")?
        .parse()?;

    let database = std::env::var("DB_DATABASE")
        .context("DB_DATABASE environment variable not set")?;

    let mut config = PoolConfig::new(driver, database);
    config.host = std::env::var("DB_HOST").ok();
    config.port = env_parse("DB_PORT")?;
    config.username = std::env::var("DB_USERNAME").ok();
    config.password = std::env::var("DB_PASSWORD").ok();

    if let Some(min) = env_parse("DB_POOL_MIN")? {
        config.pool.min_connections = min;
    }
    if let Some(max) = env_parse("DB_POOL_MAX")? {
        config.pool.max_connections = max;
    }
    if let Some(wait) = env_parse("DB_WAIT_TIMEOUT_MS")? {
        config.pool.wait_timeout_ms = wait;
    }

    if let Ok(mode) = std::env::var("DB_SSL_MODE") {
        let mode: SslMode = serde_yaml::from_str(&mode)
            .context(format!("DB_SSL_MODE has an invalid value '{}'", mode))?;
        config.ssl = Some(SslConfig {
            mode,
            ca: std::env::var("DB_SSL_CA").ok(),
            cert: None,
            key: None,
        });
    }

    config.validate().context("Invalid pool configuration")?;
    Ok(config)
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<PoolConfig> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}
