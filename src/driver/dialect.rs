//! Per-driver connection URLs and session setup
//!
//! Each driver gets one session applier, chosen once when a connection is
//! opened. The statements it returns run before the connection joins the
//! pool.

use url::Url;

use super::{DriverError, DriverErrorKind, DriverKind};
use crate::config::{DialectConfig, PoolConfig, SslConfig, SslMode};

const MYSQL_DEFAULT_CHARSET: &str = "utf8mb4";
const MYSQL_SQL_MODE: &str = "STRICT_ALL_TABLES,NO_ENGINE_SUBSTITUTION";
const PGSQL_DEFAULT_CHARSET: &str = "UTF8";
const SQLITE_DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

fn invalid_setting(message: impl Into<String>) -> DriverError {
    DriverError::new(DriverErrorKind::Unsupported, message)
}

/// True for an in-memory sqlite database
pub fn is_sqlite_memory(database: &str) -> bool {
    database == ":memory:" || database.is_empty()
}

/// Build the sqlx connection URL for `config`
///
/// Credentials and the database name are percent-encoded.
pub fn connection_url(config: &PoolConfig) -> Result<String, DriverError> {
    match config.driver {
        DriverKind::Sqlite => Ok(sqlite_url(&config.database)),
        DriverKind::Mysql | DriverKind::Postgres => network_url(config),
    }
}

fn sqlite_url(database: &str) -> String {
    if is_sqlite_memory(database) {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite://{}?mode=rwc", database)
    }
}

fn network_url(config: &PoolConfig) -> Result<String, DriverError> {
    let scheme = match config.driver {
        DriverKind::Mysql => "mysql",
        _ => "postgres",
    };
    let host = config
        .host
        .as_deref()
        .ok_or_else(|| invalid_setting("host is required"))?;

    let mut url = Url::parse(&format!("{}://localhost", scheme))
        .map_err(|e| invalid_setting(e.to_string()))?;
    url.set_host(Some(host))
        .map_err(|e| invalid_setting(format!("invalid host '{}': {}", host, e)))?;
    url.set_port(config.effective_port())
        .map_err(|_| invalid_setting("port cannot be set"))?;
    if let Some(username) = &config.username {
        url.set_username(username)
            .map_err(|_| invalid_setting("username cannot be set"))?;
    }
    if let Some(password) = &config.password {
        url.set_password(Some(password))
            .map_err(|_| invalid_setting("password cannot be set"))?;
    }
    url.set_path(&config.database);

    {
        let mut pairs = url.query_pairs_mut();
        // Sizes the driver's per-connection prepared statement cache
        pairs.append_pair("statement-cache-capacity", &config.statement_cache_size.to_string());
        if let Some(ssl) = &config.ssl {
            for (key, value) in ssl_params(config.driver, ssl) {
                pairs.append_pair(key, &value);
            }
        }
    }

    Ok(url.into())
}

/// URL query parameters carrying the TLS settings
pub fn ssl_params(driver: DriverKind, ssl: &SslConfig) -> Vec<(&'static str, String)> {
    let (mode_key, ca_key, cert_key, key_key) = match driver {
        DriverKind::Mysql => ("ssl-mode", "ssl-ca", "ssl-cert", "ssl-key"),
        DriverKind::Postgres => ("sslmode", "sslrootcert", "sslcert", "sslkey"),
        DriverKind::Sqlite => return Vec::new(),
    };

    let mode = match (driver, ssl.mode) {
        (DriverKind::Mysql, SslMode::Disable) => "DISABLED",
        (DriverKind::Mysql, SslMode::Prefer) => "PREFERRED",
        (DriverKind::Mysql, SslMode::Require) => "REQUIRED",
        (DriverKind::Mysql, SslMode::VerifyCa) => "VERIFY_CA",
        (DriverKind::Mysql, SslMode::VerifyFull) => "VERIFY_IDENTITY",
        (_, SslMode::Disable) => "disable",
        (_, SslMode::Prefer) => "prefer",
        (_, SslMode::Require) => "require",
        (_, SslMode::VerifyCa) => "verify-ca",
        (_, SslMode::VerifyFull) => "verify-full",
    };

    let mut params = vec![(mode_key, mode.to_string())];
    if let Some(ca) = &ssl.ca {
        params.push((ca_key, ca.clone()));
    }
    if let Some(cert) = &ssl.cert {
        params.push((cert_key, cert.clone()));
    }
    if let Some(key) = &ssl.key {
        params.push((key_key, key.clone()));
    }
    params
}

/// Statements applied to every new connection, in order
pub fn session_statements(config: &PoolConfig) -> Vec<String> {
    match config.driver {
        DriverKind::Mysql => mysql_session(&config.dialect),
        DriverKind::Postgres => postgres_session(&config.dialect),
        DriverKind::Sqlite => sqlite_session(&config.dialect, &config.database),
    }
}

fn mysql_session(dialect: &DialectConfig) -> Vec<String> {
    let charset = dialect.charset.as_deref().unwrap_or(MYSQL_DEFAULT_CHARSET);
    let mut statements = vec![format!("SET NAMES {}", quote_literal(charset))];
    if let Some(tz) = &dialect.timezone {
        statements.push(format!("SET time_zone = {}", quote_literal(tz)));
    }
    statements.push(format!("SET SESSION sql_mode = {}", quote_literal(MYSQL_SQL_MODE)));
    statements
}

fn postgres_session(dialect: &DialectConfig) -> Vec<String> {
    let charset = dialect.charset.as_deref().unwrap_or(PGSQL_DEFAULT_CHARSET);
    let mut statements = vec![format!("SET client_encoding TO {}", quote_literal(charset))];
    if let Some(tz) = &dialect.timezone {
        statements.push(format!("SET TIME ZONE {}", quote_literal(tz)));
    }
    if let Some(ms) = dialect.statement_timeout_ms {
        statements.push(format!("SET statement_timeout = {}", ms));
    }
    if let Some(name) = &dialect.application_name {
        statements.push(format!("SET application_name = {}", quote_literal(name)));
    }
    statements
}

fn sqlite_session(dialect: &DialectConfig, database: &str) -> Vec<String> {
    let busy_timeout = dialect.busy_timeout_ms.unwrap_or(SQLITE_DEFAULT_BUSY_TIMEOUT_MS);
    let mut statements = vec![
        "PRAGMA foreign_keys = ON".to_string(),
        format!("PRAGMA busy_timeout = {}", busy_timeout),
    ];
    if let Some(mode) = &dialect.journal_mode {
        // In-memory databases only support MEMORY/OFF journaling
        if !is_sqlite_memory(database) && mode.chars().all(|c| c.is_ascii_alphabetic()) {
            statements.push(format!("PRAGMA journal_mode = {}", mode.to_ascii_uppercase()));
        }
    }
    statements
}

/// Single-quoted SQL string literal
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
