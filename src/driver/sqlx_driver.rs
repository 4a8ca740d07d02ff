//! MySQL, PostgreSQL and SQLite connections through sqlx's `Any` driver

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, Column, Connection, Row as _, ValueRef};
use std::sync::Once;
use tracing::debug;

use super::dialect;
use super::{Connector, DriverError, DriverErrorKind, DriverKind, NativeConnection, Row, Value};
use crate::config::PoolConfig;
use crate::pool::Statement;

static INSTALL_DRIVERS: Once = Once::new();

/// SQLSTATE classes and vendor codes for rejected credentials
const AUTH_SQLSTATES: &[&str] = &["28000", "28P01"];
const MYSQL_AUTH_CODES: &[u16] = &[1044, 1045, 1698];
const AUTH_MESSAGES: &[&str] = &["access denied", "authentication failed", "password authentication"];

/// Connector for real database servers
#[derive(Debug, Clone, Default)]
pub struct SqlxConnector;

impl SqlxConnector {
    pub fn new() -> Self {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
        Self
    }
}

#[async_trait]
impl Connector for SqlxConnector {
    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn NativeConnection>, DriverError> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let url = dialect::connection_url(config)?;
        let mut conn = AnyConnection::connect(&url)
            .await
            .map_err(|e| classify(e, Phase::Connect))?;

        for statement in dialect::session_statements(config) {
            debug!(driver = %config.driver, statement = %statement, "Applying session setting");
            if let Err(e) = sqlx::query::<Any>(&statement).execute(&mut conn).await {
                // A half-configured session must not join the pool
                let _ = conn.close().await;
                return Err(classify(e, Phase::Connect));
            }
        }

        Ok(Box::new(SqlxConnection {
            conn: Some(conn),
            driver: config.driver,
        }))
    }
}

/// One sqlx connection
pub struct SqlxConnection {
    conn: Option<AnyConnection>,
    driver: DriverKind,
}

impl SqlxConnection {
    fn conn(&mut self) -> Result<&mut AnyConnection, DriverError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DriverError::new(DriverErrorKind::Closed, "connection is closed"))
    }

    async fn raw(&mut self, sql: &str) -> Result<(), DriverError> {
        let conn = self.conn()?;
        sqlx::query::<Any>(sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| classify(e, Phase::Transaction))?;
        Ok(())
    }
}

fn bind_params<'q>(statement: &'q Statement, params: &[Value]) -> Query<'q, Any, AnyArguments<'q>> {
    params
        .iter()
        .fold(sqlx::query::<Any>(statement.sql()), |query, param| match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Float(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.clone()),
            Value::Bytes(v) => query.bind(v.clone()),
        })
}

/// Decode each column by trying the supported types in turn
fn decode_row(row: &AnyRow) -> Row {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        let is_null = row.try_get_raw(index).map(|raw| raw.is_null()).unwrap_or(true);
        let value = if is_null {
            Value::Null
        } else if let Ok(v) = row.try_get::<i64, _>(index) {
            Value::Int(v)
        } else if let Ok(v) = row.try_get::<f64, _>(index) {
            Value::Float(v)
        } else if let Ok(v) = row.try_get::<bool, _>(index) {
            Value::Bool(v)
        } else if let Ok(v) = row.try_get::<String, _>(index) {
            Value::Text(v)
        } else if let Ok(v) = row.try_get::<Vec<u8>, _>(index) {
            Value::Bytes(v)
        } else {
            Value::Null
        };
        out.insert(column.name(), value);
    }
    out
}

#[async_trait]
impl NativeConnection for SqlxConnection {
    async fn ping(&mut self) -> Result<(), DriverError> {
        self.conn()?
            .ping()
            .await
            .map_err(|e| classify(e, Phase::Connect))
    }

    async fn query(&mut self, statement: &Statement, params: &[Value]) -> Result<Vec<Row>, DriverError> {
        let conn = self.conn()?;
        let rows = bind_params(statement, params)
            .fetch_all(conn)
            .await
            .map_err(|e| classify(e, Phase::Query))?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn execute(&mut self, statement: &Statement, params: &[Value]) -> Result<u64, DriverError> {
        let conn = self.conn()?;
        let result = bind_params(statement, params)
            .execute(conn)
            .await
            .map_err(|e| classify(e, Phase::Query))?;
        Ok(result.rows_affected())
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        let sql = match self.driver {
            DriverKind::Mysql => "START TRANSACTION",
            DriverKind::Postgres | DriverKind::Sqlite => "BEGIN",
        };
        self.raw(sql).await
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.raw("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.raw("ROLLBACK").await
    }

    async fn close(mut self: Box<Self>) -> Result<(), DriverError> {
        match self.conn.take() {
            Some(conn) => conn.close().await.map_err(|e| classify(e, Phase::Connect)),
            None => Ok(()),
        }
    }
}

/// Where a sqlx error surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connect,
    Query,
    Transaction,
}

fn classify(err: sqlx::Error, phase: Phase) -> DriverError {
    match &err {
        sqlx::Error::Database(db) => {
            let sqlstate = db.code().map(|c| c.into_owned());
            let vendor = db
                .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                .map(|e| e.number());
            let kind = classify_database_error(sqlstate.as_deref(), vendor, db.message(), phase);
            let code = vendor.map(|n| n.to_string()).or(sqlstate);
            let error = DriverError::new(kind, db.message());
            match code {
                Some(code) => error.with_code(code),
                None => error,
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DriverError::connection(err.to_string()),
        sqlx::Error::Configuration(_) => DriverError::new(DriverErrorKind::Unsupported, err.to_string()),
        _ => {
            let kind = match phase {
                Phase::Connect => DriverErrorKind::Connection,
                Phase::Query => DriverErrorKind::Query,
                Phase::Transaction => DriverErrorKind::Transaction,
            };
            DriverError::new(kind, err.to_string())
        }
    }
}

/// Map a server-reported error to a driver error kind
fn classify_database_error(sqlstate: Option<&str>, vendor: Option<u16>, message: &str, phase: Phase) -> DriverErrorKind {
    let message = message.to_ascii_lowercase();
    let auth = sqlstate.is_some_and(|s| AUTH_SQLSTATES.contains(&s))
        || vendor.is_some_and(|n| MYSQL_AUTH_CODES.contains(&n))
        || AUTH_MESSAGES.iter().any(|m| message.contains(m));

    if auth {
        return DriverErrorKind::Authentication;
    }
    match phase {
        Phase::Connect => DriverErrorKind::Connection,
        Phase::Query => DriverErrorKind::Query,
        Phase::Transaction => DriverErrorKind::Transaction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_by_sqlstate() {
        assert_eq!(
            classify_database_error(Some("28P01"), None, "password authentication failed for user \"app\"", Phase::Connect),
            DriverErrorKind::Authentication
        );
        assert_eq!(
            classify_database_error(Some("28000"), None, "no pg_hba.conf entry", Phase::Connect),
            DriverErrorKind::Authentication
        );
    }

    #[test]
    fn test_auth_by_mysql_code() {
        assert_eq!(
            classify_database_error(Some("42000"), Some(1044), "Access denied for user 'x'@'%' to database 'y'", Phase::Connect),
            DriverErrorKind::Authentication
        );
        assert_eq!(
            classify_database_error(None, Some(1698), "denied", Phase::Connect),
            DriverErrorKind::Authentication
        );
    }

    #[test]
    fn test_non_auth_follows_phase() {
        assert_eq!(
            classify_database_error(Some("3D000"), None, "database \"nope\" does not exist", Phase::Connect),
            DriverErrorKind::Connection
        );
        assert_eq!(
            classify_database_error(Some("42601"), None, "syntax error at or near \"SELEC\"", Phase::Query),
            DriverErrorKind::Query
        );
    }

    #[tokio::test]
    async fn test_sqlite_transaction_statements() {
        let config = PoolConfig::new(DriverKind::Sqlite, ":memory:");
        let mut conn = SqlxConnector::new().connect(&config).await.unwrap();

        conn.execute(&Statement::new("CREATE TABLE t (id INTEGER)"), &[]).await.unwrap();
        conn.begin().await.unwrap();
        conn.execute(&Statement::new("INSERT INTO t VALUES (?)"), &[Value::Int(1)]).await.unwrap();
        conn.rollback().await.unwrap();

        let rows = conn
            .query(&Statement::new("SELECT COUNT(*) AS n FROM t"), &[])
            .await
            .unwrap();
        assert_eq!(rows[0].get("n"), Some(&Value::Int(0)));
        conn.close().await.unwrap();
    }

    #[test]
    fn test_io_errors_are_connection_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = classify(sqlx::Error::Io(io), Phase::Query);
        assert_eq!(err.kind, DriverErrorKind::Connection);

        let err = classify(sqlx::Error::RowNotFound, Phase::Query);
        assert_eq!(err.kind, DriverErrorKind::Query);
    }
}
