//! Native database driver seam
//!
//! The pool never talks to a database directly. It asks a [`Connector`] for
//! boxed [`NativeConnection`]s and drives them through this trait:
//! - `SqlxConnector`: MySQL, PostgreSQL and SQLite through sqlx
//! - `MockConnector`: scriptable in-process driver for tests and dry runs

pub mod dialect;
pub mod mock;
pub mod sqlx_driver;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::PoolConfig;
use crate::pool::Statement;

pub use self::mock::{MockConnector, MockControls};
pub use self::sqlx_driver::SqlxConnector;

/// Supported database drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[serde(alias = "mariadb")]
    Mysql,

    #[serde(alias = "pgsql", alias = "postgresql")]
    Postgres,

    Sqlite,
}

impl DriverKind {
    pub fn name(&self) -> &'static str {
        match self {
            DriverKind::Mysql => "mysql",
            DriverKind::Postgres => "pgsql",
            DriverKind::Sqlite => "sqlite",
        }
    }

    /// Port used when the configuration does not name one
    pub fn default_port(&self) -> Option<u16> {
        match self {
            DriverKind::Mysql => Some(3306),
            DriverKind::Postgres => Some(5432),
            DriverKind::Sqlite => None,
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DriverKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(DriverKind::Mysql),
            "pgsql" | "postgres" | "postgresql" => Ok(DriverKind::Postgres),
            "sqlite" | "sqlite3" => Ok(DriverKind::Sqlite),
            other => Err(DriverError::new(
                DriverErrorKind::Unsupported,
                format!("unsupported driver: {}", other),
            )),
        }
    }
}

/// Broad classification of a native driver failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriverErrorKind {
    /// Credentials rejected - never retried
    Authentication,
    /// Network, TLS or protocol failure
    Connection,
    /// Statement failed on the server
    Query,
    /// BEGIN/COMMIT/ROLLBACK failed
    Transaction,
    /// Connection already closed
    Closed,
    Unsupported,
}

/// Error reported by a native driver
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?} error{}: {message}", code_suffix(.code))]
pub struct DriverError {
    pub kind: DriverErrorKind,
    /// SQLSTATE or vendor error code, when the server supplied one
    pub code: Option<String>,
    pub message: String,
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" [{}]", c)).unwrap_or_default()
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Connection, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Authentication, message)
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Query, message)
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Transaction, message)
    }

    pub fn is_authentication(&self) -> bool {
        self.kind == DriverErrorKind::Authentication
    }
}

/// Bound parameter type inferred from a [`Value`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Binary,
}

/// A statement parameter or result column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn param_type(&self) -> ParamType {
        match self {
            Value::Null => ParamType::Null,
            Value::Bool(_) => ParamType::Boolean,
            Value::Int(_) => ParamType::Integer,
            Value::Float(_) => ParamType::Float,
            Value::Text(_) => ParamType::String,
            Value::Bytes(_) => ParamType::Binary,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Infer a value from command-line text: `null`, booleans, integers,
    /// floats, otherwise text
    pub fn infer(raw: &str) -> Self {
        match raw {
            "null" | "NULL" => Value::Null,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => {
                if let Ok(i) = raw.parse::<i64>() {
                    Value::Int(i)
                } else if let Ok(f) = raw.parse::<f64>() {
                    Value::Float(f)
                } else {
                    Value::Text(raw.to_string())
                }
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One result row, columns in select order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row {
    columns: IndexMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.columns.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.columns.get_index(index).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Opens native connections for a pool
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open one physical connection and apply per-driver session settings
    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn NativeConnection>, DriverError>;
}

#[async_trait]
impl<T: Connector> Connector for std::sync::Arc<T> {
    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn NativeConnection>, DriverError> {
        (**self).connect(config).await
    }
}

/// One live physical connection
#[async_trait]
pub trait NativeConnection: Send {
    /// Cheap liveness check
    async fn ping(&mut self) -> Result<(), DriverError>;

    async fn query(&mut self, statement: &Statement, params: &[Value]) -> Result<Vec<Row>, DriverError>;

    /// Run a statement and return the affected row count
    async fn execute(&mut self, statement: &Statement, params: &[Value]) -> Result<u64, DriverError>;

    async fn begin(&mut self) -> Result<(), DriverError>;

    async fn commit(&mut self) -> Result<(), DriverError>;

    async fn rollback(&mut self) -> Result<(), DriverError>;

    async fn close(self: Box<Self>) -> Result<(), DriverError>;
}
