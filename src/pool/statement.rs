//! Statement cache and query admission limits
//!
//! Statements are keyed by their trimmed text and kept in least-recently-used
//! order, so a hot statement survives churn from one-off queries. A hit
//! skips classification, placeholder scanning and fingerprinting.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::driver::{DriverKind, Value};

/// Leading keyword class of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatementKind {
    Read,
    Write,
    /// Opens or ends a transaction; savepoints are `Other`
    Transaction,
    Other,
}

impl StatementKind {
    fn classify(sql: &str) -> Self {
        let mut words = sql
            .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
            .filter(|s| !s.is_empty());
        let keyword = words.next().unwrap_or_default().to_ascii_uppercase();
        match keyword.as_str() {
            "SELECT" | "SHOW" | "DESCRIBE" | "EXPLAIN" | "WITH" | "PRAGMA" => StatementKind::Read,
            "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "MERGE" | "UPSERT" => StatementKind::Write,
            "BEGIN" | "COMMIT" | "END" => StatementKind::Transaction,
            "START" => match words.next() {
                Some(w) if w.eq_ignore_ascii_case("TRANSACTION") => StatementKind::Transaction,
                _ => StatementKind::Other,
            },
            // ROLLBACK [WORK | TRANSACTION] TO <savepoint> keeps the transaction open
            "ROLLBACK" => {
                let to_savepoint = words
                    .find(|w| !w.eq_ignore_ascii_case("WORK") && !w.eq_ignore_ascii_case("TRANSACTION"))
                    .is_some_and(|w| w.eq_ignore_ascii_case("TO"));
                if to_savepoint {
                    StatementKind::Other
                } else {
                    StatementKind::Transaction
                }
            }
            _ => StatementKind::Other,
        }
    }
}

/// Parameter markers found outside quoted text and comments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Placeholders {
    /// Bare `?` markers
    pub positional: usize,

    /// Highest `$n` or `?n` index
    pub numbered: usize,

    /// Whether `:name`, `@name` or `$name` markers appear
    pub named: bool,
}

impl Placeholders {
    fn scan(sql: &str) -> Self {
        let mut found = Placeholders::default();
        let mut quote: Option<char> = None;
        let mut prev = ' ';
        let mut chars = sql.chars().peekable();

        while let Some(c) = chars.next() {
            if let Some(q) = quote {
                if c == q {
                    quote = None;
                }
                prev = c;
                continue;
            }
            match c {
                '\'' | '"' | '`' => quote = Some(c),
                '-' if chars.peek() == Some(&'-') => {
                    for skipped in chars.by_ref() {
                        if skipped == '\n' {
                            break;
                        }
                    }
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    let mut star = false;
                    for skipped in chars.by_ref() {
                        if star && skipped == '/' {
                            break;
                        }
                        star = skipped == '*';
                    }
                }
                '?' | '$' => {
                    let mut digits = String::new();
                    while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                        digits.push(*d);
                        chars.next();
                    }
                    match digits.parse::<usize>() {
                        Ok(n) => found.numbered = found.numbered.max(n),
                        Err(_) if c == '?' => found.positional += 1,
                        Err(_) => found.named |= chars.peek().is_some_and(|n| n.is_ascii_alphabetic() || *n == '_'),
                    }
                }
                ':' | '@' if prev != ':' => {
                    found.named |= chars.peek().is_some_and(|n| n.is_ascii_alphabetic() || *n == '_');
                }
                _ => {}
            }
            prev = c;
        }
        found
    }

    /// Parameters the driver will bind, or `None` when named markers make it unknowable
    ///
    /// PostgreSQL only understands `$n`, so a `?` there is an operator.
    /// MySQL only understands `?`, and `@name` there is a user variable.
    pub fn expected(&self, driver: DriverKind) -> Option<usize> {
        match driver {
            DriverKind::Postgres => Some(self.numbered),
            DriverKind::Mysql => Some(self.positional),
            DriverKind::Sqlite if self.named => None,
            DriverKind::Sqlite => Some(self.positional + self.numbered),
        }
    }
}

/// A prepared statement as seen by the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    sql: Arc<str>,
    fingerprint: String,
    kind: StatementKind,
    placeholders: Placeholders,
}

impl Statement {
    pub fn new(sql: &str) -> Self {
        let sql = sql.trim();
        Self {
            fingerprint: fingerprint(sql),
            kind: StatementKind::classify(sql),
            placeholders: Placeholders::scan(sql),
            sql: Arc::from(sql),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn placeholders(&self) -> Placeholders {
        self.placeholders
    }

    /// Statement text shortened for log lines
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.sql.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{}...", head)
        } else {
            head
        }
    }
}

/// Hex SHA-256 of the trimmed statement text
pub fn fingerprint(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.trim().as_bytes()))
}

/// Bounded LRU cache of statements
#[derive(Debug)]
pub struct StatementCache {
    entries: IndexMap<Arc<str>, Arc<Statement>>,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
            capacity,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Return the cached statement for `sql`, preparing and inserting it on a miss
    ///
    /// The boolean is `true` on a cache hit.
    pub fn get_or_prepare(&mut self, sql: &str) -> (Arc<Statement>, bool) {
        let sql = sql.trim();

        if let Some(statement) = self.entries.shift_remove(sql) {
            self.hits += 1;
            self.entries.insert(Arc::clone(&statement.sql), Arc::clone(&statement));
            return (statement, true);
        }

        self.misses += 1;
        let statement = Arc::new(Statement::new(sql));
        if self.capacity == 0 {
            return (statement, false);
        }

        while self.entries.len() >= self.capacity {
            self.entries.shift_remove_index(0);
            self.evictions += 1;
        }
        self.entries.insert(Arc::clone(&statement.sql), Arc::clone(&statement));
        (statement, false)
    }

    pub fn contains(&self, sql: &str) -> bool {
        self.entries.contains_key(sql.trim())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Reason a statement was refused before touching a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryViolation {
    TooLarge { size: usize, max: usize },
    TooManyParameters { count: usize, max: usize },
}

/// Per-statement DoS limits and slow-query threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLimits {
    /// Maximum statement length in bytes
    #[serde(default = "default_max_query_bytes")]
    pub max_query_bytes: usize,

    /// Maximum number of bound parameters
    #[serde(default = "default_max_parameters")]
    pub max_parameters: usize,

    /// Queries slower than this are logged and counted
    #[serde(default = "default_slow_query_ms")]
    pub slow_query_ms: u64,
}

fn default_max_query_bytes() -> usize {
    1024 * 1024
}

fn default_max_parameters() -> usize {
    1000
}

fn default_slow_query_ms() -> u64 {
    1000
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_query_bytes: default_max_query_bytes(),
            max_parameters: default_max_parameters(),
            slow_query_ms: default_slow_query_ms(),
        }
    }
}

impl QueryLimits {
    pub fn check(&self, sql: &str, params: &[Value]) -> Result<(), QueryViolation> {
        if sql.len() > self.max_query_bytes {
            return Err(QueryViolation::TooLarge {
                size: sql.len(),
                max: self.max_query_bytes,
            });
        }
        if params.len() > self.max_parameters {
            return Err(QueryViolation::TooManyParameters {
                count: params.len(),
                max: self.max_parameters,
            });
        }
        Ok(())
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_ms)
    }

    pub fn is_slow(&self, elapsed: Duration) -> bool {
        elapsed > self.slow_query_threshold()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_surrounding_whitespace() {
        assert_eq!(fingerprint("SELECT 1"), fingerprint("  SELECT 1\n"));
        assert_ne!(fingerprint("SELECT 1"), fingerprint("SELECT 2"));
        assert_eq!(fingerprint("SELECT 1").len(), 64);
    }

    #[test]
    fn test_statement_kind() {
        assert_eq!(Statement::new("select * from users").kind(), StatementKind::Read);
        assert_eq!(Statement::new("(SELECT 1) UNION (SELECT 2)").kind(), StatementKind::Read);
        assert_eq!(Statement::new("UPDATE users SET name = ?").kind(), StatementKind::Write);
        assert_eq!(Statement::new("CREATE TABLE t (id INT)").kind(), StatementKind::Other);
    }

    #[test]
    fn test_transaction_control_kind() {
        for sql in ["BEGIN", "begin;", "START TRANSACTION", "COMMIT", "END", "ROLLBACK", "rollback work"] {
            assert_eq!(Statement::new(sql).kind(), StatementKind::Transaction, "{}", sql);
        }
        for sql in ["SAVEPOINT sp1", "ROLLBACK TO SAVEPOINT sp1", "ROLLBACK WORK TO sp1", "START SLAVE"] {
            assert_eq!(Statement::new(sql).kind(), StatementKind::Other, "{}", sql);
        }
    }

    #[test]
    fn test_cache_hit_and_miss() {
        let mut cache = StatementCache::new(4);
        let (first, hit) = cache.get_or_prepare("SELECT * FROM users WHERE id = ?");
        assert!(!hit);
        let (second, hit) = cache.get_or_prepare("SELECT * FROM users WHERE id = ?");
        assert!(hit);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let mut cache = StatementCache::new(2);
        cache.get_or_prepare("SELECT a");
        cache.get_or_prepare("SELECT b");

        // Touch "a" so "b" becomes the eviction candidate
        cache.get_or_prepare("SELECT a");
        cache.get_or_prepare("SELECT c");

        assert!(cache.contains("SELECT a"));
        assert!(!cache.contains("SELECT b"));
        assert!(cache.contains("SELECT c"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let mut cache = StatementCache::new(0);
        cache.get_or_prepare("SELECT 1");
        let (_, hit) = cache.get_or_prepare("SELECT 1");
        assert!(!hit);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_limits() {
        let limits = QueryLimits {
            max_query_bytes: 16,
            max_parameters: 2,
            slow_query_ms: 100,
        };
        assert!(limits.check("SELECT 1", &[]).is_ok());
        assert_eq!(
            limits.check("SELECT * FROM a_long_table", &[]),
            Err(QueryViolation::TooLarge { size: 26, max: 16 })
        );
        assert_eq!(
            limits.check("SELECT ?", &[Value::Int(1), Value::Int(2), Value::Int(3)]),
            Err(QueryViolation::TooManyParameters { count: 3, max: 2 })
        );
        assert!(limits.is_slow(Duration::from_millis(150)));
        assert!(!limits.is_slow(Duration::from_millis(50)));
    }

    #[test]
    fn test_cache_hit_ignores_surrounding_whitespace() {
        let mut cache = StatementCache::new(4);
        cache.get_or_prepare("SELECT 1");
        let (statement, hit) = cache.get_or_prepare("  SELECT 1\n");
        assert!(hit);
        assert_eq!(statement.fingerprint(), fingerprint("SELECT 1"));
        assert!(cache.contains(" SELECT 1 "));
    }

    fn expected(sql: &str, driver: DriverKind) -> Option<usize> {
        Statement::new(sql).placeholders().expected(driver)
    }

    #[test]
    fn test_placeholders_skip_quotes_and_comments() {
        assert_eq!(expected("SELECT * FROM t WHERE a = ? AND b = ?", DriverKind::Mysql), Some(2));
        assert_eq!(expected("SELECT '?' FROM t WHERE a = ?", DriverKind::Mysql), Some(1));
        assert_eq!(expected("SELECT a -- why?\nFROM t WHERE b = ?", DriverKind::Mysql), Some(1));
        assert_eq!(expected("SELECT /* ? */ a FROM t", DriverKind::Mysql), Some(0));
        assert_eq!(expected("SELECT 1", DriverKind::Sqlite), Some(0));
    }

    #[test]
    fn test_placeholders_per_driver() {
        let sql = "UPDATE t SET a = $1 WHERE b = $2 OR c = $1";
        assert_eq!(expected(sql, DriverKind::Postgres), Some(2));
        assert_eq!(expected(sql, DriverKind::Sqlite), Some(2));

        // `?` is a jsonb operator to PostgreSQL, and a cast is not a named marker
        assert_eq!(expected("SELECT data ? 'k', id::text FROM t WHERE id = $1", DriverKind::Postgres), Some(1));
        // MySQL user variables are not parameters
        assert_eq!(expected("SELECT @total := ? + 1", DriverKind::Mysql), Some(1));

        assert_eq!(expected("SELECT * FROM t WHERE a = ?1 OR b = ?1", DriverKind::Sqlite), Some(1));
        assert_eq!(expected("SELECT * FROM t WHERE a = :name", DriverKind::Sqlite), None);
        assert_eq!(expected("SELECT * FROM t WHERE a = $name", DriverKind::Sqlite), None);
    }

    #[test]
    fn test_preview_truncates() {
        let statement = Statement::new("SELECT * FROM audit_log");
        assert_eq!(statement.preview(6), "SELECT...");
        assert_eq!(statement.preview(100), "SELECT * FROM audit_log");
    }
}
