//! Transactional store abstraction.
//!
//! A [`TransactionalStore`] opens [`TransactionScope`]s; a scope runs
//! parameterised [`Statement`]s and is closed by exactly one `commit` or
//! `rollback`. Dropping an open scope rolls it back.
//!
//! Statements use positional `$1..$n` placeholders, which both backends accept.

mod postgres;
mod sqlite;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

use crate::error::{IngestError, IngestResult};
use async_trait::async_trait;
use sqlx::migrate::Migrator;
use std::fmt;

/// Isolation requested for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxMode {
    /// Required whenever the work reads the dedup boundary and writes.
    SerializableReadWrite,
    /// Consistent read-only snapshot for reporting. Never use it to decide a write.
    SnapshotReadOnly,
}

impl TxMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, TxMode::SnapshotReadOnly)
    }
}

impl fmt::Display for TxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxMode::SerializableReadWrite => write!(f, "serializable_rw"),
            TxMode::SnapshotReadOnly => write!(f, "snapshot_ro"),
        }
    }
}

/// Statement parameter or result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Int64(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            Value::Text(v) => Some(v.as_bytes()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int64(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int64(i64::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Parameterised SQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Append the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// One result row, columns in select order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.values.get(i))
    }

    /// Integer column; `Ok(None)` for SQL NULL.
    pub fn get_i64(&self, index: usize) -> IngestResult<Option<i64>> {
        match self.column(index)? {
            Value::Null => Ok(None),
            Value::Int64(v) => Ok(Some(*v)),
            other => Err(type_mismatch(index, "integer", other)),
        }
    }

    /// Text column; `Ok(None)` for SQL NULL.
    pub fn get_str(&self, index: usize) -> IngestResult<Option<&str>> {
        match self.column(index)? {
            Value::Null => Ok(None),
            Value::Text(v) => Ok(Some(v)),
            other => Err(type_mismatch(index, "text", other)),
        }
    }

    /// Binary column; text columns are returned as their UTF-8 bytes.
    pub fn get_bytes(&self, index: usize) -> IngestResult<Option<&[u8]>> {
        match self.column(index)? {
            Value::Null => Ok(None),
            other => other
                .as_bytes()
                .map(Some)
                .ok_or_else(|| type_mismatch(index, "bytes", other)),
        }
    }

    fn column(&self, index: usize) -> IngestResult<&Value> {
        self.values.get(index).ok_or_else(|| {
            IngestError::Database(sqlx::Error::ColumnIndexOutOfBounds {
                index,
                len: self.values.len(),
            })
        })
    }
}

fn type_mismatch(index: usize, expected: &str, found: &Value) -> IngestError {
    IngestError::Database(sqlx::Error::ColumnDecode {
        index: index.to_string(),
        source: format!("expected {}, found {:?}", expected, found).into(),
    })
}

/// One open store transaction.
///
/// After `commit` or `rollback` every call returns
/// [`IngestError::TransactionClosed`].
#[async_trait]
pub trait TransactionScope: Send {
    fn mode(&self) -> TxMode;

    /// Run a statement, returning all result rows (empty for writes).
    async fn execute(&mut self, statement: &Statement) -> IngestResult<Vec<Row>>;

    /// Commit. Any failure is reported as [`IngestError::CommitIndeterminate`].
    async fn commit(&mut self) -> IngestResult<()>;

    async fn rollback(&mut self) -> IngestResult<()>;

    /// Run a statement expected to return at most one row.
    async fn fetch_optional(&mut self, statement: &Statement) -> IngestResult<Option<Row>> {
        Ok(self.execute(statement).await?.into_iter().next())
    }
}

/// A store able to open transactions in a requested mode.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(&self, mode: TxMode) -> IngestResult<Box<dyn TransactionScope>>;

    /// Apply a set of embedded migrations to this store.
    async fn run_migrations(&self, migrator: &Migrator) -> IngestResult<()>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_bind_order() {
        let stmt = Statement::new("SELECT $1, $2, $3")
            .bind(7i64)
            .bind("name")
            .bind(None::<i64>);

        assert_eq!(
            stmt.params,
            vec![Value::Int64(7), Value::Text("name".into()), Value::Null]
        );
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::new(
            vec!["id".into(), "name".into(), "data".into(), "gone".into()],
            vec![
                Value::Int64(3),
                Value::Text("a".into()),
                Value::Bytes(vec![1, 2]),
                Value::Null,
            ],
        );

        assert_eq!(row.get_i64(0).unwrap(), Some(3));
        assert_eq!(row.get_str(1).unwrap(), Some("a"));
        assert_eq!(row.get_bytes(2).unwrap(), Some(&[1u8, 2][..]));
        assert_eq!(row.get_i64(3).unwrap(), None);
        assert_eq!(row.get_by_name("name"), Some(&Value::Text("a".into())));

        assert!(row.get_i64(1).is_err());
        assert!(row.get_i64(9).is_err());
    }

    #[test]
    fn test_tx_mode_read_only() {
        assert!(TxMode::SnapshotReadOnly.is_read_only());
        assert!(!TxMode::SerializableReadWrite.is_read_only());
    }
}
