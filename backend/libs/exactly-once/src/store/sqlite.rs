use super::{Row, Statement, TransactionScope, TransactionalStore, TxMode, Value};
use crate::error::{IngestError, IngestResult};
use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, Sqlite, Transaction, ValueRef};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// SQLite-backed store.
///
/// SQLite runs one writer at a time, so every transaction is serializable.
/// Read-only snapshots are honoured by convention only.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Private in-memory database living as long as the store.
    ///
    /// Pinned to a single connection that is never recycled: every new
    /// connection to `sqlite::memory:` would see an empty database.
    pub async fn in_memory() -> IngestResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Database file at `url` (e.g. `sqlite://ingest.db`), created if missing.
    pub async fn connect(url: &str, max_connections: u32) -> IngestResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TransactionalStore for SqliteStore {
    async fn begin(&self, mode: TxMode) -> IngestResult<Box<dyn TransactionScope>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx: Some(tx), mode }))
    }

    async fn run_migrations(&self, migrator: &Migrator) -> IngestResult<()> {
        migrator.run(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

struct SqliteTransaction {
    tx: Option<Transaction<'static, Sqlite>>,
    mode: TxMode,
}

#[async_trait]
impl TransactionScope for SqliteTransaction {
    fn mode(&self) -> TxMode {
        self.mode
    }

    async fn execute(&mut self, statement: &Statement) -> IngestResult<Vec<Row>> {
        let tx = self.tx.as_mut().ok_or(IngestError::TransactionClosed)?;
        debug!(sql = %statement.sql, params = statement.params.len(), "Executing statement");

        let rows = bind_all(sqlx::query(&statement.sql), &statement.params)
            .fetch_all(&mut **tx)
            .await?;

        rows.iter().map(decode_row).collect()
    }

    async fn commit(&mut self) -> IngestResult<()> {
        let tx = self.tx.take().ok_or(IngestError::TransactionClosed)?;
        tx.commit().await.map_err(IngestError::CommitIndeterminate)
    }

    async fn rollback(&mut self) -> IngestResult<()> {
        let tx = self.tx.take().ok_or(IngestError::TransactionClosed)?;
        tx.rollback().await?;
        Ok(())
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<i64>),
            Value::Int64(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
            Value::Bytes(v) => query.bind(v.as_slice()),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> IngestResult<Row> {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let mut values = Vec::with_capacity(columns.len());

    for index in 0..columns.len() {
        if row.try_get_raw(index)?.is_null() {
            values.push(Value::Null);
            continue;
        }
        let value = if let Ok(v) = row.try_get::<i64, _>(index) {
            Value::Int64(v)
        } else if let Ok(v) = row.try_get::<String, _>(index) {
            Value::Text(v)
        } else {
            Value::Bytes(row.try_get::<Vec<u8>, _>(index)?)
        };
        values.push(value);
    }

    Ok(Row::new(columns, values))
}
