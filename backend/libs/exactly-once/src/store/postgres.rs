use super::{Row, Statement, TransactionScope, TransactionalStore, TxMode, Value};
use crate::error::{IngestError, IngestResult};
use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, Transaction, ValueRef};
use tracing::debug;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionalStore for PgStore {
    async fn begin(&self, mode: TxMode) -> IngestResult<Box<dyn TransactionScope>> {
        let mut tx = self.pool.begin().await?;

        // Must be the first statement of the transaction
        let set_mode = match mode {
            TxMode::SerializableReadWrite => {
                "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ WRITE"
            }
            TxMode::SnapshotReadOnly => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY",
        };
        sqlx::query(set_mode).execute(&mut *tx).await?;

        Ok(Box::new(PgTransaction { tx: Some(tx), mode }))
    }

    async fn run_migrations(&self, migrator: &Migrator) -> IngestResult<()> {
        migrator.run(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

struct PgTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    mode: TxMode,
}

#[async_trait]
impl TransactionScope for PgTransaction {
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
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
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

fn decode_row(row: &PgRow) -> IngestResult<Row> {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let mut values = Vec::with_capacity(columns.len());

    for index in 0..columns.len() {
        if row.try_get_raw(index)?.is_null() {
            values.push(Value::Null);
            continue;
        }
        let value = if let Ok(v) = row.try_get::<i64, _>(index) {
            Value::Int64(v)
        } else if let Ok(v) = row.try_get::<i32, _>(index) {
            Value::Int64(i64::from(v))
        } else if let Ok(v) = row.try_get::<bool, _>(index) {
            Value::Int64(i64::from(v))
        } else if let Ok(v) = row.try_get::<String, _>(index) {
            Value::Text(v)
        } else {
            Value::Bytes(row.try_get::<Vec<u8>, _>(index)?)
        };
        values.push(value);
    }

    Ok(Row::new(columns, values))
}
