//! File ingest service
//!
//! Reads a file in fixed-size chunks, publishes them to a partitioned log with
//! a persisted resume point, and applies each delivered chunk exactly once to
//! the `file_chunks` table.
//!
//! Modes (first CLI argument):
//! - `produce`: publish the source file, resuming after the last recorded chunk
//! - `consume`: apply delivered chunks until idle, limit or Ctrl-C
//! - `run`: produce, then consume (default)
//! - `report`: log `file_chunks` and both progress tables

pub mod config;
pub mod handler;
pub mod pipeline;
pub mod report;
pub mod source;

use anyhow::Context;
use db_pool::{create_pool, DbConfig};
use exactly_once::{PgStore, SqliteStore, TransactionalStore};
use sqlx::migrate::Migrator;
use std::sync::Arc;
use tracing::info;

pub const SERVICE_NAME: &str = "file-ingest-service";

/// Migrations for `file_chunks`. Versions owned by the core crate are ignored.
pub fn migrator() -> Migrator {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
}

/// Connect to `DATABASE_URL` and bring both schemas up to date.
///
/// `sqlite:` URLs open a local database file; anything else goes through the
/// shared PostgreSQL pool.
pub async fn connect_store() -> anyhow::Result<Arc<dyn TransactionalStore>> {
    let config = DbConfig::from_env(SERVICE_NAME).map_err(anyhow::Error::msg)?;
    config.log_config();

    let store: Arc<dyn TransactionalStore> = if config.database_url.starts_with("sqlite:") {
        Arc::new(
            SqliteStore::connect(&config.database_url, config.max_connections)
                .await
                .context("failed to open SQLite database")?,
        )
    } else {
        let pool = create_pool(config)
            .await
            .context("failed to connect to PostgreSQL")?;
        Arc::new(PgStore::new(pool))
    };

    store
        .run_migrations(&exactly_once::migrator())
        .await
        .context("progress table migrations failed")?;
    store
        .run_migrations(&migrator())
        .await
        .context("file_chunks migrations failed")?;

    info!(backend = store.backend(), "Store ready");
    Ok(store)
}
