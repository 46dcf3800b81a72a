//! # Exactly-Once Ingest Library
//!
//! Applies every message of an at-least-once, partitioned log exactly once to a
//! transactional store, across restarts, redeliveries and partial failures.
//!
//! ## Problem
//!
//! The log and the store commit independently:
//! - **Ack before commit**: a crash in between loses the message
//! - **Commit before ack**: a crash in between redelivers an applied message
//! - **Retries**: a replayed transaction must not apply its effect twice
//!
//! ## Solution
//!
//! The store holds the only durable record of "applied": one row per
//! partition with the highest committed offset, written in the same
//! serializable transaction as the business write.
//! - **Check and write atomically**: read the offset, skip or apply, advance
//! - **Acknowledge last**: the log is acknowledged only after commit or skip
//! - **Replay is a skip**: a redelivery after an unacknowledged commit finds the
//!   offset already advanced
//!
//! ## Architecture
//!
//! ```text
//! source -> SequencedProducer -> log partition -> OffsetTrackingConsumer -> store
//!              |  (sequence numbers,                 |  (check offset + write +
//!              |   resume point)                     |   advance, one transaction)
//!              v                                     v
//!        producer_progress                   consumer_progress
//!                        \                  /
//!                         RetryingExecutor
//!                    (fresh transaction per attempt)
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use exactly_once::{
//!     ConsumerOptions, IngestResult, LogMessage, MessageHandler, OffsetTrackingConsumer,
//!     RetryingExecutor, SqliteStore, Statement, TransactionScope,
//! };
//! use std::sync::Arc;
//!
//! struct CountBytes;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for CountBytes {
//!     async fn apply(&self, tx: &mut dyn TransactionScope, m: &LogMessage) -> IngestResult<()> {
//!         tx.execute(
//!             &Statement::new("INSERT INTO sizes (seq, len) VALUES ($1, $2) ON CONFLICT (seq) DO NOTHING")
//!                 .bind(m.sequence_number)
//!                 .bind(m.payload.len() as i64),
//!         )
//!         .await?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn example(log: Arc<exactly_once::MemoryLog>) -> IngestResult<()> {
//! let store = Arc::new(SqliteStore::in_memory().await?);
//! store.run_migrations(&exactly_once::migrator()).await?;
//!
//! let consumer = OffsetTrackingConsumer::new(
//!     log,
//!     RetryingExecutor::with_defaults(store),
//!     Arc::new(CountBytes),
//!     ConsumerOptions::default(),
//! );
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! let report = consumer.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Business Keys
//!
//! The business row written by a handler must be keyed by content that is
//! stable across redelivery (source name + position), never by the delivery
//! offset. A producer restarted after a crash between flush and resume-point
//! update republishes its last unconfirmed chunks; if the log does not collapse
//! the duplicate sequence numbers they arrive at new offsets, and only the
//! business key keeps them from becoming new rows.
//!
//! ## Concurrency Safety
//!
//! - One worker per partition: messages of a partition are applied strictly
//!   in delivery order, one transaction at a time
//! - Partitions run in parallel; the store's serializable isolation aborts
//!   conflicting writers, and the executor replays them
//! - Commit failures are treated as "may have committed" and replayed; the
//!   replay observes the advanced offset and skips
//!
//! ## Known Limitations
//!
//! - A message that fails permanently halts its partition and stays
//!   unacknowledged; there is no dead-letter handling
//! - Reporting reads in [`TxMode::SnapshotReadOnly`] must never decide writes

pub mod consumer;
pub mod error;
pub mod executor;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod log;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod progress;
pub mod store;

pub use consumer::{
    ConsumerOptions, ConsumerReport, FailurePolicy, HaltedPartition, MessageHandler,
    MessageOutcome, OffsetTrackingConsumer,
};
pub use error::{IngestError, IngestResult};
pub use executor::{Execution, RetryingExecutor, UnitOfWork, WorkOutcome};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaLogReader, KafkaLogWriter};
pub use log::{LogMessage, LogReader, LogWriter};
pub use memory::MemoryLog;
pub use message::ChunkEnvelope;
pub use metrics::{ConsumerMetrics, ProducerMetrics};
pub use producer::{ProducerOptions, ProducerReport, SequencedProducer};
pub use progress::{ProgressRecord, ProgressStore, PublishProgressRecord};
pub use store::{
    PgStore, Row, SqliteStore, Statement, TransactionScope, TransactionalStore, TxMode, Value,
};

use sqlx::migrate::Migrator;

/// Migrations creating `consumer_progress` and `producer_progress`.
///
/// Versions applied by other migrators on the same database are ignored.
pub fn migrator() -> Migrator {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
}
