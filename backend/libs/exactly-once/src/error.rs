//! Error types for the exactly-once ingest library.

use thiserror::Error;

/// Result type alias for ingest operations.
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors that can occur while producing, consuming or applying messages.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Store operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Commit did not report success; the transaction may or may not be durable
    #[error("Commit outcome unknown: {0}")]
    CommitIndeterminate(sqlx::Error),

    /// Temporary failure reported by a handler or collaborator
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The durable log could not be reached
    #[error("Log unavailable: {0}")]
    LogUnavailable(String),

    /// The durable log rejected the request
    #[error("Log error: {0}")]
    Log(String),

    /// Kafka client error
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Unit of work asked for the transaction to be abandoned
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Message payload could not be decoded
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Resume key or partition key rejected by validation
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Transaction used after commit or rollback
    #[error("Transaction already closed")]
    TransactionClosed,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error (source files, blocking tasks)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every allowed attempt failed with a retriable error
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        source: Box<IngestError>,
    },

    /// A message failed permanently; its partition stopped at that offset
    #[error("Partition {partition} halted at offset {offset}: {source}")]
    PartitionHalted {
        partition: i64,
        offset: i64,
        source: Box<IngestError>,
    },

    /// Processing a message panicked
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    /// Generic error with context
    #[error("Ingest error: {0}")]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    /// Whether re-running the whole unit of work from scratch may succeed.
    ///
    /// Commit failures are always retriable: the replay re-reads the offset
    /// row and takes the skip branch if the first commit did land.
    pub fn is_retriable(&self) -> bool {
        match self {
            IngestError::Database(e) => is_retriable_sqlx(e),
            IngestError::CommitIndeterminate(_)
            | IngestError::Transient(_)
            | IngestError::LogUnavailable(_) => true,
            #[cfg(feature = "kafka")]
            IngestError::Kafka(e) => is_retriable_kafka(e),
            IngestError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// Shorthand for [`IngestError::Transient`].
    pub fn transient(msg: impl Into<String>) -> Self {
        IngestError::Transient(msg.into())
    }

    /// The innermost error, looking through retry and halt wrappers.
    pub fn root(&self) -> &IngestError {
        match self {
            IngestError::RetriesExhausted { source, .. }
            | IngestError::PartitionHalted { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<resilience::RetryError<IngestError>> for IngestError {
    fn from(err: resilience::RetryError<IngestError>) -> Self {
        match err {
            resilience::RetryError::OperationFailed(e) => e,
            resilience::RetryError::MaxRetriesExceeded { retries, last } => {
                IngestError::RetriesExhausted {
                    attempts: retries + 1,
                    source: Box::new(last),
                }
            }
        }
    }
}

fn is_retriable_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => {
            if let Some(pg) = db_err.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
                return is_retriable_sqlstate(pg.code());
            }
            if db_err
                .try_downcast_ref::<sqlx::sqlite::SqliteError>()
                .is_some()
            {
                // Extended result codes keep the primary code in the low byte
                return db_err
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| matches!(code & 0xff, 5 | 6))
                    .unwrap_or(false);
            }
            false
        }
        _ => false,
    }
}

/// SQLSTATEs for serialization failure, deadlock, lost connection and shutdown.
fn is_retriable_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "57P01" | "57P02" | "57P03") || code.starts_with("08")
}

#[cfg(feature = "kafka")]
fn is_retriable_kafka(err: &rdkafka::error::KafkaError) -> bool {
    use rdkafka::types::RDKafkaErrorCode;

    matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::NotCoordinator
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
        )
    )
}
