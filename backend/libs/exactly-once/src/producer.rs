//! Sequenced producer with a persisted resume point.
//!
//! Every published chunk carries a sequence number owned by the producer
//! instance: `resume point + 1` for the first chunk of a session, then one more
//! per chunk. The resume point is written only after the log confirmed the
//! flush, so a restart republishes at most the chunks that were not yet
//! confirmed. A log that collapses duplicate sequence numbers absorbs the
//! replay; otherwise the consumer's business key does.

use crate::error::{IngestError, IngestResult};
use crate::executor::{RetryingExecutor, UnitOfWork, WorkOutcome};
use crate::log::{bounded, LogWriter};
use crate::message::ChunkEnvelope;
use crate::metrics::ProducerMetrics;
use crate::progress::ProgressStore;
use crate::store::{TransactionScope, TxMode};
use async_trait::async_trait;
use resilience::{with_retry_if, RetryConfig};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Identity of one producer stream.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Key of the `producer_progress` row (for a file: its path)
    pub resume_key: String,
    /// Source name written into every envelope
    pub source: String,
    /// Log partition key; all chunks of the stream share it to stay ordered
    pub partition_key: String,
    /// Retry policy for log publish and flush
    pub publish_retry: RetryConfig,
    /// Limit on a single publish or flush call
    pub publish_timeout: Duration,
}

impl ProducerOptions {
    pub fn new(
        resume_key: impl Into<String>,
        source: impl Into<String>,
        partition_key: impl Into<String>,
    ) -> Self {
        let preset = resilience::log_publish_config();
        Self {
            resume_key: resume_key.into(),
            source: source.into(),
            partition_key: partition_key.into(),
            publish_retry: preset.retry,
            publish_timeout: preset.timeout.duration,
        }
    }

    pub fn with_publish_retry(mut self, retry: RetryConfig) -> Self {
        self.publish_retry = retry;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

/// Summary of a producer session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerReport {
    /// Chunks accepted by the log in this session
    pub published: u64,
    /// Resume point found when the session opened
    pub resumed_from: Option<i64>,
    /// Resume point recorded last
    pub last_position: Option<i64>,
}

pub struct SequencedProducer {
    log: Arc<dyn LogWriter>,
    executor: RetryingExecutor,
    options: ProducerOptions,
    resumed_from: Option<i64>,
    next_sequence: i64,
    /// Sequence number of the most recent successful publish
    last_published: Option<i64>,
    /// Resume point as stored
    recorded: Option<i64>,
    published: u64,
    metrics: Option<ProducerMetrics>,
}

impl SequencedProducer {
    /// Open a producer session, loading the resume point for `options.resume_key`.
    pub async fn open(
        log: Arc<dyn LogWriter>,
        executor: RetryingExecutor,
        options: ProducerOptions,
    ) -> IngestResult<Self> {
        let load = LoadResumePoint {
            resume_key: options.resume_key.clone(),
        };
        let resumed_from = executor
            .run(TxMode::SerializableReadWrite, &load)
            .await?
            .into_inner();

        let next_sequence = resumed_from.map_or(1, |position| position + 1);

        info!(
            resume_key = %options.resume_key,
            resumed_from = ?resumed_from,
            next_sequence,
            "Producer opened"
        );

        Ok(Self {
            log,
            executor,
            options,
            resumed_from,
            next_sequence,
            last_published: None,
            recorded: resumed_from,
            published: 0,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: ProducerMetrics) -> Self {
        if let Some(position) = self.recorded {
            metrics.resume_position.set(position);
        }
        self.metrics = Some(metrics);
        self
    }

    /// Last durably recorded source position, `None` for a fresh source.
    pub fn resume_position(&self) -> Option<i64> {
        self.recorded
    }

    /// Sequence number the next publish will carry.
    pub fn next_sequence(&self) -> i64 {
        self.next_sequence
    }

    /// Publish one chunk and return its sequence number.
    ///
    /// Transient log failures are retried with the same sequence number. On
    /// failure the sequence number is not consumed.
    pub async fn publish(&mut self, data: &[u8]) -> IngestResult<i64> {
        let sequence_number = self.next_sequence;
        let payload =
            ChunkEnvelope::new(self.options.source.clone(), sequence_number, data.to_vec())
                .encode()?;

        let attempts = AtomicU32::new(0);
        let log = &self.log;
        let partition_key = self.options.partition_key.as_str();
        let limit = self.options.publish_timeout;
        let offset = with_retry_if(&self.options.publish_retry, IngestError::is_retriable, || {
            attempts.fetch_add(1, Ordering::Relaxed);
            bounded(limit, log.publish(partition_key, sequence_number, &payload))
        })
        .await
        .map_err(IngestError::from)?;

        if let Some(metrics) = &self.metrics {
            metrics.published.inc();
            let retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
            metrics.publish_retries.inc_by(u64::from(retries));
        }

        debug!(
            partition_key = %partition_key,
            sequence_number,
            offset,
            bytes = data.len(),
            "Chunk published"
        );

        self.next_sequence += 1;
        self.last_published = Some(sequence_number);
        self.published += 1;
        Ok(sequence_number)
    }

    /// Wait for the log to accept everything published, then record the resume point.
    ///
    /// Returns the recorded resume point. If the flush fails the resume point is
    /// left untouched.
    pub async fn flush(&mut self) -> IngestResult<Option<i64>> {
        let log = &self.log;
        let limit = self.options.publish_timeout;
        with_retry_if(&self.options.publish_retry, IngestError::is_retriable, || {
            bounded(limit, log.flush())
        })
        .await
        .map_err(IngestError::from)?;

        let position = match self.last_published {
            Some(position) if self.recorded.map_or(true, |recorded| recorded < position) => {
                position
            }
            _ => return Ok(self.recorded),
        };

        let record = RecordResumePoint {
            resume_key: self.options.resume_key.clone(),
            position,
        };
        self.executor
            .run(TxMode::SerializableReadWrite, &record)
            .await?;

        self.recorded = Some(position);
        if let Some(metrics) = &self.metrics {
            metrics.resume_position.set(position);
        }
        debug!(resume_key = %self.options.resume_key, position, "Resume point recorded");

        Ok(self.recorded)
    }

    /// Flush and finish the session.
    pub async fn close(mut self) -> IngestResult<ProducerReport> {
        self.flush().await?;
        let report = self.report();

        info!(
            resume_key = %self.options.resume_key,
            published = report.published,
            last_position = ?report.last_position,
            "Producer closed"
        );
        Ok(report)
    }

    pub fn report(&self) -> ProducerReport {
        ProducerReport {
            published: self.published,
            resumed_from: self.resumed_from,
            last_position: self.recorded,
        }
    }
}

struct LoadResumePoint {
    resume_key: String,
}

#[async_trait]
impl UnitOfWork for LoadResumePoint {
    type Output = Option<i64>;

    async fn run(&self, tx: &mut dyn TransactionScope) -> IngestResult<WorkOutcome<Option<i64>>> {
        let position = ProgressStore::last_published_position(tx, &self.resume_key).await?;
        Ok(WorkOutcome::Skip(position))
    }
}

struct RecordResumePoint {
    resume_key: String,
    position: i64,
}

#[async_trait]
impl UnitOfWork for RecordResumePoint {
    type Output = bool;

    async fn run(&self, tx: &mut dyn TransactionScope) -> IngestResult<WorkOutcome<bool>> {
        let advanced =
            ProgressStore::record_published_position(tx, &self.resume_key, self.position).await?;
        Ok(WorkOutcome::Apply(advanced))
    }
}
