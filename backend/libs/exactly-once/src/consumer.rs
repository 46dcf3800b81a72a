//! Offset-tracking consumer.
//!
//! Each message is handled in one serializable transaction that reads the
//! partition's applied offset, skips if the message is at or below it, and
//! otherwise runs the business write and advances the offset before
//! committing. The log is acknowledged only after that transaction committed
//! or skipped.
//!
//! ```text
//! RECEIVED -> [ CHECK_OFFSET -> SKIP | APPLY_AND_ADVANCE -> COMMITTED ] -> ACKNOWLEDGED
//!                         \-> FAILED (left unacknowledged, partition halts)
//! ```
//!
//! A handler panic is caught and treated like a non-retriable failure of the
//! message being processed.
//!
//! [`OffsetTrackingConsumer::run`] routes messages to one worker task per
//! partition over a bounded channel, so a partition is always processed one
//! message at a time in delivery order while distinct partitions proceed in
//! parallel.

use crate::error::{IngestError, IngestResult};
use crate::executor::{Execution, RetryingExecutor, UnitOfWork, WorkOutcome};
use crate::log::{bounded, LogMessage, LogReader};
use crate::metrics::ConsumerMetrics;
use crate::progress::ProgressStore;
use crate::store::{TransactionScope, TxMode};
use async_trait::async_trait;
use futures::FutureExt;
use resilience::{with_retry_if, RetryConfig};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Business write performed inside the consumer's transaction.
///
/// `apply` may run several times for one message (retries, redelivery); only
/// the run whose transaction commits takes effect. It must do nothing outside
/// `tx`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn apply(&self, tx: &mut dyn TransactionScope, message: &LogMessage) -> IngestResult<()>;
}

/// How a message left the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageOutcome {
    /// Business write and offset advance committed, then acknowledged
    Applied,
    /// At or below the applied offset; acknowledged without writing
    Skipped,
}

/// What a permanent message failure stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop the whole loop and return the failure.
    #[default]
    HaltConsumer,
    /// Stop only the failing partition; report it and keep the others going.
    HaltPartition,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// How long one receive waits for a message
    pub receive_timeout: Duration,
    /// Stop after this many received messages
    pub max_messages: Option<u64>,
    /// Stop the first time a receive times out
    pub stop_when_idle: bool,
    /// Per-partition queue between dispatcher and worker
    pub channel_capacity: usize,
    pub failure_policy: FailurePolicy,
    pub acknowledge_retry: RetryConfig,
    /// Limit on a single acknowledgement call
    pub acknowledge_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        let ack = resilience::log_acknowledge_config();
        Self {
            receive_timeout: Duration::from_secs(2),
            max_messages: None,
            stop_when_idle: false,
            channel_capacity: 64,
            failure_policy: FailurePolicy::default(),
            acknowledge_retry: ack.retry,
            acknowledge_timeout: ack.timeout.duration,
        }
    }
}

/// A partition stopped by a permanent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HaltedPartition {
    pub partition: i64,
    pub offset: i64,
    pub error: String,
}

/// Summary of one [`OffsetTrackingConsumer::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerReport {
    pub received: u64,
    pub applied: u64,
    pub skipped: u64,
    /// Highest offset applied per partition in this run
    pub last_applied: BTreeMap<i64, i64>,
    pub halted: Vec<HaltedPartition>,
}

#[derive(Clone)]
struct ConsumerCore {
    reader: Arc<dyn LogReader>,
    executor: RetryingExecutor,
    handler: Arc<dyn MessageHandler>,
    acknowledge_retry: RetryConfig,
    acknowledge_timeout: Duration,
    metrics: Option<ConsumerMetrics>,
}

pub struct OffsetTrackingConsumer {
    core: ConsumerCore,
    options: ConsumerOptions,
}

impl OffsetTrackingConsumer {
    pub fn new(
        reader: Arc<dyn LogReader>,
        executor: RetryingExecutor,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            core: ConsumerCore {
                reader,
                executor,
                handler,
                acknowledge_retry: options.acknowledge_retry.clone(),
                acknowledge_timeout: options.acknowledge_timeout,
                metrics: None,
            },
            options,
        }
    }

    pub fn with_metrics(mut self, metrics: ConsumerMetrics) -> Self {
        self.core.metrics = Some(metrics);
        self
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Run one message through check, write, commit and acknowledge.
    ///
    /// On error the message is unacknowledged; whatever committed stays
    /// committed and a redelivery will skip it.
    pub async fn process_message(&self, message: &LogMessage) -> IngestResult<MessageOutcome> {
        self.core.process_message(message).await
    }

    /// Consume until shutdown, `max_messages`, idleness or a halting failure.
    ///
    /// Dropping the shutdown sender counts as a shutdown request. Queued
    /// messages of healthy partitions are finished before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> IngestResult<ConsumerReport> {
        let core = Arc::new(self.core.clone());
        let options = &self.options;

        let mut senders: HashMap<i64, mpsc::Sender<LogMessage>> = HashMap::new();
        let mut workers: JoinSet<PartitionSummary> = JoinSet::new();
        let mut state = RunState::default();
        let mut fatal: Option<IngestError> = None;

        info!(
            receive_timeout_ms = options.receive_timeout.as_millis() as u64,
            max_messages = ?options.max_messages,
            policy = ?options.failure_policy,
            "Consumer started"
        );

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested");
                break;
            }
            if options.max_messages.is_some_and(|max| state.report.received >= max) {
                debug!(received = state.report.received, "Message limit reached");
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown sender dropped");
                        break;
                    }
                }

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    let halted = state.finish_worker(joined, &mut senders, core.metrics.as_ref());
                    if halted && options.failure_policy == FailurePolicy::HaltConsumer {
                        break;
                    }
                }

                received = core.reader.receive(options.receive_timeout) => {
                    match received {
                        Ok(Some(message)) => {
                            state.report.received += 1;
                            state.dispatch(message, &mut senders, &mut workers, &core, options).await;
                        }
                        Ok(None) => {
                            if options.stop_when_idle {
                                debug!("No message within receive timeout; stopping");
                                break;
                            }
                        }
                        Err(e) if e.is_retriable() => {
                            warn!(error = %e, "Receive failed; retrying");
                            tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                        }
                        Err(e) => {
                            error!(error = %e, "Receive failed permanently");
                            fatal = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        // Closing the channels lets workers finish their queues and exit
        senders.clear();
        while let Some(joined) = workers.join_next().await {
            state.finish_worker(joined, &mut senders, core.metrics.as_ref());
        }

        let report = state.report;
        info!(
            received = report.received,
            applied = report.applied,
            skipped = report.skipped,
            halted = report.halted.len(),
            "Consumer stopped"
        );

        if let Some(e) = fatal.or(state.unattributed_failure) {
            return Err(e);
        }
        if options.failure_policy == FailurePolicy::HaltConsumer {
            if let Some(e) = state.first_failure {
                return Err(e);
            }
        }
        Ok(report)
    }
}

impl ConsumerCore {
    async fn process_message(&self, message: &LogMessage) -> IngestResult<MessageOutcome> {
        let work = ApplyMessage {
            handler: self.handler.as_ref(),
            message,
        };

        let outcome = match self.executor.run(TxMode::SerializableReadWrite, &work).await? {
            Execution::Applied(_) => {
                info!(
                    partition = message.partition,
                    offset = message.offset,
                    sequence_number = message.sequence_number,
                    "Message applied"
                );
                MessageOutcome::Applied
            }
            Execution::Skipped(last) => {
                debug!(
                    partition = message.partition,
                    offset = message.offset,
                    last_applied = last,
                    "Redelivered message skipped"
                );
                MessageOutcome::Skipped
            }
        };

        self.acknowledge(message).await?;

        if let Some(metrics) = &self.metrics {
            match outcome {
                MessageOutcome::Applied => metrics.applied.inc(),
                MessageOutcome::Skipped => metrics.skipped.inc(),
            }
        }

        Ok(outcome)
    }

    async fn acknowledge(&self, message: &LogMessage) -> IngestResult<()> {
        let reader = &self.reader;
        let limit = self.acknowledge_timeout;
        with_retry_if(&self.acknowledge_retry, IngestError::is_retriable, || {
            bounded(limit, reader.acknowledge(message))
        })
        .await
        .map_err(|e| {
            let e = IngestError::from(e);
            warn!(
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Acknowledgement failed; message will be redelivered"
            );
            e
        })
    }
}

struct ApplyMessage<'a> {
    handler: &'a dyn MessageHandler,
    message: &'a LogMessage,
}

#[async_trait]
impl<'a> UnitOfWork for ApplyMessage<'a> {
    /// Offset now recorded for the partition
    type Output = i64;

    async fn run(&self, tx: &mut dyn TransactionScope) -> IngestResult<WorkOutcome<i64>> {
        let partition = self.message.partition;
        let offset = self.message.offset;

        if let Some(last) = ProgressStore::last_applied_offset(tx, partition).await? {
            if offset <= last {
                return Ok(WorkOutcome::Skip(last));
            }
        }

        self.handler.apply(tx, self.message).await?;

        if !ProgressStore::advance_offset(tx, partition, offset).await? {
            // Another writer moved the offset inside our snapshot; replay decides
            return Err(IngestError::transient(format!(
                "offset of partition {} advanced concurrently",
                partition
            )));
        }

        Ok(WorkOutcome::Apply(offset))
    }
}

struct PartitionSummary {
    partition: i64,
    applied: u64,
    skipped: u64,
    last_applied: Option<i64>,
    failure: Option<IngestError>,
}

#[derive(Default)]
struct RunState {
    report: ConsumerReport,
    first_failure: Option<IngestError>,
    /// Worker loss that cannot be pinned to a partition; fails the run under any policy
    unattributed_failure: Option<IngestError>,
}

impl RunState {
    async fn dispatch(
        &mut self,
        message: LogMessage,
        senders: &mut HashMap<i64, mpsc::Sender<LogMessage>>,
        workers: &mut JoinSet<PartitionSummary>,
        core: &Arc<ConsumerCore>,
        options: &ConsumerOptions,
    ) {
        let partition = message.partition;

        if self.report.halted.iter().any(|h| h.partition == partition) {
            debug!(partition, offset = message.offset, "Partition halted; message left unacknowledged");
            return;
        }

        let sender = senders.entry(partition).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
            workers.spawn(partition_worker(core.clone(), partition, rx));
            debug!(partition, "Partition worker started");
            tx
        });

        if sender.send(message).await.is_err() {
            // Worker already exited after a failure; its summary is collected by join_next
            debug!(partition, "Partition worker gone; message dropped unacknowledged");
        }
    }

    /// Fold a finished worker into the report. Returns true if it halted.
    fn finish_worker(
        &mut self,
        joined: Result<PartitionSummary, tokio::task::JoinError>,
        senders: &mut HashMap<i64, mpsc::Sender<LogMessage>>,
        metrics: Option<&ConsumerMetrics>,
    ) -> bool {
        let summary = match joined {
            Ok(summary) => summary,
            Err(e) => {
                // Panics are caught per message, so this worker died outside
                // message processing and its partition is unknown
                error!(error = %e, "Partition worker crashed");
                if self.unattributed_failure.is_none() {
                    self.unattributed_failure = Some(IngestError::WorkerPanicked(format!(
                        "partition worker crashed: {}",
                        e
                    )));
                }
                return true;
            }
        };

        senders.remove(&summary.partition);
        self.report.applied += summary.applied;
        self.report.skipped += summary.skipped;
        if let Some(offset) = summary.last_applied {
            let entry = self.report.last_applied.entry(summary.partition).or_insert(offset);
            *entry = (*entry).max(offset);
        }

        let Some(failure) = summary.failure else {
            return false;
        };

        if let IngestError::PartitionHalted { partition, offset, .. } = &failure {
            self.report.halted.push(HaltedPartition {
                partition: *partition,
                offset: *offset,
                error: failure.root().to_string(),
            });
        }
        if let Some(metrics) = metrics {
            metrics.halted_partitions.set(self.report.halted.len() as i64);
        }
        if self.first_failure.is_none() {
            self.first_failure = Some(failure);
        }
        true
    }
}

async fn partition_worker(
    core: Arc<ConsumerCore>,
    partition: i64,
    mut rx: mpsc::Receiver<LogMessage>,
) -> PartitionSummary {
    let mut summary = PartitionSummary {
        partition,
        applied: 0,
        skipped: 0,
        last_applied: None,
        failure: None,
    };

    while let Some(message) = rx.recv().await {
        let processed = AssertUnwindSafe(core.process_message(&message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(IngestError::WorkerPanicked(panic_message(panic.as_ref())))
            });

        match processed {
            Ok(MessageOutcome::Applied) => {
                summary.applied += 1;
                summary.last_applied = Some(message.offset);
            }
            Ok(MessageOutcome::Skipped) => summary.skipped += 1,
            Err(e) => {
                error!(
                    partition,
                    offset = message.offset,
                    error = %e,
                    "Message failed; halting partition"
                );
                if let Some(metrics) = &core.metrics {
                    metrics.failed.inc();
                }
                summary.failure = Some(IngestError::PartitionHalted {
                    partition,
                    offset: message.offset,
                    source: Box::new(e),
                });
                break;
            }
        }
    }

    summary
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
