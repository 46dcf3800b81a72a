//! Produce and consume halves of the file pipeline.

use crate::handler::FileChunkHandler;
use crate::source::ChunkReader;
use exactly_once::{
    ConsumerMetrics, ConsumerOptions, ConsumerReport, IngestError, IngestResult, LogReader,
    LogWriter, OffsetTrackingConsumer, ProducerMetrics, ProducerOptions, ProducerReport,
    RetryingExecutor, SequencedProducer,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Publish every chunk of `path` past the recorded resume point.
///
/// Each chunk is flushed and its position recorded before the next is read,
/// so a restart republishes at most one chunk.
pub async fn produce(
    path: &Path,
    chunk_size: usize,
    log: Arc<dyn LogWriter>,
    executor: RetryingExecutor,
    options: ProducerOptions,
    metrics: Option<ProducerMetrics>,
) -> IngestResult<ProducerReport> {
    let mut producer = SequencedProducer::open(log, executor, options).await?;
    if let Some(metrics) = metrics {
        producer = producer.with_metrics(metrics);
    }

    let mut reader = ChunkReader::open(path, chunk_size, producer.resume_position()).await?;
    info!(
        path = %path.display(),
        chunk_size,
        first_chunk = reader.next_position(),
        "Reading source"
    );

    while let Some(chunk) = reader.next_chunk().await? {
        if chunk.position != producer.next_sequence() {
            return Err(IngestError::Other(anyhow::anyhow!(
                "chunk {} does not match sequence {}; was the chunk size changed?",
                chunk.position,
                producer.next_sequence()
            )));
        }

        producer.publish(&chunk.data).await?;
        producer.flush().await?;
    }

    producer.close().await
}

/// Consume the log into `file_chunks` until idle, limit or shutdown.
pub async fn consume(
    log: Arc<dyn LogReader>,
    executor: RetryingExecutor,
    options: ConsumerOptions,
    metrics: Option<ConsumerMetrics>,
    shutdown: watch::Receiver<bool>,
) -> IngestResult<ConsumerReport> {
    let mut consumer =
        OffsetTrackingConsumer::new(log, executor, Arc::new(FileChunkHandler), options);
    if let Some(metrics) = metrics {
        consumer = consumer.with_metrics(metrics);
    }

    consumer.run(shutdown).await
}
