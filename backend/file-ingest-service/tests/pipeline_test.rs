//! End-to-end file pipeline over the in-memory log and an in-memory SQLite store.

use async_trait::async_trait;
use exactly_once::{
    ConsumerOptions, IngestError, IngestResult, LogMessage, LogWriter, MemoryLog,
    MessageHandler, ProducerOptions, ProducerReport, RetryingExecutor, SqliteStore,
    TransactionalStore, TxMode,
};
use file_ingest_service::handler::FileChunkHandler;
use file_ingest_service::report::{read_snapshot, FileChunkRow};
use file_ingest_service::{migrator, pipeline};
use resilience::RetryConfig;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::watch;

const CHUNK_SIZE: usize = 10;

async fn setup_store() -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    store.run_migrations(&exactly_once::migrator()).await.unwrap();
    store.run_migrations(&migrator()).await.unwrap();
    store
}

fn executor(store: &Arc<SqliteStore>) -> RetryingExecutor {
    RetryingExecutor::new(
        store.clone(),
        RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        },
    )
}

/// 45 bytes: four full chunks and one of 5 bytes.
fn source_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"0123456789abcdefghijABCDEFGHIJ!@#$%^&*()tail.")
        .unwrap();
    file.flush().unwrap();
    file
}

fn producer_options(file: &NamedTempFile, retry: RetryConfig) -> ProducerOptions {
    let source = file.path().display().to_string();
    ProducerOptions::new(source.clone(), source, "producer-file").with_publish_retry(retry)
}

fn consumer_options() -> ConsumerOptions {
    ConsumerOptions {
        receive_timeout: Duration::from_millis(100),
        stop_when_idle: true,
        ..Default::default()
    }
}

fn shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

fn expected_rows(file: &NamedTempFile) -> Vec<FileChunkRow> {
    let name = file.path().display().to_string();
    [(1, 10), (2, 10), (3, 10), (4, 10), (5, 5)]
        .into_iter()
        .map(|(line, length)| FileChunkRow {
            name: name.clone(),
            line,
            length,
        })
        .collect()
}

#[tokio::test]
async fn test_file_is_ingested_once() {
    let store = setup_store().await;
    let log = Arc::new(MemoryLog::new(2));
    let file = source_file();

    let produced = pipeline::produce(
        file.path(),
        CHUNK_SIZE,
        log.clone(),
        executor(&store),
        producer_options(&file, RetryConfig::no_retry()),
        None,
    )
    .await
    .unwrap();
    assert_eq!(produced.published, 5);
    assert_eq!(produced.last_position, Some(5));

    let (_stop, rx) = shutdown();
    let consumed = pipeline::consume(log.clone(), executor(&store), consumer_options(), None, rx)
        .await
        .unwrap();
    assert_eq!(consumed.applied, 5);

    let snapshot = read_snapshot(&executor(&store)).await.unwrap();
    assert_eq!(snapshot.chunks, expected_rows(&file));
    assert_eq!(snapshot.total_bytes(), 45);
    assert_eq!(snapshot.progress.len(), 1);
    assert_eq!(snapshot.progress[0].last_applied_offset, 4);
    assert_eq!(snapshot.published.len(), 1);
    assert_eq!(snapshot.published[0].last_published_position, 5);

    // A second produce finds nothing left to publish
    let again = pipeline::produce(
        file.path(),
        CHUNK_SIZE,
        log.clone(),
        executor(&store),
        producer_options(&file, RetryConfig::no_retry()),
        None,
    )
    .await
    .unwrap();
    assert_eq!(again.published, 0);
    assert_eq!(log.len(), 5);
}

/// Passes calls through to the log until its budget runs out, then fails them.
struct CrashingWriter {
    log: Arc<MemoryLog>,
    publishes_left: AtomicU32,
    flushes_left: AtomicU32,
}

impl CrashingWriter {
    fn new(log: &Arc<MemoryLog>, publishes: u32, flushes: u32) -> Self {
        Self {
            log: log.clone(),
            publishes_left: AtomicU32::new(publishes),
            flushes_left: AtomicU32::new(flushes),
        }
    }

    fn take(budget: &AtomicU32) -> IngestResult<()> {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .map(|_| ())
            .map_err(|_| IngestError::LogUnavailable("process crashed".into()))
    }
}

#[async_trait]
impl LogWriter for CrashingWriter {
    async fn publish(
        &self,
        partition_key: &str,
        sequence_number: i64,
        payload: &[u8],
    ) -> IngestResult<i64> {
        Self::take(&self.publishes_left)?;
        self.log.publish(partition_key, sequence_number, payload).await
    }

    async fn flush(&self) -> IngestResult<()> {
        Self::take(&self.flushes_left)?;
        self.log.flush().await
    }
}

async fn produce_with(
    writer: Arc<dyn LogWriter>,
    file: &NamedTempFile,
    store: &Arc<SqliteStore>,
) -> IngestResult<ProducerReport> {
    pipeline::produce(
        file.path(),
        CHUNK_SIZE,
        writer,
        executor(store),
        producer_options(file, RetryConfig::no_retry()),
        None,
    )
    .await
}

#[tokio::test]
async fn test_produce_resumes_after_crash_before_publish() {
    let store = setup_store().await;
    let log = Arc::new(MemoryLog::new(1).without_deduplication());
    let file = source_file();

    // Chunks 1 and 2 go through; the process dies publishing chunk 3
    let crashing = Arc::new(CrashingWriter::new(&log, 2, u32::MAX));
    assert!(produce_with(crashing, &file, &store).await.is_err());
    assert_eq!(log.len(), 2);

    let resumed = produce_with(log.clone(), &file, &store).await.unwrap();
    assert_eq!(resumed.resumed_from, Some(2));
    assert_eq!(resumed.published, 3);
    assert_eq!(log.len(), 5);

    let (_stop, rx) = shutdown();
    let consumed = pipeline::consume(log.clone(), executor(&store), consumer_options(), None, rx)
        .await
        .unwrap();
    assert_eq!(consumed.applied, 5);

    let snapshot = read_snapshot(&executor(&store)).await.unwrap();
    assert_eq!(snapshot.chunks, expected_rows(&file));
}

#[tokio::test]
async fn test_republished_chunk_is_absorbed_by_business_key() {
    let store = setup_store().await;
    let log = Arc::new(MemoryLog::new(1).without_deduplication());
    let file = source_file();

    // Chunk 3 reaches the log but its flush fails, so its resume point is never recorded
    let crashing = Arc::new(CrashingWriter::new(&log, u32::MAX, 2));
    assert!(produce_with(crashing, &file, &store).await.is_err());
    assert_eq!(log.len(), 3);

    let resumed = produce_with(log.clone(), &file, &store).await.unwrap();
    assert_eq!(resumed.resumed_from, Some(2));
    // Chunk 3 is in the log twice
    assert_eq!(log.len(), 6);

    let (_stop, rx) = shutdown();
    let consumed = pipeline::consume(log.clone(), executor(&store), consumer_options(), None, rx)
        .await
        .unwrap();
    assert_eq!(consumed.applied, 6);

    let snapshot = read_snapshot(&executor(&store)).await.unwrap();
    assert_eq!(snapshot.chunks, expected_rows(&file));
    assert_eq!(snapshot.progress[0].last_applied_offset, 5);
}

#[tokio::test]
async fn test_handler_upsert_is_keyed_by_chunk() {
    let store = setup_store().await;
    let handler = FileChunkHandler;
    let payload = exactly_once::ChunkEnvelope::new("input.txt", 3, b"abc".to_vec())
        .encode()
        .unwrap();

    for offset in [7, 12] {
        let message = LogMessage {
            partition: 0,
            partition_key: "producer-file".into(),
            sequence_number: 3,
            offset,
            payload: payload.clone(),
        };
        let mut tx = store.begin(TxMode::SerializableReadWrite).await.unwrap();
        handler.apply(tx.as_mut(), &message).await.unwrap();
        tx.commit().await.unwrap();
    }

    let snapshot = read_snapshot(&executor(&store)).await.unwrap();
    assert_eq!(
        snapshot.chunks,
        vec![FileChunkRow {
            name: "input.txt".into(),
            line: 3,
            length: 3,
        }]
    );
}
