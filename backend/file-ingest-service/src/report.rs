//! Read-only view of what the pipeline has applied.

use async_trait::async_trait;
use exactly_once::{
    IngestResult, ProgressRecord, ProgressStore, PublishProgressRecord, RetryingExecutor,
    Statement, TransactionScope, TxMode, UnitOfWork, WorkOutcome,
};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChunkRow {
    pub name: String,
    pub line: i64,
    pub length: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub chunks: Vec<FileChunkRow>,
    pub progress: Vec<ProgressRecord>,
    pub published: Vec<PublishProgressRecord>,
}

impl IngestSnapshot {
    pub fn total_bytes(&self) -> i64 {
        self.chunks.iter().map(|c| c.length).sum()
    }
}

struct ReadSnapshot;

#[async_trait]
impl UnitOfWork for ReadSnapshot {
    type Output = IngestSnapshot;

    async fn run(&self, tx: &mut dyn TransactionScope) -> IngestResult<WorkOutcome<IngestSnapshot>> {
        let rows = tx
            .execute(&Statement::new(
                "SELECT name, line, length FROM file_chunks ORDER BY name, line",
            ))
            .await?;

        let mut chunks = Vec::with_capacity(rows.len());
        for row in &rows {
            chunks.push(FileChunkRow {
                name: row.get_str(0)?.unwrap_or_default().to_string(),
                line: row.get_i64(1)?.unwrap_or_default(),
                length: row.get_i64(2)?.unwrap_or_default(),
            });
        }

        let progress = ProgressStore::partition_offsets(tx).await?;
        let published = ProgressStore::published_positions(tx).await?;
        Ok(WorkOutcome::Skip(IngestSnapshot {
            chunks,
            progress,
            published,
        }))
    }
}

/// Read `file_chunks` and both progress tables in one snapshot.
pub async fn read_snapshot(executor: &RetryingExecutor) -> IngestResult<IngestSnapshot> {
    let snapshot = executor
        .run(TxMode::SnapshotReadOnly, &ReadSnapshot)
        .await?
        .into_inner();
    Ok(snapshot)
}

pub fn log_snapshot(snapshot: &IngestSnapshot) {
    for chunk in &snapshot.chunks {
        info!(name = %chunk.name, line = chunk.line, length = chunk.length, "file_chunks row");
    }
    for record in &snapshot.progress {
        info!(
            partition = record.partition_id,
            last_offset = record.last_applied_offset,
            "consumer_progress row"
        );
    }
    for record in &snapshot.published {
        info!(
            resume_key = %record.resume_key,
            last_position = record.last_published_position,
            "producer_progress row"
        );
    }
    info!(
        chunks = snapshot.chunks.len(),
        bytes = snapshot.total_bytes(),
        partitions = snapshot.progress.len(),
        "Report complete"
    );
}
