use async_trait::async_trait;
use exactly_once::{
    ChunkEnvelope, IngestResult, LogMessage, MessageHandler, Statement, TransactionScope,
};
use tracing::info;

/// Records one `file_chunks` row per chunk, keyed by `(name, line)`.
///
/// The key comes from the envelope, never from the delivery offset, so a
/// chunk republished at a new offset overwrites its own row.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileChunkHandler;

#[async_trait]
impl MessageHandler for FileChunkHandler {
    async fn apply(&self, tx: &mut dyn TransactionScope, message: &LogMessage) -> IngestResult<()> {
        let chunk = ChunkEnvelope::decode(&message.payload)?;
        let length = chunk.data.len() as i64;

        tx.execute(
            &Statement::new(
                r#"
                INSERT INTO file_chunks (name, line, length)
                VALUES ($1, $2, $3)
                ON CONFLICT (name, line) DO UPDATE SET length = excluded.length
                "#,
            )
            .bind(chunk.source.as_str())
            .bind(chunk.position)
            .bind(length),
        )
        .await?;

        info!(
            name = %chunk.source,
            line = chunk.position,
            length,
            partition = message.partition,
            offset = message.offset,
            "Chunk saved"
        );
        Ok(())
    }
}
