//! Fixed-size chunking of the source file.
//!
//! Chunk `n` (numbered from 1) covers bytes `[(n - 1) * chunk_size, n * chunk_size)`.
//! The numbering is what makes the producer's resume point meaningful, so the
//! chunk size must not change between runs over the same file.

use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub position: i64,
    pub data: Vec<u8>,
}

pub struct ChunkReader {
    file: File,
    chunk_size: usize,
    next_position: i64,
}

impl ChunkReader {
    /// Open `path` positioned right after chunk `resume_after`.
    pub async fn open(
        path: impl AsRef<Path>,
        chunk_size: usize,
        resume_after: Option<i64>,
    ) -> std::io::Result<Self> {
        let chunk_size = chunk_size.max(1);
        let skipped = resume_after.unwrap_or(0).max(0);
        let (offset, next_position) = u64::try_from(chunk_size)
            .ok()
            .and_then(|size| (skipped as u64).checked_mul(size))
            .zip(skipped.checked_add(1))
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!(
                        "resume point {} is out of range for chunk size {}",
                        skipped, chunk_size
                    ),
                )
            })?;

        let mut file = File::open(path.as_ref()).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        Ok(Self {
            file,
            chunk_size,
            next_position,
        })
    }

    /// Position the next chunk will carry.
    pub fn next_position(&self) -> i64 {
        self.next_position
    }

    /// Next chunk, or `None` at end of file. Only the last chunk may be short.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Chunk>> {
        let mut data = vec![0u8; self.chunk_size];
        let mut filled = 0;

        while filled < self.chunk_size {
            let read = self.file.read(&mut data[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        if filled == 0 {
            return Ok(None);
        }
        data.truncate(filled);

        let chunk = Chunk {
            position: self.next_position,
            data,
        };
        self.next_position += 1;
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn source_file(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    async fn read_all(reader: &mut ChunkReader) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_chunks_are_numbered_from_one() {
        let file = source_file(b"abcdefghij");
        let mut reader = ChunkReader::open(file.path(), 4, None).await.unwrap();

        let chunks = read_all(&mut reader).await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], Chunk { position: 1, data: b"abcd".to_vec() });
        assert_eq!(chunks[1], Chunk { position: 2, data: b"efgh".to_vec() });
        assert_eq!(chunks[2], Chunk { position: 3, data: b"ij".to_vec() });
    }

    #[tokio::test]
    async fn test_resume_skips_recorded_chunks() {
        let file = source_file(b"abcdefghij");
        let mut reader = ChunkReader::open(file.path(), 4, Some(2)).await.unwrap();
        assert_eq!(reader.next_position(), 3);

        let chunks = read_all(&mut reader).await;

        assert_eq!(chunks, vec![Chunk { position: 3, data: b"ij".to_vec() }]);
    }

    #[tokio::test]
    async fn test_resume_past_end_yields_nothing() {
        let file = source_file(b"abc");
        let mut reader = ChunkReader::open(file.path(), 4, Some(5)).await.unwrap();

        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_resume_point_is_rejected() {
        let file = source_file(b"abc");
        let err = ChunkReader::open(file.path(), 4, Some(i64::MAX))
            .await
            .err()
            .unwrap();

        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_reads_and_seeks_by_one_byte() {
        let file = source_file(b"abcd");
        let mut reader = ChunkReader::open(file.path(), 0, Some(2)).await.unwrap();

        let chunks = read_all(&mut reader).await;

        assert_eq!(
            chunks,
            vec![
                Chunk { position: 3, data: b"c".to_vec() },
                Chunk { position: 4, data: b"d".to_vec() },
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_file() {
        let file = source_file(b"");
        let mut reader = ChunkReader::open(file.path(), 4, None).await.unwrap();

        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = ChunkReader::open(dir.path().join("absent.txt"), 4, None).await;

        assert!(result.is_err());
    }
}
