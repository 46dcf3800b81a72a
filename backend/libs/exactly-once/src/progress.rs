//! Table-backed progress records.
//!
//! `consumer_progress` holds the highest offset fully applied per partition and
//! is the consumer's dedup boundary. `producer_progress` holds the last source
//! position the log durably accepted per resume key and is the producer's
//! restart point.
//!
//! Every function takes the caller's open transaction: consumer progress must
//! only ever change in the same transaction as the business write it covers.
//! Both upserts are monotonic, so a stale writer can never move a record
//! backwards.

use crate::error::{IngestError, IngestResult};
use crate::store::{Statement, TransactionScope};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Maximum resume key length in bytes (fits the TEXT primary key index comfortably)
pub const MAX_RESUME_KEY_LEN: usize = 255;

/// Consumer-side progress for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub partition_id: i64,
    pub last_applied_offset: i64,
}

/// Producer-side progress for one resume key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishProgressRecord {
    pub resume_key: String,
    pub last_published_position: i64,
}

/// Accessors for both progress tables.
pub struct ProgressStore;

impl ProgressStore {
    /// Highest applied offset for `partition`, `None` if nothing was applied yet.
    pub async fn last_applied_offset(
        tx: &mut dyn TransactionScope,
        partition: i64,
    ) -> IngestResult<Option<i64>> {
        let row = tx
            .fetch_optional(
                &Statement::new("SELECT last_offset FROM consumer_progress WHERE partition_id = $1")
                    .bind(partition),
            )
            .await?;

        match row {
            Some(row) => row.get_i64(0),
            None => Ok(None),
        }
    }

    /// Record `offset` as applied for `partition`.
    ///
    /// Returns `false` when the stored offset is already at or past `offset`;
    /// the record is left untouched in that case.
    pub async fn advance_offset(
        tx: &mut dyn TransactionScope,
        partition: i64,
        offset: i64,
    ) -> IngestResult<bool> {
        let rows = tx
            .execute(
                &Statement::new(
                    r#"
                    INSERT INTO consumer_progress (partition_id, last_offset)
                    VALUES ($1, $2)
                    ON CONFLICT (partition_id) DO UPDATE
                    SET last_offset = excluded.last_offset
                    WHERE consumer_progress.last_offset < excluded.last_offset
                    RETURNING last_offset
                    "#,
                )
                .bind(partition)
                .bind(offset),
            )
            .await?;

        let advanced = !rows.is_empty();
        debug!(partition, offset, advanced, "Consumer progress upsert");
        Ok(advanced)
    }

    /// Every partition's progress, ordered by partition id.
    pub async fn partition_offsets(
        tx: &mut dyn TransactionScope,
    ) -> IngestResult<Vec<ProgressRecord>> {
        let rows = tx
            .execute(&Statement::new(
                "SELECT partition_id, last_offset FROM consumer_progress ORDER BY partition_id",
            ))
            .await?;

        rows.iter()
            .map(|row| {
                Ok(ProgressRecord {
                    partition_id: required_i64(row.get_i64(0)?, "partition_id")?,
                    last_applied_offset: required_i64(row.get_i64(1)?, "last_offset")?,
                })
            })
            .collect()
    }

    /// Last published source position for `resume_key`, `None` if never published.
    pub async fn last_published_position(
        tx: &mut dyn TransactionScope,
        resume_key: &str,
    ) -> IngestResult<Option<i64>> {
        Self::validate_resume_key(resume_key)?;

        let row = tx
            .fetch_optional(
                &Statement::new("SELECT last_position FROM producer_progress WHERE resume_key = $1")
                    .bind(resume_key),
            )
            .await?;

        match row {
            Some(row) => row.get_i64(0),
            None => Ok(None),
        }
    }

    /// Record `position` as durably published for `resume_key`.
    ///
    /// Returns `false` when a position at or past `position` is already stored.
    pub async fn record_published_position(
        tx: &mut dyn TransactionScope,
        resume_key: &str,
        position: i64,
    ) -> IngestResult<bool> {
        Self::validate_resume_key(resume_key)?;

        let rows = tx
            .execute(
                &Statement::new(
                    r#"
                    INSERT INTO producer_progress (resume_key, last_position)
                    VALUES ($1, $2)
                    ON CONFLICT (resume_key) DO UPDATE
                    SET last_position = excluded.last_position
                    WHERE producer_progress.last_position < excluded.last_position
                    RETURNING last_position
                    "#,
                )
                .bind(resume_key)
                .bind(position),
            )
            .await?;

        let advanced = !rows.is_empty();
        debug!(resume_key = %resume_key, position, advanced, "Producer progress upsert");
        Ok(advanced)
    }

    /// Every resume key's published position, ordered by key.
    pub async fn published_positions(
        tx: &mut dyn TransactionScope,
    ) -> IngestResult<Vec<PublishProgressRecord>> {
        let rows = tx
            .execute(&Statement::new(
                "SELECT resume_key, last_position FROM producer_progress ORDER BY resume_key",
            ))
            .await?;

        rows.iter()
            .map(|row| {
                let resume_key = row.get_str(0)?.ok_or_else(|| {
                    IngestError::Database(sqlx::Error::ColumnDecode {
                        index: "resume_key".to_string(),
                        source: "unexpected NULL".into(),
                    })
                })?;
                Ok(PublishProgressRecord {
                    resume_key: resume_key.to_string(),
                    last_published_position: required_i64(row.get_i64(1)?, "last_position")?,
                })
            })
            .collect()
    }

    /// Validate resume key format
    fn validate_resume_key(resume_key: &str) -> IngestResult<()> {
        if resume_key.is_empty() {
            return Err(IngestError::InvalidKey("resume key cannot be empty".into()));
        }

        if resume_key.len() > MAX_RESUME_KEY_LEN {
            return Err(IngestError::InvalidKey(format!(
                "resume key exceeds {} bytes: {}",
                MAX_RESUME_KEY_LEN,
                resume_key.len()
            )));
        }

        Ok(())
    }
}

fn required_i64(value: Option<i64>, column: &str) -> IngestResult<i64> {
    value.ok_or_else(|| {
        IngestError::Database(sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: "unexpected NULL".into(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_resume_key() {
        assert!(ProgressStore::validate_resume_key("/data/input.txt").is_ok());
        assert!(ProgressStore::validate_resume_key(&"a".repeat(MAX_RESUME_KEY_LEN)).is_ok());

        assert!(matches!(
            ProgressStore::validate_resume_key(""),
            Err(IngestError::InvalidKey(_))
        ));
        assert!(matches!(
            ProgressStore::validate_resume_key(&"a".repeat(MAX_RESUME_KEY_LEN + 1)),
            Err(IngestError::InvalidKey(_))
        ));

        // Limit counts bytes: 128 two-byte characters are 256 bytes
        match ProgressStore::validate_resume_key(&"é".repeat(128)) {
            Err(IngestError::InvalidKey(message)) => assert!(message.contains("255 bytes: 256")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
