//! Durable log collaborators.
//!
//! The log is ordered and partitioned. Offsets increase strictly within a
//! partition; delivery is at-least-once and unacknowledged messages are
//! redelivered after a reconnect.

use crate::error::{IngestError, IngestResult};
use async_trait::async_trait;
use resilience::{with_timeout_result, TimeoutError};
use std::future::Future;
use std::time::Duration;

/// A message as delivered by the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub partition: i64,
    pub partition_key: String,
    /// Producer-assigned, monotonic per producer and partition key
    pub sequence_number: i64,
    /// Log-assigned, monotonic per partition
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Publishing side of the log.
#[async_trait]
pub trait LogWriter: Send + Sync {
    /// Append a message and return its offset.
    ///
    /// Publishing a sequence number the log has already seen for this key may
    /// be collapsed into the earlier message; callers must not rely on it.
    async fn publish(
        &self,
        partition_key: &str,
        sequence_number: i64,
        payload: &[u8],
    ) -> IngestResult<i64>;

    /// Wait until every publish issued so far is durably accepted.
    async fn flush(&self) -> IngestResult<()>;
}

/// Consuming side of the log.
#[async_trait]
pub trait LogReader: Send + Sync {
    /// Next message, or `None` if nothing arrived within `timeout`.
    async fn receive(&self, timeout: Duration) -> IngestResult<Option<LogMessage>>;

    /// Mark `message` (and everything before it in its partition) consumed.
    async fn acknowledge(&self, message: &LogMessage) -> IngestResult<()>;
}

/// Run one log call under `limit`. Expiry is reported as the log being
/// unavailable, which callers retry.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> IngestResult<T>
where
    F: Future<Output = IngestResult<T>>,
{
    with_timeout_result(limit, call).await.map_err(|e| match e {
        TimeoutError::Elapsed(elapsed) => {
            IngestError::LogUnavailable(format!("no response within {:?}", elapsed))
        }
        TimeoutError::OperationFailed(e) => e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let ok = bounded(Duration::from_secs(1), async { Ok::<_, IngestError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = bounded(Duration::from_secs(1), async {
            Err::<i64, _>(IngestError::Log("rejected".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, IngestError::Log(_)));
    }

    #[tokio::test]
    async fn test_bounded_expiry_is_retriable() {
        let err = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, IngestError>(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, IngestError::LogUnavailable(_)));
        assert!(err.is_retriable());
    }
}
