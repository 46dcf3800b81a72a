//! Retrying transactional execution.
//!
//! [`RetryingExecutor::run`] opens a fresh transaction for every attempt and
//! re-invokes the whole [`UnitOfWork`] from scratch when the previous attempt
//! failed with a retriable error. A unit of work therefore must not cause any
//! effect outside its transaction before the executor commits it.
//!
//! Each attempt is bounded by a time limit; an attempt that runs over is
//! dropped, which rolls its transaction back, and counts as retriable.

use crate::error::{IngestError, IngestResult};
use crate::store::{TransactionScope, TransactionalStore, TxMode};
use async_trait::async_trait;
use resilience::{with_retry_if, with_timeout_result, RetryConfig, TimeoutError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What a unit of work asks the executor to do with its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome<T> {
    /// Commit the transaction.
    Apply(T),
    /// Roll back; nothing needed to become durable.
    Skip(T),
    /// Roll back and fail without retrying.
    Abort(String),
}

/// Successful result of [`RetryingExecutor::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution<T> {
    Applied(T),
    Skipped(T),
}

impl<T> Execution<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Execution::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Execution::Applied(v) | Execution::Skipped(v) => v,
        }
    }
}

/// Work run inside one store transaction.
///
/// `run` may be invoked several times; each call gets a new transaction.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    type Output: Send;

    async fn run(&self, tx: &mut dyn TransactionScope) -> IngestResult<WorkOutcome<Self::Output>>;
}

/// Runs units of work against a store, retrying retriable failures.
#[derive(Clone)]
pub struct RetryingExecutor {
    store: Arc<dyn TransactionalStore>,
    retry: RetryConfig,
    attempt_timeout: Duration,
}

impl RetryingExecutor {
    /// Executor with the given retry policy and the preset attempt limit.
    pub fn new(store: Arc<dyn TransactionalStore>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry,
            attempt_timeout: resilience::store_transaction_config().timeout.duration,
        }
    }

    /// Executor using the store transaction preset.
    pub fn with_defaults(store: Arc<dyn TransactionalStore>) -> Self {
        Self::new(store, resilience::store_transaction_config().retry)
    }

    /// Limit on one attempt, from `begin` through `commit`.
    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = limit;
        self
    }

    pub fn store(&self) -> &Arc<dyn TransactionalStore> {
        &self.store
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Run `work` until it commits, skips, aborts or fails non-retriably.
    ///
    /// Exhausting retries yields [`IngestError::RetriesExhausted`] carrying the
    /// last failure; a non-retriable failure is returned as is.
    pub async fn run<W: UnitOfWork>(
        &self,
        mode: TxMode,
        work: &W,
    ) -> IngestResult<Execution<W::Output>> {
        let attempts = AtomicU32::new(0);

        with_retry_if(&self.retry, IngestError::is_retriable, || {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            async move {
                if attempt > 1 {
                    debug!(attempt, mode = %mode, "Re-running unit of work");
                }
                with_timeout_result(self.attempt_timeout, self.attempt(mode, work))
                    .await
                    .map_err(|e| match e {
                        TimeoutError::Elapsed(limit) => IngestError::transient(format!(
                            "transaction attempt exceeded {:?}",
                            limit
                        )),
                        TimeoutError::OperationFailed(e) => e,
                    })
            }
        })
        .await
        .map_err(IngestError::from)
    }

    async fn attempt<W: UnitOfWork>(
        &self,
        mode: TxMode,
        work: &W,
    ) -> IngestResult<Execution<W::Output>> {
        let mut tx = self.store.begin(mode).await?;

        match work.run(tx.as_mut()).await {
            Ok(WorkOutcome::Apply(value)) => {
                tx.commit().await?;
                Ok(Execution::Applied(value))
            }
            Ok(WorkOutcome::Skip(value)) => {
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "Rollback after skip failed");
                }
                Ok(Execution::Skipped(value))
            }
            Ok(WorkOutcome::Abort(reason)) => {
                rollback_quietly(tx.as_mut()).await;
                Err(IngestError::Aborted(reason))
            }
            Err(e) => {
                rollback_quietly(tx.as_mut()).await;
                Err(e)
            }
        }
    }
}

async fn rollback_quietly(tx: &mut dyn TransactionScope) {
    if let Err(e) = tx.rollback().await {
        debug!(error = %e, "Rollback failed; transaction discarded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, Statement};
    use std::time::Duration;

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            jitter: false,
            ..Default::default()
        }
    }

    async fn executor(max_retries: u32) -> RetryingExecutor {
        let store = SqliteStore::in_memory().await.unwrap();
        let executor = RetryingExecutor::new(Arc::new(store), fast_retry(max_retries));
        executor
            .run(TxMode::SerializableReadWrite, &Exec("CREATE TABLE t (id BIGINT PRIMARY KEY)"))
            .await
            .unwrap();
        executor
    }

    struct Exec(&'static str);

    #[async_trait]
    impl UnitOfWork for Exec {
        type Output = ();

        async fn run(&self, tx: &mut dyn TransactionScope) -> IngestResult<WorkOutcome<()>> {
            tx.execute(&Statement::new(self.0)).await?;
            Ok(WorkOutcome::Apply(()))
        }
    }

    /// Inserts a row, then fails transiently until `failures` attempts have passed.
    struct FlakyInsert {
        calls: AtomicU32,
        failures: u32,
        outcome: fn(i64) -> WorkOutcome<i64>,
    }

    impl FlakyInsert {
        fn new(failures: u32, outcome: fn(i64) -> WorkOutcome<i64>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                outcome,
            }
        }
    }

    #[async_trait]
    impl UnitOfWork for FlakyInsert {
        type Output = i64;

        async fn run(&self, tx: &mut dyn TransactionScope) -> IngestResult<WorkOutcome<i64>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tx.execute(&Statement::new("INSERT INTO t (id) VALUES ($1)").bind(1i64))
                .await?;
            if call < self.failures {
                return Err(IngestError::transient("serialization conflict"));
            }
            Ok((self.outcome)(1))
        }
    }

    async fn count(executor: &RetryingExecutor) -> i64 {
        let mut tx = executor.store().begin(TxMode::SnapshotReadOnly).await.unwrap();
        let row = tx
            .fetch_optional(&Statement::new("SELECT COUNT(*) FROM t"))
            .await
            .unwrap()
            .unwrap();
        row.get_i64(0).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_apply_commits() {
        let executor = executor(3).await;
        let work = FlakyInsert::new(0, WorkOutcome::Apply);

        let result = executor.run(TxMode::SerializableReadWrite, &work).await.unwrap();

        assert_eq!(result, Execution::Applied(1));
        assert_eq!(count(&executor).await, 1);
    }

    #[tokio::test]
    async fn test_skip_rolls_back() {
        let executor = executor(3).await;
        let work = FlakyInsert::new(0, WorkOutcome::Skip);

        let result = executor.run(TxMode::SerializableReadWrite, &work).await.unwrap();

        assert_eq!(result, Execution::Skipped(1));
        assert_eq!(count(&executor).await, 0);
    }

    #[tokio::test]
    async fn test_abort_rolls_back_and_is_not_retried() {
        let executor = executor(3).await;
        let work = FlakyInsert::new(0, |_| WorkOutcome::Abort("rejected".into()));

        let err = executor.run(TxMode::SerializableReadWrite, &work).await.unwrap_err();

        assert!(matches!(err, IngestError::Aborted(ref r) if r == "rejected"));
        assert_eq!(work.calls.load(Ordering::SeqCst), 1);
        assert_eq!(count(&executor).await, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_from_scratch() {
        let executor = executor(3).await;
        let work = FlakyInsert::new(2, WorkOutcome::Apply);

        let result = executor.run(TxMode::SerializableReadWrite, &work).await.unwrap();

        // Failed attempts were rolled back, so the primary key never collided
        assert!(result.is_applied());
        assert_eq!(work.calls.load(Ordering::SeqCst), 3);
        assert_eq!(count(&executor).await, 1);
    }

    /// Inserts a row, then stalls on the first `stalls` calls.
    struct StallingInsert {
        calls: AtomicU32,
        stalls: u32,
    }

    impl StallingInsert {
        fn new(stalls: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                stalls,
            }
        }
    }

    #[async_trait]
    impl UnitOfWork for StallingInsert {
        type Output = ();

        async fn run(&self, tx: &mut dyn TransactionScope) -> IngestResult<WorkOutcome<()>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tx.execute(&Statement::new("INSERT INTO t (id) VALUES ($1)").bind(1i64))
                .await?;
            if call < self.stalls {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(WorkOutcome::Apply(()))
        }
    }

    #[tokio::test]
    async fn test_attempt_over_time_limit_is_rolled_back_and_retried() {
        let executor = executor(3)
            .await
            .with_attempt_timeout(Duration::from_millis(50));
        let work = StallingInsert::new(1);

        let result = executor.run(TxMode::SerializableReadWrite, &work).await.unwrap();

        // The stalled insert was discarded, so the retry did not collide with it
        assert!(result.is_applied());
        assert_eq!(work.calls.load(Ordering::SeqCst), 2);
        assert_eq!(count(&executor).await, 1);
    }

    #[tokio::test]
    async fn test_attempt_time_limit_exhausts_retries() {
        let executor = executor(1)
            .await
            .with_attempt_timeout(Duration::from_millis(20));
        let work = StallingInsert::new(u32::MAX);

        let err = executor.run(TxMode::SerializableReadWrite, &work).await.unwrap_err();

        match err {
            IngestError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*source, IngestError::Transient(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(count(&executor).await, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_error() {
        let executor = executor(2).await;
        let work = FlakyInsert::new(u32::MAX, WorkOutcome::Apply);

        let err = executor.run(TxMode::SerializableReadWrite, &work).await.unwrap_err();

        match err {
            IngestError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, IngestError::Transient(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(count(&executor).await, 0);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let executor = executor(0).await;
        let work = FlakyInsert::new(1, WorkOutcome::Apply);

        let err = executor.run(TxMode::SerializableReadWrite, &work).await.unwrap_err();

        assert!(matches!(err, IngestError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(work.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retriable_error_returns_immediately() {
        let executor = executor(5).await;
        let work = Exec("INSERT INTO missing_table (id) VALUES (1)");

        let err = executor.run(TxMode::SerializableReadWrite, &work).await.unwrap_err();

        assert!(matches!(err, IngestError::Database(_)));
        assert!(!err.is_retriable());
    }
}
