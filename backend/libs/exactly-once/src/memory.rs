//! In-process partitioned log.
//!
//! Behaves like the durable log the pipeline is written against: keys map to
//! partitions by a stable hash, offsets start at 0 per partition, duplicate
//! sequence numbers per key are collapsed, acknowledgement is cumulative and
//! [`MemoryLog::reconnect`] redelivers everything past the last acknowledged
//! offset. Failures and redeliveries can be injected for tests.

use crate::error::{IngestError, IngestResult};
use crate::log::{LogMessage, LogReader, LogWriter};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct PartitionState {
    messages: Vec<LogMessage>,
    /// Index of the next message to deliver
    cursor: usize,
    /// One past the highest acknowledged offset
    committed: i64,
}

#[derive(Default)]
struct Inner {
    partitions: Vec<PartitionState>,
    /// Injected deliveries, served before the partitions
    pending: VecDeque<LogMessage>,
    next_partition: usize,
    /// partition key -> sequence number -> offset
    sequences: HashMap<String, HashMap<i64, i64>>,
    fail_publishes: u32,
    fail_flushes: u32,
    fail_acknowledgements: u32,
    acknowledgements: u64,
}

pub struct MemoryLog {
    inner: Mutex<Inner>,
    notify: Notify,
    deduplicate: bool,
}

impl MemoryLog {
    pub fn new(partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let inner = Inner {
            partitions: (0..partitions).map(|_| PartitionState::default()).collect(),
            ..Default::default()
        };

        Self {
            inner: Mutex::new(inner),
            notify: Notify::new(),
            deduplicate: true,
        }
    }

    /// Accept every publish, even a repeated sequence number.
    pub fn without_deduplication(mut self) -> Self {
        self.deduplicate = false;
        self
    }

    pub fn partition_count(&self) -> usize {
        self.inner.lock().partitions.len()
    }

    /// Partition that messages for `partition_key` land on.
    pub fn partition_for(&self, partition_key: &str) -> i64 {
        stable_partition(partition_key, self.partition_count())
    }

    /// Total messages stored across partitions.
    pub fn len(&self) -> usize {
        self.inner.lock().partitions.iter().map(|p| p.messages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored messages of one partition in offset order.
    pub fn messages(&self, partition: i64) -> Vec<LogMessage> {
        let inner = self.inner.lock();
        usize::try_from(partition)
            .ok()
            .and_then(|p| inner.partitions.get(p))
            .map(|p| p.messages.clone())
            .unwrap_or_default()
    }

    /// Highest acknowledged offset of `partition`, if any.
    pub fn acknowledged_offset(&self, partition: i64) -> Option<i64> {
        let inner = self.inner.lock();
        usize::try_from(partition)
            .ok()
            .and_then(|p| inner.partitions.get(p))
            .filter(|p| p.committed > 0)
            .map(|p| p.committed - 1)
    }

    /// Drop the session: undelivered injections are lost and every partition
    /// restarts right after its last acknowledged offset.
    pub fn reconnect(&self) {
        let mut inner = self.inner.lock();
        inner.pending.clear();
        for partition in inner.partitions.iter_mut() {
            partition.cursor = usize::try_from(partition.committed).unwrap_or(0);
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Deliver `message` next, ahead of the partitions.
    pub fn inject(&self, message: LogMessage) {
        self.inner.lock().pending.push_back(message);
        self.notify.notify_waiters();
    }

    /// Deliver the stored message at `offset` of `partition` once more.
    pub fn redeliver(&self, partition: i64, offset: i64) -> IngestResult<()> {
        let message = self
            .messages(partition)
            .into_iter()
            .find(|m| m.offset == offset)
            .ok_or_else(|| {
                IngestError::Log(format!("no message at {}/{}", partition, offset))
            })?;
        self.inject(message);
        Ok(())
    }

    /// Successful acknowledgements so far, including repeated ones.
    pub fn acknowledgement_count(&self) -> u64 {
        self.inner.lock().acknowledgements
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.lock().fail_publishes = count;
    }

    pub fn fail_next_flushes(&self, count: u32) {
        self.inner.lock().fail_flushes = count;
    }

    pub fn fail_next_acknowledgements(&self, count: u32) {
        self.inner.lock().fail_acknowledgements = count;
    }

    fn try_next(&self) -> Option<LogMessage> {
        let mut inner = self.inner.lock();

        if let Some(message) = inner.pending.pop_front() {
            return Some(message);
        }

        let count = inner.partitions.len();
        for step in 0..count {
            let index = (inner.next_partition + step) % count;
            let partition = &mut inner.partitions[index];
            if let Some(message) = partition.messages.get(partition.cursor).cloned() {
                partition.cursor += 1;
                inner.next_partition = (index + 1) % count;
                return Some(message);
            }
        }

        None
    }
}

#[async_trait]
impl LogWriter for MemoryLog {
    async fn publish(
        &self,
        partition_key: &str,
        sequence_number: i64,
        payload: &[u8],
    ) -> IngestResult<i64> {
        let mut inner = self.inner.lock();

        if inner.fail_publishes > 0 {
            inner.fail_publishes -= 1;
            return Err(IngestError::LogUnavailable("injected publish failure".into()));
        }

        if self.deduplicate {
            if let Some(offset) = inner
                .sequences
                .get(partition_key)
                .and_then(|seqs| seqs.get(&sequence_number))
            {
                return Ok(*offset);
            }
        }

        let partition = stable_partition(partition_key, inner.partitions.len());
        let state = &mut inner.partitions[partition as usize];
        let offset = state.messages.len() as i64;
        state.messages.push(LogMessage {
            partition,
            partition_key: partition_key.to_string(),
            sequence_number,
            offset,
            payload: payload.to_vec(),
        });
        inner
            .sequences
            .entry(partition_key.to_string())
            .or_default()
            .insert(sequence_number, offset);

        drop(inner);
        self.notify.notify_waiters();
        Ok(offset)
    }

    async fn flush(&self) -> IngestResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail_flushes > 0 {
            inner.fail_flushes -= 1;
            return Err(IngestError::LogUnavailable("injected flush failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LogReader for MemoryLog {
    async fn receive(&self, timeout: Duration) -> IngestResult<Option<LogMessage>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register before checking so a publish in between still wakes us
            let notified = self.notify.notified();

            if let Some(message) = self.try_next() {
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn acknowledge(&self, message: &LogMessage) -> IngestResult<()> {
        let mut inner = self.inner.lock();

        if inner.fail_acknowledgements > 0 {
            inner.fail_acknowledgements -= 1;
            return Err(IngestError::LogUnavailable(
                "injected acknowledgement failure".into(),
            ));
        }

        let index = usize::try_from(message.partition)
            .ok()
            .filter(|p| *p < inner.partitions.len())
            .ok_or_else(|| {
                IngestError::Log(format!("unknown partition {}", message.partition))
            })?;
        let state = &mut inner.partitions[index];
        state.committed = state.committed.max(message.offset + 1);
        inner.acknowledgements += 1;
        Ok(())
    }
}

/// FNV-1a, stable across processes and Rust versions.
fn stable_partition(partition_key: &str, partitions: usize) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in partition_key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % partitions.max(1) as u64) as i64
}
