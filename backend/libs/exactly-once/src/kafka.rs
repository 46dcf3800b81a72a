//! Kafka-backed log collaborators.
//!
//! The writer uses an idempotent producer, so broker-side retries never
//! duplicate a record. Sequence numbers travel in the `sequence_number` header
//! for observability; Kafka does not collapse an application-level republish
//! of the same sequence number, which the consumer's dedup check absorbs.
//!
//! The reader never auto-commits. Acknowledging a message synchronously
//! commits `offset + 1` for its partition.

use crate::error::{IngestError, IngestResult};
use crate::log::{LogMessage, LogReader, LogWriter};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SEQUENCE_HEADER: &str = "sequence_number";
const PRODUCER_ID_HEADER: &str = "producer_id";

/// Publishes chunks to one topic.
pub struct KafkaLogWriter {
    producer: FutureProducer,
    topic: String,
    producer_id: String,
    delivery_timeout: Duration,
}

impl KafkaLogWriter {
    /// Connect an idempotent, `acks=all` producer.
    pub fn connect(brokers: &str, topic: &str, producer_id: &str) -> IngestResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", producer_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("message.timeout.ms", "30000")
            .create()?;

        info!(topic = %topic, producer_id = %producer_id, "Kafka producer created");
        Ok(Self::from_producer(producer, topic, producer_id))
    }

    /// Wrap an existing producer (MUST have enable.idempotence=true).
    pub fn from_producer(producer: FutureProducer, topic: &str, producer_id: &str) -> Self {
        Self {
            producer,
            topic: topic.to_string(),
            producer_id: producer_id.to_string(),
            delivery_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl LogWriter for KafkaLogWriter {
    async fn publish(
        &self,
        partition_key: &str,
        sequence_number: i64,
        payload: &[u8],
    ) -> IngestResult<i64> {
        let sequence = sequence_number.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: SEQUENCE_HEADER,
                value: Some(sequence.as_bytes()),
            })
            .insert(Header {
                key: PRODUCER_ID_HEADER,
                value: Some(self.producer_id.as_bytes()),
            });

        let record = FutureRecord::to(&self.topic)
            .key(partition_key)
            .payload(payload)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| IngestError::from(err))?;

        debug!(topic = %self.topic, partition, offset, sequence_number, "Record delivered");
        Ok(offset)
    }

    async fn flush(&self) -> IngestResult<()> {
        let producer = self.producer.clone();
        let timeout = self.delivery_timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| IngestError::Other(e.into()))??;
        Ok(())
    }
}

/// Consumes one topic as part of a consumer group.
pub struct KafkaLogReader {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl KafkaLogReader {
    pub fn connect(brokers: &str, group_id: &str, topic: &str) -> IngestResult<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .create()?;
        consumer.subscribe(&[topic])?;

        info!(topic = %topic, group_id = %group_id, "Kafka consumer subscribed");
        Ok(Self {
            consumer: Arc::new(consumer),
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl LogReader for KafkaLogReader {
    async fn receive(&self, timeout: Duration) -> IngestResult<Option<LogMessage>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(message)) => Ok(Some(to_log_message(&message))),
        }
    }

    async fn acknowledge(&self, message: &LogMessage) -> IngestResult<()> {
        let partition = i32::try_from(message.partition)
            .map_err(|_| IngestError::Log(format!("partition out of range: {}", message.partition)))?;

        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(&self.topic, partition, Offset::Offset(message.offset + 1))?;

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|e| IngestError::Other(e.into()))??;
        Ok(())
    }
}

/// Messages without a sequence header (foreign producers) get -1.
fn to_log_message(message: &BorrowedMessage<'_>) -> LogMessage {
    let sequence_number = message
        .headers()
        .and_then(|headers| {
            headers
                .iter()
                .find(|header| header.key == SEQUENCE_HEADER)
                .and_then(|header| header.value)
                .and_then(|value| std::str::from_utf8(value).ok())
                .and_then(|value| value.parse().ok())
        })
        .unwrap_or(-1);

    LogMessage {
        partition: i64::from(message.partition()),
        partition_key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .unwrap_or_default(),
        sequence_number,
        offset: message.offset(),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}
