//! Service configuration, read from `INGEST_*` environment variables.
//!
//! `.env` is loaded first if present. Every setting except the source path
//! has a default; the source path is only required by modes that produce.

use exactly_once::{ConsumerOptions, FailurePolicy, ProducerOptions};
use resilience::RetryConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "INGEST_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read INGEST_* environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which durable log the pipeline talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    Kafka,
    /// In-process log; producer and consumer must share one process (`run`)
    Memory,
}

impl Default for LogBackend {
    fn default() -> Self {
        if cfg!(feature = "kafka") {
            LogBackend::Kafka
        } else {
            LogBackend::Memory
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// File to ingest; also the producer's resume key
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub log_backend: LogBackend,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_producer_id")]
    pub producer_id: String,
    #[serde(default = "default_kafka_brokers")]
    pub kafka_brokers: String,
    /// Partitions of the in-process log
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default)]
    pub max_messages: Option<u64>,
    #[serde(default = "default_true")]
    pub stop_when_idle: bool,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Keep healthy partitions running when one fails permanently
    #[serde(default)]
    pub halt_partition_only: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub initial_backoff_ms: Option<u64>,
}

fn default_chunk_size() -> usize {
    1024
}

fn default_topic() -> String {
    "file_topic".to_string()
}

fn default_consumer_group() -> String {
    "file_consumer".to_string()
}

fn default_producer_id() -> String {
    "producer-file".to_string()
}

fn default_kafka_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_partitions() -> usize {
    2
}

fn default_receive_timeout_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    64
}

impl IngestConfig {
    /// Load from the process environment (and `.env`), then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::prefixed(ENV_PREFIX).from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from explicit `INGEST_*` pairs, then validate.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::prefixed(ENV_PREFIX).from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("CHUNK_SIZE must be greater than 0".into()));
        }
        if self.receive_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "RECEIVE_TIMEOUT_MS must be greater than 0".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "CHANNEL_CAPACITY must be greater than 0".into(),
            ));
        }
        if self.partitions == 0 {
            return Err(ConfigError::Invalid("PARTITIONS must be greater than 0".into()));
        }
        if let Some(path) = &self.source_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("SOURCE_PATH must not be empty".into()));
            }
        }
        if self.log_backend == LogBackend::Kafka && self.kafka_brokers.trim().is_empty() {
            return Err(ConfigError::Invalid("KAFKA_BROKERS must not be empty".into()));
        }
        Ok(())
    }

    pub fn source_path(&self) -> Result<&PathBuf, ConfigError> {
        self.source_path
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("INGEST_SOURCE_PATH is required".to_string()))
    }

    /// Store retry policy: the transaction preset with env overrides applied.
    pub fn retry_config(&self) -> RetryConfig {
        let mut retry = resilience::store_transaction_config().retry;
        if let Some(max_retries) = self.max_retries {
            retry = retry.with_max_retries(max_retries);
        }
        if let Some(ms) = self.initial_backoff_ms {
            retry = retry.with_initial_backoff(Duration::from_millis(ms));
        }
        retry
    }

    pub fn producer_options(&self) -> Result<ProducerOptions, ConfigError> {
        let source = self.source_path()?.display().to_string();
        Ok(ProducerOptions::new(
            source.clone(),
            source,
            self.producer_id.clone(),
        ))
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            max_messages: self.max_messages,
            stop_when_idle: self.stop_when_idle,
            channel_capacity: self.channel_capacity,
            failure_policy: if self.halt_partition_only {
                FailurePolicy::HaltPartition
            } else {
                FailurePolicy::HaltConsumer
            },
            ..Default::default()
        }
    }
}
