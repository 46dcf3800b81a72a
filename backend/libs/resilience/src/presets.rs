/// Preset configurations for the collaborators of the ingest pipeline
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use std::time::Duration;

/// Configuration bundle for a collaborator type
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub timeout: TimeoutConfig,
    pub retry: RetryConfig,
}

/// Store transactions (check offset + business write + advance offset)
///
/// - Timeout: 10s (one message per transaction should be fast)
/// - Retry: 5 attempts, short backoff; serialization conflicts clear quickly
///
/// Retrying is safe here: a replayed transaction re-reads the dedup boundary.
pub fn store_transaction_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(10),
        },
        retry: RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        },
    }
}

/// Log publish + flush
///
/// - Timeout: 30s (delivery timeout of an acks=all producer)
/// - Retry: 3 attempts (idempotent: same sequence number on every attempt)
pub fn log_publish_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(30),
        },
        retry: RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        },
    }
}

/// Log acknowledgement (offset commit)
///
/// - Timeout: 10s
/// - Retry: 5 attempts; an unacknowledged message is redelivered and skipped,
///   so exhausting retries costs a redelivery, never a duplicate
pub fn log_acknowledge_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(10),
        },
        retry: RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        },
    }
}
