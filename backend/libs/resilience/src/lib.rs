//! Resilience patterns for log and store access
//!
//! This library provides the retry and timeout building blocks used by the
//! exactly-once pipeline:
//! - **Retry**: Exponential backoff with jitter, restricted to failures the caller
//!   classifies as retriable
//! - **Timeout**: Enforces time limits on blocking collaborator calls
//! - **Preset Configurations**: Pre-tuned settings for store transactions, log
//!   publishing and log acknowledgement
//!
//! # Example: Retry a transaction on serialization failures only
//!
//! ```rust,no_run
//! use resilience::{presets, retry::with_retry_if};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = presets::store_transaction_config();
//!
//!     let result = with_retry_if(
//!         &config.retry,
//!         |err: &String| err.contains("serialization"),
//!         || async {
//!             // Your transaction here
//!             Ok::<_, String>(())
//!         },
//!     )
//!     .await;
//! }
//! ```
//!
//! # Example: Log flush with timeout
//!
//! ```rust,no_run
//! use resilience::{presets, timeout::with_timeout_result};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = presets::log_publish_config();
//!
//!     let result = with_timeout_result(
//!         config.timeout.duration,
//!         async {
//!             // Your flush call
//!             Ok::<_, String>(())
//!         }
//!     ).await;
//! }
//! ```

pub mod presets;
pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use presets::{
    log_acknowledge_config, log_publish_config, store_transaction_config, ServiceConfig,
};
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
pub use timeout::{with_timeout, with_timeout_result, TimeoutConfig, TimeoutError};
