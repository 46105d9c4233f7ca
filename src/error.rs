//! Error types for redq
//!
//! Three tiers of failure:
//! - Expected domain outcomes (`NotFound`, `ConsumingStopped`) returned
//!   directly to callers
//! - Transient store errors, reported on the error channel and retried
//! - Fatal API misuse, returned synchronously and never retried

use thiserror::Error;

/// Errors from the backing store
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Connecting to the store failed
    #[error("Failed to connect to store at '{url}': {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// A store command failed
    #[error("Store command failed: {0}")]
    CommandFailed(String),

    /// A key holds a value of the wrong kind for the requested operation
    #[error("Key '{key}' holds the wrong kind of value")]
    WrongType { key: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::CommandFailed(err.to_string())
    }
}

/// Top-level error type for queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    /// StartConsuming was called while a consume loop is already active
    #[error("Queue is already consuming")]
    AlreadyConsuming,

    /// A consumer operation requires an active consume loop
    #[error("Queue is not consuming")]
    NotConsuming,

    /// The queue can only be destroyed with no consumers attached
    #[error("Queue still has consumers attached")]
    NoConsumers,

    /// The payload was not found in the unacked list (duplicate ack, or
    /// already recovered by the cleaner)
    #[error("Delivery not found")]
    NotFound,

    /// The operation was abandoned because consuming stopped
    #[error("Consuming has been stopped")]
    ConsumingStopped,

    /// Payload rejected before reaching the store
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Configuration rejected at connection open
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Events reported on a connection's error channel.
///
/// Sends never block; when the receiver lags, events are dropped. Consumers
/// of the channel should drain continuously.
#[derive(Debug, Clone)]
pub enum ErrorEvent {
    /// A heartbeat write failed; retried on the next tick
    Heartbeat {
        /// Consecutive failed attempts
        attempt: u64,
        /// Underlying store error
        cause: StoreError,
    },

    /// The prefetch loop failed to move a payload from ready to unacked
    Consume {
        /// Queue the loop was consuming
        queue: String,
        /// Underlying store error
        cause: StoreError,
    },

    /// A delivery finalization op failed; retried after a fixed backoff
    Delivery {
        /// Clear payload of the affected delivery
        payload: String,
        /// Queue the delivery belongs to
        queue: String,
        /// Consecutive failed attempts
        attempt: u64,
        /// Underlying store error
        cause: StoreError,
    },
}

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
