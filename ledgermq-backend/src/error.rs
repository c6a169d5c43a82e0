//! Error types for the log store boundary.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors crossing the log store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The partitioned topic does not exist in the store.
    #[error("topic not found: {topic}")]
    TopicNotFound { topic: String },

    /// A publish did not confirm within its deadline.
    #[error("publish timed out on {topic}")]
    PublishTimeout { topic: String },

    /// The publisher or reader was closed underneath the caller.
    #[error("handle closed for {topic}")]
    HandleClosed { topic: String },

    /// The store rejected the payload.
    #[error("payload rejected: {reason}")]
    PayloadRejected { reason: String },

    /// The requested broker is not part of the cluster view.
    #[error("unknown broker: {broker}")]
    UnknownBroker { broker: String },

    /// Any other backend failure.
    #[error("store error: {0}")]
    Internal(String),
}
