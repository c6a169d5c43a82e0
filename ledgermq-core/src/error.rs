//! Error types for the core domain layer.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced by the pure domain layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A ledger, entry, or partition component does not fit the bit width
    /// allotted to it in the packed queue offset. This is fatal for the
    /// connection that produced it; offsets never wrap.
    #[error("offset component out of range: ledger={ledger} entry={entry} partition={partition}")]
    OffsetOverflow {
        ledger: u64,
        entry: u64,
        partition: u32,
    },

    /// The offset is a sentinel (earliest/latest) and carries no position.
    #[error("offset {0} is a sentinel, not an exact position")]
    OffsetNotExact(i64),

    /// A topic string that cannot be parsed into a legacy topic.
    #[error("invalid topic name: {0}")]
    InvalidTopic(String),

    /// A message frame that cannot be decoded.
    #[error("malformed message frame: {0}")]
    MalformedFrame(String),

    /// A subscription expression that cannot be compiled.
    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),

    /// Message encoding failed (component too large for its length field).
    #[error("message encode error: {0}")]
    Encode(String),
}
