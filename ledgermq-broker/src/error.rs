//! Error types for the broker.

use ledgermq_backend::StoreError;
use ledgermq_core::CoreError;
use thiserror::Error;

use crate::remoting::code::response;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised while serving the legacy protocol.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// I/O error on the client connection.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame that cannot be decoded (bad lengths, unknown serialization).
    #[error("frame error: {message}")]
    Frame { message: String },

    /// A typed command header missing or malformed fields.
    #[error("header error: {message}")]
    Header { message: String },

    /// JSON (de)serialization failure of a header or body.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Domain-layer failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Backend failure that escaped the retry-mapping layers.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The client connection is gone.
    #[error("connection closed")]
    ConnectionClosed,
}

impl BrokerError {
    /// Creates a frame error.
    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Creates a header error.
    pub fn header(message: impl Into<String>) -> Self {
        Self::Header {
            message: message.into(),
        }
    }

    /// The wire response code this error maps to when it escapes a handler.
    #[must_use]
    pub const fn response_code(&self) -> i32 {
        match self {
            Self::Frame { .. } | Self::Header { .. } | Self::Json(_) => response::SYSTEM_ERROR,
            Self::Store(StoreError::TopicNotFound { .. }) => response::TOPIC_NOT_EXIST,
            _ => response::SYSTEM_ERROR,
        }
    }

    /// Fatal errors close the connection instead of producing a response
    /// (required-invariant violations, codec overflow).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Core(CoreError::OffsetOverflow { .. }))
    }
}
