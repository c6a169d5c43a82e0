//! Shared tuning constants.
//!
//! Values that both the broker pipelines and the session layer rely on.
//! Anything a deployment might reasonably tune lives in the broker config
//! instead; these are protocol- or contract-level constants.

use std::time::Duration;

/// Longest topic name the legacy protocol accepts (length fits one byte in
/// the store frame).
pub const MAX_TOPIC_LENGTH: usize = 127;

/// Partition count of every per-group dead-letter topic.
pub const DLQ_NUMS_PER_GROUP: u32 = 1;

/// How long a publish waits for backend acknowledgement.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-message deadline for backend reads (pull and lookup paths).
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Batch publisher: max time entries linger before the backend flushes them.
pub const BATCH_MAX_DELAY: Duration = Duration::from_millis(100);

/// Batch publisher: max entries per backend batch.
pub const BATCH_MAX_MESSAGES: usize = 20;

/// Publisher: bounded in-flight (unacknowledged) entry count.
pub const MAX_PENDING_MESSAGES: usize = 500;

/// Negative pull cache: max tracked (group, topic, queue) keys.
pub const PULL_CACHE_MAX_ENTRIES: usize = 4096;

/// Negative pull cache: how long a "nothing owned here" marker holds.
pub const PULL_CACHE_TTL: Duration = Duration::from_secs(30);

/// Retry count applied when a consumer group has no explicit override.
pub const DEFAULT_RETRY_MAX_TIMES: i32 = 16;

/// First protocol version whose send-back headers may override the group's
/// retry limit.
pub const VERSION_RETRY_OVERRIDE: i32 = 17;
