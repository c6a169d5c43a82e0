//! The pluggable log store surface.
//!
//! Modeled as three object-safe async traits so the broker can hold
//! `Arc<dyn LogStore>` and cache `Arc<dyn LogPublisher>` /
//! `Box<dyn LogReader>` handles per connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ledgermq_core::{EntryId, LedgerId};

use crate::error::StoreResult;

/// Position of one entry: which ledger, which entry within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryPosition {
    pub ledger: LedgerId,
    pub entry: EntryId,
}

impl EntryPosition {
    /// Creates a position from raw components.
    #[must_use]
    pub const fn new(ledger: u64, entry: u64) -> Self {
        Self {
            ledger: LedgerId::new(ledger),
            entry: EntryId::new(entry),
        }
    }
}

impl PartialOrd for EntryPosition {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntryPosition {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ledger, self.entry).cmp(&(other.ledger, other.entry))
    }
}

/// Where a new reader starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// First available entry.
    Earliest,
    /// One past the last available entry (only new arrivals are delivered).
    Latest,
    /// An exact position; `inclusive` controls whether the entry at the
    /// position itself is delivered.
    At {
        position: EntryPosition,
        inclusive: bool,
    },
}

/// One entry handed back by a reader.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub position: EntryPosition,
    pub payload: Bytes,
    /// Store-assigned publish time, unix millis.
    pub event_time: i64,
}

/// Tuning for a publisher handle.
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    /// Name advertised to the store (diagnostics only).
    pub name: String,
    /// How long `send` waits for acknowledgement.
    pub send_timeout: Duration,
    /// Whether the store may batch entries before acknowledging.
    pub batching: bool,
    /// Max linger before a batch flushes (batching publishers only).
    pub batching_max_delay: Duration,
    /// Max entries per batch (batching publishers only).
    pub batching_max_messages: usize,
    /// Bound on unacknowledged in-flight entries.
    pub max_pending: usize,
}

impl PublisherOptions {
    /// Options for the single-send path: no batching, bounded pending.
    #[must_use]
    pub fn immediate(name: String) -> Self {
        Self {
            name,
            send_timeout: ledgermq_core::limits::SEND_TIMEOUT,
            batching: false,
            batching_max_delay: Duration::ZERO,
            batching_max_messages: 1,
            max_pending: ledgermq_core::limits::MAX_PENDING_MESSAGES,
        }
    }

    /// Options for the batch-send path.
    #[must_use]
    pub fn batching(name: String) -> Self {
        Self {
            name,
            send_timeout: ledgermq_core::limits::SEND_TIMEOUT,
            batching: true,
            batching_max_delay: ledgermq_core::limits::BATCH_MAX_DELAY,
            batching_max_messages: ledgermq_core::limits::BATCH_MAX_MESSAGES,
            max_pending: ledgermq_core::limits::MAX_PENDING_MESSAGES,
        }
    }
}

/// Tuning for a reader handle.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Name advertised to the store (diagnostics only).
    pub name: String,
    /// How many entries the store may prefetch for this reader.
    pub receiver_queue_size: usize,
}

/// Cluster-advertised data of one broker.
#[derive(Debug, Clone, Default)]
pub struct BrokerLocalData {
    /// Listener name → advertised `host:port` endpoint.
    pub advertised_listeners: HashMap<String, String>,
}

/// A publisher handle bound to one partitioned topic.
#[async_trait]
pub trait LogPublisher: Send + Sync {
    /// Appends one payload and waits for acknowledgement up to the
    /// publisher's send timeout.
    async fn send(&self, payload: Bytes) -> StoreResult<EntryPosition>;

    /// Releases the handle. Idempotent.
    async fn close(&self);

    /// The partitioned topic this handle writes to.
    fn topic(&self) -> &str;
}

/// A reader handle bound to one partitioned topic.
///
/// Readers are single-owner (`&mut self`): the pull path serializes access
/// per handle by construction.
#[async_trait]
pub trait LogReader: Send {
    /// Returns the next entry, waiting up to `deadline` for one to arrive.
    /// `Ok(None)` means the deadline passed with nothing to deliver.
    async fn read_next(&mut self, deadline: Duration) -> StoreResult<Option<StoredEntry>>;

    /// Repositions the reader at an exact position (inclusive).
    async fn seek(&mut self, position: EntryPosition) -> StoreResult<()>;

    /// Repositions the reader at the first entry with
    /// `event_time >= timestamp`.
    async fn seek_timestamp(&mut self, timestamp: i64) -> StoreResult<()>;

    /// False once the handle has been severed from the store.
    fn is_connected(&self) -> bool;
}

/// The log store itself plus its cluster view.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Opens a publisher on a partitioned topic.
    async fn create_publisher(
        &self,
        topic: &str,
        options: PublisherOptions,
    ) -> StoreResult<Arc<dyn LogPublisher>>;

    /// Opens a reader on a partitioned topic.
    async fn create_reader(
        &self,
        topic: &str,
        start: StartPosition,
        options: ReaderOptions,
    ) -> StoreResult<Box<dyn LogReader>>;

    /// Addresses of the live brokers in a cluster.
    async fn active_brokers(&self, cluster: &str) -> StoreResult<Vec<String>>;

    /// Advertised listener data of one broker.
    async fn broker_data(&self, broker: &str) -> StoreResult<BrokerLocalData>;

    /// Partition → owning broker for a partitioned-topic family (base
    /// backend name, no partition suffix). Empty when the topic is unknown.
    async fn partition_owners(&self, topic: &str) -> StoreResult<HashMap<u32, String>>;

    /// First and last entry positions of one partitioned topic, or `None`
    /// when it is empty.
    ///
    /// # Errors
    ///
    /// `TopicNotFound` when the partition has never been created.
    async fn partition_bounds(
        &self,
        topic: &str,
    ) -> StoreResult<Option<(EntryPosition, EntryPosition)>>;
}
