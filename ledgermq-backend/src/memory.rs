//! In-memory log store.
//!
//! A complete [`LogStore`] implementation backed by per-topic vectors, with
//! blocking reads (arrival notification with deadline), ledger rollover, a
//! configurable cluster view for route tests, and a publish-failure toggle
//! for error-path tests. This is the store every test in the workspace runs
//! against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::debug;

use crate::api::{
    BrokerLocalData, EntryPosition, LogPublisher, LogReader, LogStore, PublisherOptions,
    ReaderOptions, StartPosition, StoredEntry,
};
use crate::error::{StoreError, StoreResult};

/// Entries per ledger before the store rolls to the next ledger id. Small
/// enough that tests cross ledger boundaries without thousands of entries.
const DEFAULT_ENTRIES_PER_LEDGER: u64 = 512;

#[derive(Default)]
struct TopicState {
    log: Mutex<Vec<StoredEntry>>,
    arrival: Notify,
}

#[derive(Default)]
struct ClusterView {
    brokers: Vec<String>,
    broker_data: HashMap<String, BrokerLocalData>,
    /// Base topic family → partition → owning broker.
    owners: HashMap<String, HashMap<u32, String>>,
}

/// In-memory [`LogStore`].
pub struct MemoryLogStore {
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    cluster: Mutex<ClusterView>,
    entries_per_ledger: u64,
    fail_publishes: Arc<AtomicBool>,
}

impl MemoryLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            cluster: Mutex::new(ClusterView::default()),
            entries_per_ledger: DEFAULT_ENTRIES_PER_LEDGER,
            fail_publishes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a store with a custom ledger rollover interval.
    #[must_use]
    pub fn with_entries_per_ledger(entries_per_ledger: u64) -> Self {
        Self {
            entries_per_ledger: entries_per_ledger.max(1),
            ..Self::new()
        }
    }

    /// Registers a broker in the cluster view.
    pub fn add_broker(&self, address: &str, listeners: &[(&str, &str)]) {
        let mut cluster = self.cluster.lock().expect("cluster lock");
        if !cluster.brokers.iter().any(|b| b == address) {
            cluster.brokers.push(address.to_string());
        }
        let data = cluster.broker_data.entry(address.to_string()).or_default();
        for (name, endpoint) in listeners {
            data.advertised_listeners
                .insert((*name).to_string(), (*endpoint).to_string());
        }
    }

    /// Assigns a partition of a topic family to a broker.
    pub fn set_partition_owner(&self, topic: &str, partition: u32, broker: &str) {
        let mut cluster = self.cluster.lock().expect("cluster lock");
        cluster
            .owners
            .entry(topic.to_string())
            .or_default()
            .insert(partition, broker.to_string());
    }

    /// Creates the topic if it does not exist yet. Reads and bound queries
    /// against a topic that was never created fail with `TopicNotFound`.
    pub fn ensure_topic(&self, topic: &str) {
        self.state_of(topic);
    }

    /// Makes every subsequent publish fail (or succeed again).
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Appends one entry directly; test seeding helper equivalent to a
    /// publisher send.
    ///
    /// # Errors
    ///
    /// Fails when the publish-failure toggle is set.
    pub fn publish(&self, topic: &str, payload: Bytes) -> StoreResult<EntryPosition> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(StoreError::PublishTimeout {
                topic: topic.to_string(),
            });
        }
        Ok(append(&self.state_of(topic), self.entries_per_ledger, payload))
    }

    fn state_of(&self, topic: &str) -> Arc<TopicState> {
        let mut topics = self.topics.lock().expect("topics lock");
        Arc::clone(topics.entry(topic.to_string()).or_default())
    }

    fn existing(&self, topic: &str) -> StoreResult<Arc<TopicState>> {
        let topics = self.topics.lock().expect("topics lock");
        topics
            .get(topic)
            .cloned()
            .ok_or_else(|| StoreError::TopicNotFound {
                topic: topic.to_string(),
            })
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn create_publisher(
        &self,
        topic: &str,
        options: PublisherOptions,
    ) -> StoreResult<Arc<dyn LogPublisher>> {
        debug!(topic, name = %options.name, batching = options.batching, "opening publisher");
        let state = self.state_of(topic);
        Ok(Arc::new(MemoryPublisher {
            topic: topic.to_string(),
            state,
            entries_per_ledger: self.entries_per_ledger,
            fail: Arc::clone(&self.fail_publishes),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_reader(
        &self,
        topic: &str,
        start: StartPosition,
        options: ReaderOptions,
    ) -> StoreResult<Box<dyn LogReader>> {
        debug!(topic, name = %options.name, ?start, "opening reader");
        let state = self.state_of(topic);
        let next_index = {
            let log = state.log.lock().expect("log lock");
            resolve_start(&log, start)
        };
        Ok(Box::new(MemoryReader {
            state,
            next_index,
            connected: true,
        }))
    }

    async fn active_brokers(&self, _cluster: &str) -> StoreResult<Vec<String>> {
        Ok(self.cluster.lock().expect("cluster lock").brokers.clone())
    }

    async fn broker_data(&self, broker: &str) -> StoreResult<BrokerLocalData> {
        self.cluster
            .lock()
            .expect("cluster lock")
            .broker_data
            .get(broker)
            .cloned()
            .ok_or_else(|| StoreError::UnknownBroker {
                broker: broker.to_string(),
            })
    }

    async fn partition_owners(&self, topic: &str) -> StoreResult<HashMap<u32, String>> {
        Ok(self
            .cluster
            .lock()
            .expect("cluster lock")
            .owners
            .get(topic)
            .cloned()
            .unwrap_or_default())
    }

    async fn partition_bounds(
        &self,
        topic: &str,
    ) -> StoreResult<Option<(EntryPosition, EntryPosition)>> {
        let state = self.existing(topic)?;
        let log = state.log.lock().expect("log lock");
        Ok(match (log.first(), log.last()) {
            (Some(first), Some(last)) => Some((first.position, last.position)),
            _ => None,
        })
    }
}

struct MemoryPublisher {
    topic: String,
    state: Arc<TopicState>,
    entries_per_ledger: u64,
    fail: Arc<AtomicBool>,
    closed: AtomicBool,
}

#[async_trait]
impl LogPublisher for MemoryPublisher {
    async fn send(&self, payload: Bytes) -> StoreResult<EntryPosition> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::HandleClosed {
                topic: self.topic.clone(),
            });
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::PublishTimeout {
                topic: self.topic.clone(),
            });
        }
        Ok(append(&self.state, self.entries_per_ledger, payload))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

struct MemoryReader {
    state: Arc<TopicState>,
    next_index: usize,
    connected: bool,
}

#[async_trait]
impl LogReader for MemoryReader {
    async fn read_next(&mut self, deadline: Duration) -> StoreResult<Option<StoredEntry>> {
        let started = Instant::now();
        loop {
            // Register for arrivals before checking, so a publish between
            // the check and the await cannot be missed.
            let notified = self.state.arrival.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let log = self.state.log.lock().expect("log lock");
                if let Some(entry) = log.get(self.next_index) {
                    self.next_index += 1;
                    return Ok(Some(entry.clone()));
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - elapsed, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn seek(&mut self, position: EntryPosition) -> StoreResult<()> {
        let log = self.state.log.lock().expect("log lock");
        self.next_index = log.partition_point(|e| e.position < position);
        Ok(())
    }

    async fn seek_timestamp(&mut self, timestamp: i64) -> StoreResult<()> {
        let log = self.state.log.lock().expect("log lock");
        self.next_index = log.partition_point(|e| e.event_time < timestamp);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

fn append(state: &TopicState, entries_per_ledger: u64, payload: Bytes) -> EntryPosition {
    let position = {
        let mut log = state.log.lock().expect("log lock");
        let index = log.len() as u64;
        let position = EntryPosition::new(index / entries_per_ledger, index % entries_per_ledger);
        log.push(StoredEntry {
            position,
            payload,
            event_time: now_millis(),
        });
        position
    };
    state.arrival.notify_waiters();
    position
}

fn resolve_start(log: &[StoredEntry], start: StartPosition) -> usize {
    match start {
        StartPosition::Earliest => 0,
        StartPosition::Latest => log.len(),
        StartPosition::At {
            position,
            inclusive,
        } => {
            let at = log.partition_point(|e| e.position < position);
            if !inclusive && log.get(at).is_some_and(|e| e.position == position) {
                at + 1
            } else {
                at
            }
        }
    }
}

fn now_millis() -> i64 {
    #[allow(clippy::cast_possible_truncation)]
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    millis
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_options() -> ReaderOptions {
        ReaderOptions {
            name: "test-reader".into(),
            receiver_queue_size: 32,
        }
    }

    #[tokio::test]
    async fn test_publish_and_read_back() {
        let store = MemoryLogStore::new();
        let publisher = store
            .create_publisher("t-0", PublisherOptions::immediate("p".into()))
            .await
            .unwrap();

        let first = publisher.send(Bytes::from_static(b"a")).await.unwrap();
        let second = publisher.send(Bytes::from_static(b"b")).await.unwrap();
        assert!(first < second);

        let mut reader = store
            .create_reader("t-0", StartPosition::Earliest, reader_options())
            .await
            .unwrap();
        let entry = reader.read_next(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(entry.payload.as_ref(), b"a");
        assert_eq!(entry.position, first);
        let entry = reader.read_next(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(entry.payload.as_ref(), b"b");
        assert!(reader
            .read_next(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ledger_rollover() {
        let store = MemoryLogStore::with_entries_per_ledger(2);
        for payload in [b"1", b"2", b"3"] {
            store.publish("t-0", Bytes::from_static(payload)).unwrap();
        }
        let bounds = store.partition_bounds("t-0").await.unwrap().unwrap();
        assert_eq!(bounds.0, EntryPosition::new(0, 0));
        assert_eq!(bounds.1, EntryPosition::new(1, 0));
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_publish() {
        let store = Arc::new(MemoryLogStore::new());
        store.ensure_topic("t-0");
        let mut reader = store
            .create_reader("t-0", StartPosition::Earliest, reader_options())
            .await
            .unwrap();

        let writer = Arc::clone(&store);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.publish("t-0", Bytes::from_static(b"late")).unwrap();
        });

        let entry = reader
            .read_next(Duration::from_millis(500))
            .await
            .unwrap()
            .expect("publish should wake the reader");
        assert_eq!(entry.payload.as_ref(), b"late");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_latest_start_skips_history() {
        let store = MemoryLogStore::new();
        store.publish("t-0", Bytes::from_static(b"old")).unwrap();
        let mut reader = store
            .create_reader("t-0", StartPosition::Latest, reader_options())
            .await
            .unwrap();
        assert!(reader
            .read_next(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        store.publish("t-0", Bytes::from_static(b"new")).unwrap();
        let entry = reader
            .read_next(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.payload.as_ref(), b"new");
    }

    #[tokio::test]
    async fn test_exact_start_inclusive_and_exclusive() {
        let store = MemoryLogStore::new();
        let first = store.publish("t-0", Bytes::from_static(b"a")).unwrap();
        store.publish("t-0", Bytes::from_static(b"b")).unwrap();

        let mut inclusive = store
            .create_reader(
                "t-0",
                StartPosition::At {
                    position: first,
                    inclusive: true,
                },
                reader_options(),
            )
            .await
            .unwrap();
        let entry = inclusive.read_next(Duration::from_millis(20)).await.unwrap().unwrap();
        assert_eq!(entry.payload.as_ref(), b"a");

        let mut exclusive = store
            .create_reader(
                "t-0",
                StartPosition::At {
                    position: first,
                    inclusive: false,
                },
                reader_options(),
            )
            .await
            .unwrap();
        let entry = exclusive.read_next(Duration::from_millis(20)).await.unwrap().unwrap();
        assert_eq!(entry.payload.as_ref(), b"b");
    }

    #[tokio::test]
    async fn test_seek() {
        let store = MemoryLogStore::new();
        store.publish("t-0", Bytes::from_static(b"a")).unwrap();
        let second = store.publish("t-0", Bytes::from_static(b"b")).unwrap();

        let mut reader = store
            .create_reader("t-0", StartPosition::Latest, reader_options())
            .await
            .unwrap();
        reader.seek(second).await.unwrap();
        let entry = reader.read_next(Duration::from_millis(20)).await.unwrap().unwrap();
        assert_eq!(entry.payload.as_ref(), b"b");
    }

    #[tokio::test]
    async fn test_fail_toggle() {
        let store = MemoryLogStore::new();
        let publisher = store
            .create_publisher("t-0", PublisherOptions::immediate("p".into()))
            .await
            .unwrap();
        store.fail_publishes(true);
        assert!(publisher.send(Bytes::from_static(b"x")).await.is_err());
        store.fail_publishes(false);
        assert!(publisher.send(Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_bounds_unknown_topic() {
        let store = MemoryLogStore::new();
        assert!(matches!(
            store.partition_bounds("never-created").await,
            Err(StoreError::TopicNotFound { .. })
        ));
        store.ensure_topic("created");
        assert!(store.partition_bounds("created").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cluster_view() {
        let store = MemoryLogStore::new();
        store.add_broker("b1:6650", &[("internal", "b1.internal:9876")]);
        store.add_broker("b2:6650", &[("internal", "b2.internal:9876")]);
        store.set_partition_owner("persistent://a/b/t", 0, "b1:6650");
        store.set_partition_owner("persistent://a/b/t", 1, "b2:6650");

        let brokers = store.active_brokers("test").await.unwrap();
        assert_eq!(brokers.len(), 2);

        let data = store.broker_data("b1:6650").await.unwrap();
        assert_eq!(
            data.advertised_listeners.get("internal").map(String::as_str),
            Some("b1.internal:9876")
        );

        let owners = store.partition_owners("persistent://a/b/t").await.unwrap();
        assert_eq!(owners.len(), 2);
        assert!(store
            .partition_owners("persistent://a/b/unknown")
            .await
            .unwrap()
            .is_empty());
    }
}
