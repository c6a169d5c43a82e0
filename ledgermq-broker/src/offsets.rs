//! Consumer offset bookkeeping.
//!
//! Commit offsets are stored per (group, topic, queue). Queue bounds come
//! from the backend: the first and last entry positions of a partition,
//! re-encoded as wire queue offsets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use ledgermq_backend::LogStore;
use ledgermq_core::offset;
use ledgermq_core::topic::LegacyTopic;
use ledgermq_core::types::{MessageRef, PartitionId};
use tracing::debug;

use crate::error::BrokerResult;

/// Committed offsets plus queue bound queries.
pub struct ConsumerOffsetManager {
    store: Arc<dyn LogStore>,
    table: RwLock<HashMap<(String, String, u32), i64>>,
}

impl ConsumerOffsetManager {
    /// Creates a manager over the given store.
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Commits a consumer offset.
    pub fn commit_offset(
        &self,
        client: SocketAddr,
        group: &str,
        topic: &str,
        queue_id: u32,
        offset: i64,
    ) {
        debug!(%client, group, topic, queue_id, offset, "commit offset");
        let mut table = self.table.write().expect("offset table lock");
        table.insert((group.to_string(), topic.to_string(), queue_id), offset);
    }

    /// The last committed offset for (group, topic, queue), if any.
    #[must_use]
    pub fn committed_offset(&self, group: &str, topic: &str, queue_id: u32) -> Option<i64> {
        self.table
            .read()
            .expect("offset table lock")
            .get(&(group.to_string(), topic.to_string(), queue_id))
            .copied()
    }

    /// Min and max wire offsets of one queue, or `None` while it is empty.
    ///
    /// # Errors
    ///
    /// Propagates `TopicNotFound` (and other store failures) so the caller
    /// can distinguish a missing queue from an empty one; offset overflow is
    /// fatal and surfaces as a core error.
    pub async fn queue_bounds(
        &self,
        topic: &LegacyTopic,
        queue_id: u32,
    ) -> BrokerResult<Option<(i64, i64)>> {
        let partitioned = topic.partition_name(PartitionId::new(queue_id));
        let Some((first, last)) = self.store.partition_bounds(&partitioned).await? else {
            return Ok(None);
        };
        let min = offset::encode(MessageRef {
            ledger: first.ledger,
            entry: first.entry,
            partition: PartitionId::new(queue_id),
        })?;
        let max = offset::encode(MessageRef {
            ledger: last.ledger,
            entry: last.entry,
            partition: PartitionId::new(queue_id),
        })?;
        Ok(Some((min, max)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ledgermq_backend::MemoryLogStore;

    #[tokio::test]
    async fn test_commit_and_read_back() {
        let store = Arc::new(MemoryLogStore::new());
        let offsets = ConsumerOffsetManager::new(store);
        let client: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        assert_eq!(offsets.committed_offset("cg", "orders", 0), None);
        offsets.commit_offset(client, "cg", "orders", 0, 77);
        assert_eq!(offsets.committed_offset("cg", "orders", 0), Some(77));
        offsets.commit_offset(client, "cg", "orders", 0, 78);
        assert_eq!(offsets.committed_offset("cg", "orders", 0), Some(78));
    }

    #[tokio::test]
    async fn test_queue_bounds() {
        let store = Arc::new(MemoryLogStore::new());
        let topic = LegacyTopic::parse("orders").unwrap();
        let partitioned = topic.partition_name(PartitionId::new(0));

        let offsets = ConsumerOffsetManager::new(Arc::clone(&store) as Arc<dyn LogStore>);

        // Unknown queue is an error, not empty bounds.
        assert!(offsets.queue_bounds(&topic, 0).await.is_err());

        store.ensure_topic(&partitioned);
        assert!(offsets.queue_bounds(&topic, 0).await.unwrap().is_none());

        store.publish(&partitioned, Bytes::from_static(b"a")).unwrap();
        store.publish(&partitioned, Bytes::from_static(b"b")).unwrap();
        let (min, max) = offsets.queue_bounds(&topic, 0).await.unwrap().unwrap();
        assert!(min < max);
    }
}
