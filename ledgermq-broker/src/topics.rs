//! Topic configuration and partition ownership.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ledgermq_backend::LogStore;
use ledgermq_core::topic::LegacyTopic;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::remoting::code::perm;

/// Per-topic configuration.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub name: String,
    pub write_queue_nums: u32,
    pub read_queue_nums: u32,
    pub perm: u32,
}

impl TopicConfig {
    /// A read/write topic with symmetric queue counts.
    #[must_use]
    pub fn new(name: &str, queue_nums: u32) -> Self {
        Self {
            name: name.to_string(),
            write_queue_nums: queue_nums,
            read_queue_nums: queue_nums,
            perm: perm::READ | perm::WRITE,
        }
    }
}

/// Topic config table plus backend ownership checks.
pub struct TopicConfigManager {
    store: Arc<dyn LogStore>,
    broker_address: String,
    auto_create: bool,
    default_queue_nums: u32,
    table: RwLock<HashMap<String, TopicConfig>>,
}

impl TopicConfigManager {
    /// Creates a manager configured from the broker config.
    pub fn new(store: Arc<dyn LogStore>, config: &BrokerConfig) -> Self {
        Self {
            store,
            broker_address: config.broker_address.clone(),
            auto_create: config.auto_create_topics,
            default_queue_nums: config.default_topic_queue_nums,
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up a topic config; auto-creates a default one when enabled.
    #[must_use]
    pub fn select(&self, topic: &str) -> Option<TopicConfig> {
        {
            let table = self.table.read().expect("topic table lock");
            if let Some(config) = table.get(topic) {
                return Some(config.clone());
            }
        }
        if !self.auto_create {
            return None;
        }
        let config = TopicConfig::new(topic, self.default_queue_nums);
        info!(topic, queues = self.default_queue_nums, "auto-created topic config");
        let mut table = self.table.write().expect("topic table lock");
        Some(table.entry(topic.to_string()).or_insert(config).clone())
    }

    /// Inserts or replaces a topic config (admin/test surface).
    pub fn put(&self, config: TopicConfig) {
        let mut table = self.table.write().expect("topic table lock");
        table.insert(config.name.clone(), config);
    }

    /// Creates the topic config used by retry/DLQ escalation, keeping an
    /// existing entry's queue counts if present.
    pub fn create_for_send_back(&self, topic: &str, queue_nums: u32, permission: u32) -> TopicConfig {
        let mut table = self.table.write().expect("topic table lock");
        table
            .entry(topic.to_string())
            .or_insert_with(|| {
                debug!(topic, queue_nums, "created send-back topic config");
                TopicConfig {
                    name: topic.to_string(),
                    write_queue_nums: queue_nums,
                    read_queue_nums: queue_nums,
                    perm: permission,
                }
            })
            .clone()
    }

    /// Whether this broker owns one partition of a topic.
    ///
    /// A topic the backend cluster view knows nothing about is treated as
    /// local-only (standalone deployments never register ownership maps).
    pub async fn is_partition_owner(&self, topic: &LegacyTopic, queue_id: u32) -> bool {
        match self.store.partition_owners(&topic.backend_name()).await {
            Ok(owners) if owners.is_empty() => true,
            Ok(owners) => owners
                .get(&queue_id)
                .is_some_and(|owner| *owner == self.broker_address),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgermq_backend::MemoryLogStore;

    fn manager(store: &Arc<MemoryLogStore>, auto_create: bool) -> TopicConfigManager {
        let config = BrokerConfig {
            auto_create_topics: auto_create,
            ..BrokerConfig::default()
        };
        TopicConfigManager::new(Arc::clone(store) as Arc<dyn LogStore>, &config)
    }

    #[tokio::test]
    async fn test_auto_create() {
        let store = Arc::new(MemoryLogStore::new());
        let topics = manager(&store, true);
        let config = topics.select("orders").unwrap();
        assert_eq!(config.write_queue_nums, 4);
        assert!(perm::is_readable(config.perm) && perm::is_writeable(config.perm));

        let strict = manager(&store, false);
        assert!(strict.select("orders").is_none());
        strict.put(TopicConfig::new("orders", 2));
        assert_eq!(strict.select("orders").unwrap().read_queue_nums, 2);
    }

    #[tokio::test]
    async fn test_send_back_create_keeps_existing() {
        let store = Arc::new(MemoryLogStore::new());
        let topics = manager(&store, true);
        topics.put(TopicConfig::new("%RETRY%cg", 8));
        let config = topics.create_for_send_back("%RETRY%cg", 1, perm::WRITE);
        assert_eq!(config.write_queue_nums, 8);

        let dlq = topics.create_for_send_back("%DLQ%cg", 1, perm::WRITE);
        assert_eq!(dlq.write_queue_nums, 1);
        assert!(!perm::is_readable(dlq.perm));
    }

    #[tokio::test]
    async fn test_partition_ownership() {
        let store = Arc::new(MemoryLogStore::new());
        let topics = manager(&store, true);
        let topic = LegacyTopic::parse("orders").unwrap();

        // No cluster view: standalone, everything is local.
        assert!(topics.is_partition_owner(&topic, 0).await);

        store.set_partition_owner(&topic.backend_name(), 0, "broker-a:6650");
        store.set_partition_owner(&topic.backend_name(), 1, "elsewhere:6650");
        assert!(topics.is_partition_owner(&topic, 0).await);
        assert!(!topics.is_partition_owner(&topic, 1).await);
        assert!(!topics.is_partition_owner(&topic, 9).await);
    }
}
