//! Consumer groups, subscriptions, and group configuration.
//!
//! Subscriptions are mutated only by client heartbeats; the pull pipeline
//! reads them. A consumer group exists while at least one client channel is
//! registered under it; the last channel leaving destroys the group.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ledgermq_core::filter::{ExpressionType, MessageFilter};
use ledgermq_core::limits::DEFAULT_RETRY_MAX_TIMES;
use ledgermq_core::ChannelId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::BrokerResult;
use crate::remoting::code::MASTER_ID;
use crate::session::Session;

/// Consumption model of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageModel {
    #[default]
    Clustering,
    Broadcasting,
}

impl MessageModel {
    /// Parses the wire name; unknown values fall back to clustering.
    #[must_use]
    pub fn from_wire(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("BROADCASTING") {
            Self::Broadcasting
        } else {
            Self::Clustering
        }
    }
}

/// One group's subscription to one topic.
#[derive(Debug, Clone)]
pub struct SubscriptionData {
    pub topic: String,
    pub sub_string: String,
    pub expression_type: ExpressionType,
    pub sub_version: i64,
    pub filter: MessageFilter,
}

impl SubscriptionData {
    /// Compiles a subscription from its wire parts.
    ///
    /// # Errors
    ///
    /// Returns the filter's parse error (the pull pipeline maps it to
    /// `SUBSCRIPTION_PARSE_FAILED`).
    pub fn build(
        topic: &str,
        expression: &str,
        expression_type: ExpressionType,
        sub_version: i64,
    ) -> BrokerResult<Self> {
        let filter = MessageFilter::build(expression_type, expression)?;
        Ok(Self {
            topic: topic.to_string(),
            sub_string: expression.to_string(),
            expression_type,
            sub_version,
            filter,
        })
    }
}

/// Per-group configuration consulted by the pull and send-back paths.
#[derive(Debug, Clone)]
pub struct SubscriptionGroupConfig {
    pub group_name: String,
    pub consume_enable: bool,
    pub consume_broadcast_enable: bool,
    pub retry_queue_nums: u32,
    pub retry_max_times: i32,
    pub broker_id: u64,
}

impl SubscriptionGroupConfig {
    /// Default config for a group.
    #[must_use]
    pub fn new(group_name: &str) -> Self {
        Self {
            group_name: group_name.to_string(),
            consume_enable: true,
            consume_broadcast_enable: true,
            retry_queue_nums: 1,
            retry_max_times: DEFAULT_RETRY_MAX_TIMES,
            broker_id: MASTER_ID,
        }
    }
}

/// Subscription group config table.
pub struct SubscriptionGroupManager {
    auto_create: bool,
    table: RwLock<HashMap<String, SubscriptionGroupConfig>>,
}

impl SubscriptionGroupManager {
    /// Creates a manager; `auto_create` mirrors the broker config key.
    #[must_use]
    pub fn new(auto_create: bool) -> Self {
        Self {
            auto_create,
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up a group config, auto-creating when enabled.
    #[must_use]
    pub fn find(&self, group: &str) -> Option<SubscriptionGroupConfig> {
        {
            let table = self.table.read().expect("group table lock");
            if let Some(config) = table.get(group) {
                return Some(config.clone());
            }
        }
        if !self.auto_create {
            return None;
        }
        let mut table = self.table.write().expect("group table lock");
        Some(
            table
                .entry(group.to_string())
                .or_insert_with(|| SubscriptionGroupConfig::new(group))
                .clone(),
        )
    }

    /// Inserts or replaces a group config (admin/test surface).
    pub fn put(&self, config: SubscriptionGroupConfig) {
        let mut table = self.table.write().expect("group table lock");
        table.insert(config.group_name.clone(), config);
    }
}

/// One registered client channel of a consumer group.
#[derive(Clone)]
pub struct ClientChannelInfo {
    pub channel_id: ChannelId,
    pub client_id: String,
    pub session: Arc<Session>,
}

struct ConsumerGroupInfo {
    model: MessageModel,
    subscriptions: HashMap<String, SubscriptionData>,
    channels: HashMap<ChannelId, ClientChannelInfo>,
}

/// Registry of live consumer groups, fed by heartbeats.
#[derive(Default)]
pub struct ConsumerManager {
    groups: RwLock<HashMap<String, ConsumerGroupInfo>>,
}

impl ConsumerManager {
    /// Registers (or refreshes) a channel's membership and the group's
    /// subscriptions.
    pub fn register(
        &self,
        group: &str,
        model: MessageModel,
        subscriptions: Vec<SubscriptionData>,
        channel: ClientChannelInfo,
    ) {
        let mut groups = self.groups.write().expect("consumer groups lock");
        let info = groups
            .entry(group.to_string())
            .or_insert_with(|| ConsumerGroupInfo {
                model,
                subscriptions: HashMap::new(),
                channels: HashMap::new(),
            });
        info.model = model;
        for subscription in subscriptions {
            info.subscriptions
                .insert(subscription.topic.clone(), subscription);
        }
        if info.channels.insert(channel.channel_id, channel).is_none() {
            debug!(group, "registered consumer channel");
        }
    }

    /// Removes a channel from every group; groups left without channels are
    /// destroyed.
    pub fn unregister_channel(&self, channel_id: ChannelId) {
        let mut groups = self.groups.write().expect("consumer groups lock");
        groups.retain(|group, info| {
            if info.channels.remove(&channel_id).is_some() && info.channels.is_empty() {
                info!(group, "last channel left, destroying consumer group");
                return false;
            }
            true
        });
    }

    /// True once the group has registered at least one channel.
    #[must_use]
    pub fn group_exists(&self, group: &str) -> bool {
        self.groups
            .read()
            .expect("consumer groups lock")
            .contains_key(group)
    }

    /// The group's consumption model.
    #[must_use]
    pub fn group_model(&self, group: &str) -> Option<MessageModel> {
        self.groups
            .read()
            .expect("consumer groups lock")
            .get(group)
            .map(|info| info.model)
    }

    /// The group's stored subscription for a topic.
    #[must_use]
    pub fn find_subscription(&self, group: &str, topic: &str) -> Option<SubscriptionData> {
        self.groups
            .read()
            .expect("consumer groups lock")
            .get(group)
            .and_then(|info| info.subscriptions.get(topic))
            .cloned()
    }

    /// The session behind a specific channel of a group, when registered.
    #[must_use]
    pub fn session_for(&self, group: &str, channel_id: ChannelId) -> Option<Arc<Session>> {
        self.groups
            .read()
            .expect("consumer groups lock")
            .get(group)
            .and_then(|info| info.channels.get(&channel_id))
            .map(|channel| Arc::clone(&channel.session))
    }
}

/// Heartbeat body: everything a client periodically reasserts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    #[serde(rename = "clientID", default)]
    pub client_id: String,
    #[serde(default)]
    pub consumer_data_set: Vec<ConsumerData>,
    #[serde(default)]
    pub producer_data_set: Vec<ProducerData>,
}

/// One consumer group's heartbeat entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerData {
    pub group_name: String,
    #[serde(default)]
    pub consume_type: String,
    #[serde(default)]
    pub message_model: String,
    #[serde(default)]
    pub consume_from_where: String,
    #[serde(default)]
    pub subscription_data_set: Vec<SubscriptionDataWire>,
    #[serde(default)]
    pub unit_mode: bool,
}

/// Wire form of one subscription inside a heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDataWire {
    pub topic: String,
    #[serde(default)]
    pub sub_string: String,
    #[serde(default)]
    pub tags_set: Vec<String>,
    #[serde(default)]
    pub sub_version: i64,
    #[serde(default)]
    pub expression_type: Option<String>,
}

/// One producer group's heartbeat entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerData {
    pub group_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use ledgermq_backend::MemoryLogStore;

    fn test_channel(id: u64) -> ClientChannelInfo {
        let store = Arc::new(MemoryLogStore::new());
        let session = Session::for_tests(store, Arc::new(BrokerConfig::fast_for_testing()));
        ClientChannelInfo {
            channel_id: ChannelId::new(id),
            client_id: format!("client-{id}"),
            session,
        }
    }

    fn subscription(topic: &str, version: i64) -> SubscriptionData {
        SubscriptionData::build(topic, "*", ExpressionType::Tag, version).unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let consumers = ConsumerManager::default();
        consumers.register(
            "cg",
            MessageModel::Clustering,
            vec![subscription("orders", 3)],
            test_channel(1),
        );

        assert!(consumers.group_exists("cg"));
        assert_eq!(consumers.group_model("cg"), Some(MessageModel::Clustering));
        let stored = consumers.find_subscription("cg", "orders").unwrap();
        assert_eq!(stored.sub_version, 3);
        assert!(consumers.session_for("cg", ChannelId::new(1)).is_some());
        assert!(consumers.session_for("cg", ChannelId::new(2)).is_none());
        assert!(consumers.find_subscription("cg", "other").is_none());
    }

    #[test]
    fn test_heartbeat_refreshes_subscription_version() {
        let consumers = ConsumerManager::default();
        consumers.register(
            "cg",
            MessageModel::Clustering,
            vec![subscription("orders", 1)],
            test_channel(1),
        );
        consumers.register(
            "cg",
            MessageModel::Clustering,
            vec![subscription("orders", 2)],
            test_channel(1),
        );
        assert_eq!(
            consumers.find_subscription("cg", "orders").unwrap().sub_version,
            2
        );
    }

    #[test]
    fn test_last_channel_destroys_group() {
        let consumers = ConsumerManager::default();
        consumers.register(
            "cg",
            MessageModel::Clustering,
            vec![subscription("orders", 1)],
            test_channel(1),
        );
        consumers.register(
            "cg",
            MessageModel::Clustering,
            vec![],
            test_channel(2),
        );

        consumers.unregister_channel(ChannelId::new(1));
        assert!(consumers.group_exists("cg"));
        consumers.unregister_channel(ChannelId::new(2));
        assert!(!consumers.group_exists("cg"));
    }

    #[test]
    fn test_group_manager_auto_create() {
        let groups = SubscriptionGroupManager::new(true);
        let config = groups.find("cg").unwrap();
        assert!(config.consume_enable);
        assert_eq!(config.retry_max_times, DEFAULT_RETRY_MAX_TIMES);

        let strict = SubscriptionGroupManager::new(false);
        assert!(strict.find("cg").is_none());
        strict.put(SubscriptionGroupConfig::new("cg"));
        assert!(strict.find("cg").is_some());
    }

    #[test]
    fn test_heartbeat_json_shape() {
        let raw = r#"{
            "clientID": "10.0.0.9@4321",
            "consumerDataSet": [{
                "groupName": "cg",
                "consumeType": "CONSUME_PASSIVELY",
                "messageModel": "CLUSTERING",
                "consumeFromWhere": "CONSUME_FROM_LAST_OFFSET",
                "subscriptionDataSet": [{
                    "topic": "orders",
                    "subString": "a||b",
                    "tagsSet": ["a", "b"],
                    "subVersion": 17
                }],
                "unitMode": false
            }],
            "producerDataSet": [{"groupName": "pg"}]
        }"#;
        let heartbeat: HeartbeatData = serde_json::from_str(raw).unwrap();
        assert_eq!(heartbeat.client_id, "10.0.0.9@4321");
        assert_eq!(heartbeat.consumer_data_set.len(), 1);
        let consumer = &heartbeat.consumer_data_set[0];
        assert_eq!(consumer.group_name, "cg");
        assert_eq!(consumer.subscription_data_set[0].sub_version, 17);
        assert_eq!(heartbeat.producer_data_set[0].group_name, "pg");
    }
}
