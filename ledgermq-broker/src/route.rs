//! Route responder: topic route and cluster info queries.
//!
//! Synthesizes legacy "broker data + queue data" records from the backend's
//! cluster view. The client's ingress port selects which advertised listener
//! set endpoints are drawn from.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use ledgermq_core::topic::LegacyTopic;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{BrokerContext, ClientChannel};
use crate::error::BrokerResult;
use crate::remoting::code::{perm, request, response};
use crate::remoting::header::GetRouteInfoRequestHeader;
use crate::remoting::RemotingCommand;

/// One broker's address record in a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerData {
    pub cluster: String,
    pub broker_name: String,
    /// Broker id → address; id 0 is the master.
    pub broker_addrs: BTreeMap<u64, String>,
}

/// One broker's queue counts in a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueData {
    pub broker_name: String,
    pub read_queue_nums: u32,
    pub write_queue_nums: u32,
    pub perm: u32,
    /// Field name kept as the legacy wire spells it.
    #[serde(rename = "topicSynFlag")]
    pub topic_syn_flag: u32,
}

/// Body of a topic route response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRouteData {
    #[serde(default)]
    pub order_topic_conf: Option<String>,
    #[serde(default)]
    pub queue_datas: Vec<QueueData>,
    #[serde(default)]
    pub broker_datas: Vec<BrokerData>,
    #[serde(default)]
    pub filter_server_table: HashMap<String, Vec<String>>,
}

/// Body of a cluster info response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub broker_addr_table: BTreeMap<String, BrokerData>,
    pub cluster_addr_table: BTreeMap<String, BTreeSet<String>>,
}

/// Handles `GET_ROUTEINFO_BY_TOPIC` and `GET_BROKER_CLUSTER_INFO`.
pub struct RouteResponder {
    ctx: Arc<BrokerContext>,
}

impl RouteResponder {
    /// Creates the responder.
    #[must_use]
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    /// Processes one route-side request.
    ///
    /// # Errors
    ///
    /// Only serialization failures escape; lookup failures become response
    /// codes.
    pub async fn process(
        &self,
        channel: &ClientChannel,
        request_cmd: &RemotingCommand,
    ) -> BrokerResult<RemotingCommand> {
        match request_cmd.code {
            request::GET_BROKER_CLUSTER_INFO => self.cluster_info(channel).await,
            _ => self.route_by_topic(channel, request_cmd).await,
        }
    }

    async fn route_by_topic(
        &self,
        channel: &ClientChannel,
        request_cmd: &RemotingCommand,
    ) -> BrokerResult<RemotingCommand> {
        let header: GetRouteInfoRequestHeader = request_cmd.decode_header()?;
        let listener = self.ctx.config.listener_name_for_port(channel.local.port());
        debug!(topic = %header.topic, ?listener, peer = %channel.peer, "route lookup");

        // Naming the cluster itself returns any one live broker; legacy
        // clients use this to bootstrap topic creation.
        if header.topic == self.ctx.config.cluster_name {
            return self.any_broker_route(listener).await;
        }

        let Ok(topic) = LegacyTopic::parse(&header.topic) else {
            return Ok(RemotingCommand::new_response(
                response::TOPIC_NOT_EXIST,
                Some(format!("no route info for malformed topic {}", header.topic)),
            ));
        };

        let owners = match self.ctx.store.partition_owners(&topic.backend_name()).await {
            Ok(owners) => owners,
            Err(error) => {
                warn!(%error, topic = %header.topic, "partition owner lookup failed");
                HashMap::new()
            }
        };
        if owners.is_empty() {
            return Ok(RemotingCommand::new_response(
                response::TOPIC_NOT_EXIST,
                Some(format!(
                    "no topic route info in name server for the topic: {}",
                    header.topic
                )),
            ));
        }

        // One BrokerData and one QueueData per owning broker; queue counts
        // are how many partitions that broker owns.
        let mut partitions_by_broker: BTreeMap<String, u32> = BTreeMap::new();
        for owner in owners.values() {
            *partitions_by_broker.entry(owner.clone()).or_default() += 1;
        }

        let mut route = TopicRouteData::default();
        for (owner, partition_count) in partitions_by_broker {
            let endpoint = self.advertised_endpoint(&owner, listener).await;
            let broker_name = broker_name_of(&owner);
            route.broker_datas.push(BrokerData {
                cluster: self.ctx.config.cluster_name.clone(),
                broker_name: broker_name.clone(),
                broker_addrs: BTreeMap::from([(crate::remoting::code::MASTER_ID, endpoint)]),
            });
            route.queue_datas.push(QueueData {
                broker_name,
                read_queue_nums: partition_count,
                write_queue_nums: partition_count,
                perm: perm::READ | perm::WRITE,
                topic_syn_flag: 0,
            });
        }

        let mut response_cmd = RemotingCommand::new_response(response::SUCCESS, None);
        response_cmd.body = Bytes::from(serde_json::to_vec(&route)?);
        Ok(response_cmd)
    }

    async fn any_broker_route(&self, listener: Option<&str>) -> BrokerResult<RemotingCommand> {
        let brokers = match self
            .ctx
            .store
            .active_brokers(&self.ctx.config.cluster_name)
            .await
        {
            Ok(brokers) if !brokers.is_empty() => brokers,
            Ok(_) => {
                return Ok(RemotingCommand::new_response(
                    response::SYSTEM_ERROR,
                    Some("no active brokers".to_string()),
                ));
            }
            Err(error) => {
                warn!(%error, "active broker lookup failed");
                return Ok(RemotingCommand::new_response(response::SYSTEM_ERROR, None));
            }
        };

        let picked = &brokers[rand::thread_rng().gen_range(0..brokers.len())];
        let endpoint = self.advertised_endpoint(picked, listener).await;
        let route = TopicRouteData {
            broker_datas: vec![BrokerData {
                cluster: self.ctx.config.cluster_name.clone(),
                broker_name: broker_name_of(picked),
                broker_addrs: BTreeMap::from([(crate::remoting::code::MASTER_ID, endpoint)]),
            }],
            ..TopicRouteData::default()
        };

        let mut response_cmd = RemotingCommand::new_response(response::SUCCESS, None);
        response_cmd.body = Bytes::from(serde_json::to_vec(&route)?);
        Ok(response_cmd)
    }

    async fn cluster_info(&self, channel: &ClientChannel) -> BrokerResult<RemotingCommand> {
        let listener = self.ctx.config.listener_name_for_port(channel.local.port());
        let brokers = match self
            .ctx
            .store
            .active_brokers(&self.ctx.config.cluster_name)
            .await
        {
            Ok(brokers) => brokers,
            Err(error) => {
                warn!(%error, "cluster info lookup failed");
                return Ok(RemotingCommand::new_response(response::SYSTEM_ERROR, None));
            }
        };

        let mut info = ClusterInfo::default();
        let mut names = BTreeSet::new();
        for broker in &brokers {
            let endpoint = self.advertised_endpoint(broker, listener).await;
            let broker_name = broker_name_of(broker);
            names.insert(broker_name.clone());
            info.broker_addr_table.insert(
                broker_name.clone(),
                BrokerData {
                    cluster: self.ctx.config.cluster_name.clone(),
                    broker_name,
                    broker_addrs: BTreeMap::from([(crate::remoting::code::MASTER_ID, endpoint)]),
                },
            );
        }
        info.cluster_addr_table
            .insert(self.ctx.config.cluster_name.clone(), names);

        let mut response_cmd = RemotingCommand::new_response(response::SUCCESS, None);
        response_cmd.body = Bytes::from(serde_json::to_vec(&info)?);
        Ok(response_cmd)
    }

    /// Resolves the endpoint to advertise for a broker: the listener-named
    /// advertised address when the backend knows one, the raw broker address
    /// otherwise.
    async fn advertised_endpoint(&self, broker: &str, listener: Option<&str>) -> String {
        let Some(listener) = listener else {
            return broker.to_string();
        };
        match self.ctx.store.broker_data(broker).await {
            Ok(data) => data
                .advertised_listeners
                .get(listener)
                .cloned()
                .unwrap_or_else(|| broker.to_string()),
            Err(_) => broker.to_string(),
        }
    }
}

/// Broker names in routes are the host part of the backend address.
fn broker_name_of(address: &str) -> String {
    address
        .split_once(':')
        .map_or(address, |(host, _)| host)
        .to_string()
}
