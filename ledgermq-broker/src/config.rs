//! Broker configuration.
//!
//! All keys are immutable after startup; the server and every pipeline hold
//! the config behind an `Arc`. Loading from files/CLI is a collaborator's
//! job; this is the in-process shape with validated defaults.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{BrokerError, BrokerResult};
use crate::remoting::code::perm;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Cluster this broker belongs to (also the route shortcut topic name).
    pub cluster_name: String,
    /// Name advertised in route responses.
    pub broker_name: String,
    /// This broker's identity in the backend cluster view; partition
    /// ownership is decided by comparing against the owner addresses the
    /// backend reports.
    pub broker_address: String,
    /// Address the legacy listener binds.
    pub bind_addr: SocketAddr,
    /// Ingress port → listener name; the client's local port picks which
    /// advertised endpoint set route responses carry.
    pub listener_port_map: HashMap<u16, String>,
    /// Highest delay level producers may request.
    pub max_delay_level: i32,
    /// Partition count of each delay pseudo-topic.
    pub schedule_topic_partitions: u32,
    /// Whether pulls may be held for the client-specified timeout.
    pub long_polling_enable: bool,
    /// Hold duration when long polling is disabled.
    pub short_polling_time: Duration,
    /// Cap on client-specified suspend timeouts.
    pub max_suspend_timeout: Duration,
    /// Broker-wide permission bits.
    pub broker_permission: u32,
    /// Multiplier for billing counters.
    pub commercial_base_count: u64,
    /// Publish acknowledgement deadline.
    pub send_timeout: Duration,
    /// Per-message read deadline.
    pub read_timeout: Duration,
    /// Create topic configs on first use.
    pub auto_create_topics: bool,
    /// Create subscription group configs on first use.
    pub auto_create_groups: bool,
    /// Queue count for auto-created topics.
    pub default_topic_queue_nums: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cluster_name: "DefaultCluster".to_string(),
            broker_name: "broker-a".to_string(),
            broker_address: "broker-a:6650".to_string(),
            bind_addr: "127.0.0.1:9876".parse().expect("static address"),
            listener_port_map: HashMap::from([(9876, "internal".to_string())]),
            max_delay_level: 18,
            schedule_topic_partitions: 8,
            long_polling_enable: true,
            short_polling_time: Duration::from_millis(1000),
            max_suspend_timeout: Duration::from_secs(30),
            broker_permission: perm::READ | perm::WRITE,
            commercial_base_count: 1,
            send_timeout: ledgermq_core::limits::SEND_TIMEOUT,
            read_timeout: ledgermq_core::limits::READ_TIMEOUT,
            auto_create_topics: true,
            auto_create_groups: true,
            default_topic_queue_nums: 4,
        }
    }
}

impl BrokerConfig {
    /// Sets the bind address and registers its port under the given listener
    /// name.
    #[must_use]
    pub fn with_listener(mut self, bind_addr: SocketAddr, listener_name: &str) -> Self {
        self.bind_addr = bind_addr;
        self.listener_port_map
            .insert(bind_addr.port(), listener_name.to_string());
        self
    }

    /// Sets the backend identity of this broker.
    #[must_use]
    pub fn with_broker_address(mut self, address: &str) -> Self {
        self.broker_address = address.to_string();
        self
    }

    /// Sets the broker-wide permission bits.
    #[must_use]
    pub fn with_permission(mut self, permission: u32) -> Self {
        self.broker_permission = permission;
        self
    }

    /// Disables long polling (pulls are held only for the short polling
    /// interval).
    #[must_use]
    pub fn with_long_polling(mut self, enable: bool) -> Self {
        self.long_polling_enable = enable;
        self
    }

    /// The listener name advertised for a given ingress port.
    #[must_use]
    pub fn listener_name_for_port(&self, port: u16) -> Option<&str> {
        self.listener_port_map.get(&port).map(String::as_str)
    }

    /// Validates cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns a header-style error describing the first violated invariant.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.cluster_name.is_empty() {
            return Err(BrokerError::header("cluster_name must not be empty"));
        }
        if self.schedule_topic_partitions == 0 {
            return Err(BrokerError::header(
                "schedule_topic_partitions must be positive",
            ));
        }
        if self.max_delay_level <= 0 {
            return Err(BrokerError::header("max_delay_level must be positive"));
        }
        if self.default_topic_queue_nums == 0 {
            return Err(BrokerError::header(
                "default_topic_queue_nums must be positive",
            ));
        }
        if self.short_polling_time.is_zero() {
            return Err(BrokerError::header("short_polling_time must be positive"));
        }
        Ok(())
    }

    /// Config tuned for tests: fast timeouts, one-second suspend cap.
    #[must_use]
    pub fn fast_for_testing() -> Self {
        Self {
            short_polling_time: Duration::from_millis(100),
            max_suspend_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_millis(50),
            ..Self::default()
        }
    }
}
