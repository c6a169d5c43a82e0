//! Broker-side counters.
//!
//! Incremented on the send and pull success paths; read back by tests and
//! whatever scraping a deployment wires up. Deliberately simple: a single
//! lock around plain maps, since every increment is nanoseconds of held
//! time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct StatsInner {
    topic_put_nums: HashMap<String, u64>,
    topic_put_size: HashMap<String, u64>,
    group_get_nums: HashMap<(String, String), u64>,
    group_get_size: HashMap<(String, String), u64>,
    group_get_latency: HashMap<(String, String, u32), u64>,
    send_back_nums: HashMap<(String, String), u64>,
    commercial_rcv: HashMap<String, u64>,
}

/// Broker counters.
#[derive(Default)]
pub struct BrokerStats {
    inner: Mutex<StatsInner>,
    broker_put_nums: AtomicU64,
    broker_get_nums: AtomicU64,
}

impl BrokerStats {
    /// Records a successful put of `nums` messages totaling `size` bytes.
    pub fn inc_topic_put(&self, topic: &str, nums: u64, size: u64) {
        let mut inner = self.inner.lock().expect("stats lock");
        *inner.topic_put_nums.entry(topic.to_string()).or_default() += nums;
        *inner.topic_put_size.entry(topic.to_string()).or_default() += size;
        drop(inner);
        self.broker_put_nums.fetch_add(nums, Ordering::Relaxed);
    }

    /// Records a successful pull of `nums` messages totaling `size` bytes.
    pub fn inc_group_get(&self, group: &str, topic: &str, nums: u64, size: u64) {
        let key = (group.to_string(), topic.to_string());
        let mut inner = self.inner.lock().expect("stats lock");
        *inner.group_get_nums.entry(key.clone()).or_default() += nums;
        *inner.group_get_size.entry(key).or_default() += size;
        drop(inner);
        self.broker_get_nums.fetch_add(nums, Ordering::Relaxed);
    }

    /// Records the store-to-delivery latency of the newest pulled message.
    pub fn record_group_get_latency(&self, group: &str, topic: &str, queue_id: u32, millis: u64) {
        let mut inner = self.inner.lock().expect("stats lock");
        inner
            .group_get_latency
            .insert((group.to_string(), topic.to_string(), queue_id), millis);
    }

    /// Records a consumer send-back.
    pub fn inc_send_back(&self, group: &str, topic: &str) {
        let mut inner = self.inner.lock().expect("stats lock");
        *inner
            .send_back_nums
            .entry((group.to_string(), topic.to_string()))
            .or_default() += 1;
    }

    /// Records billable receive units for an owner.
    pub fn inc_commercial_rcv(&self, owner: &str, units: u64) {
        let mut inner = self.inner.lock().expect("stats lock");
        *inner.commercial_rcv.entry(owner.to_string()).or_default() += units;
    }

    /// Messages put on a topic so far.
    #[must_use]
    pub fn topic_put_nums(&self, topic: &str) -> u64 {
        self.inner
            .lock()
            .expect("stats lock")
            .topic_put_nums
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Messages pulled by a group from a topic so far.
    #[must_use]
    pub fn group_get_nums(&self, group: &str, topic: &str) -> u64 {
        self.inner
            .lock()
            .expect("stats lock")
            .group_get_nums
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Send-backs recorded for a group/topic.
    #[must_use]
    pub fn send_back_nums(&self, group: &str, topic: &str) -> u64 {
        self.inner
            .lock()
            .expect("stats lock")
            .send_back_nums
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Total messages put across all topics.
    #[must_use]
    pub fn broker_put_nums(&self) -> u64 {
        self.broker_put_nums.load(Ordering::Relaxed)
    }

    /// Total messages pulled across all groups.
    #[must_use]
    pub fn broker_get_nums(&self) -> u64 {
        self.broker_get_nums.load(Ordering::Relaxed)
    }
}
