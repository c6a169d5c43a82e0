//! Long-poll hold: parked pull requests and their wakeup machinery.
//!
//! Pulls that found nothing and asked for suspension are parked here, keyed
//! by (topic, queue id). Arrivals are a message-passing bus: the producer
//! path emits [`ArrivalEvent`]s onto a channel and a dedicated worker owns
//! the reaction: popping the bucket and re-executing each request through
//! the pull pipeline with suspension disabled. A periodic sweep expires
//! entries whose deadline passed the same way, so a timed-out pull that
//! still finds nothing goes back to the client as `PULL_NOT_FOUND`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::context::ClientChannel;
use crate::pull::PullPipeline;
use crate::remoting::RemotingCommand;

/// Sweep cadence for expired holds.
const SWEEP_INTERVAL: Duration = Duration::from_millis(200);

/// "New data may be available" notification for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrivalEvent {
    pub topic: String,
    pub queue_id: u32,
}

/// One parked pull request.
pub struct HeldPull {
    pub channel: Arc<ClientChannel>,
    pub request: RemotingCommand,
    pub deadline: Instant,
}

type HoldKey = (String, u32);
type Bucket = Arc<Mutex<Vec<HeldPull>>>;

/// The hold map plus the arrival-event sender.
pub struct PullHold {
    /// Buckets are individually locked; the outer map only grows under its
    /// read-write lock.
    buckets: RwLock<HashMap<HoldKey, Bucket>>,
    arrivals: mpsc::UnboundedSender<ArrivalEvent>,
}

impl PullHold {
    /// Creates the hold and the receiver its worker drains.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ArrivalEvent>) {
        let (arrivals, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                buckets: RwLock::new(HashMap::new()),
                arrivals,
            }),
            receiver,
        )
    }

    /// Parks one pull request.
    pub fn suspend(&self, topic: &str, queue_id: u32, held: HeldPull) {
        let bucket = self.bucket(topic, queue_id);
        bucket.lock().expect("hold bucket lock").push(held);
    }

    /// Emits an arrival notification. Safe to call from any path; a missing
    /// worker (shutdown) just drops the event.
    pub fn notify_arrival(&self, topic: &str, queue_id: u32) {
        let event = ArrivalEvent {
            topic: topic.to_string(),
            queue_id,
        };
        if self.arrivals.send(event).is_err() {
            debug!(topic, queue_id, "hold worker gone, arrival dropped");
        }
    }

    /// Number of currently parked pulls (test surface).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let buckets = self.buckets.read().expect("hold map lock");
        buckets
            .values()
            .map(|bucket| bucket.lock().expect("hold bucket lock").len())
            .sum()
    }

    fn bucket(&self, topic: &str, queue_id: u32) -> Bucket {
        let key = (topic.to_string(), queue_id);
        {
            let buckets = self.buckets.read().expect("hold map lock");
            if let Some(bucket) = buckets.get(&key) {
                return Arc::clone(bucket);
            }
        }
        let mut buckets = self.buckets.write().expect("hold map lock");
        Arc::clone(buckets.entry(key).or_default())
    }

    /// Pops every request parked under (topic, queue).
    fn take_bucket(&self, topic: &str, queue_id: u32) -> Vec<HeldPull> {
        let key = (topic.to_string(), queue_id);
        let buckets = self.buckets.read().expect("hold map lock");
        match buckets.get(&key) {
            Some(bucket) => std::mem::take(&mut *bucket.lock().expect("hold bucket lock")),
            None => Vec::new(),
        }
    }

    /// Pops every request whose deadline has passed.
    fn take_expired(&self, now: Instant) -> Vec<HeldPull> {
        let buckets = self.buckets.read().expect("hold map lock");
        let mut expired = Vec::new();
        for bucket in buckets.values() {
            let mut held = bucket.lock().expect("hold bucket lock");
            let mut index = 0;
            while index < held.len() {
                if held[index].deadline <= now {
                    expired.push(held.swap_remove(index));
                } else {
                    index += 1;
                }
            }
        }
        expired
    }
}

/// Runs the hold worker: reacts to arrivals and sweeps timeouts,
/// re-executing parked pulls on the pull pipeline with `allow_suspend =
/// false` and writing results back to their original connections.
pub fn start_hold_worker(
    hold: Arc<PullHold>,
    mut arrivals: mpsc::UnboundedReceiver<ArrivalEvent>,
    pipeline: Arc<PullPipeline>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            let woken = tokio::select! {
                event = arrivals.recv() => match event {
                    Some(event) => {
                        debug!(topic = %event.topic, queue_id = event.queue_id, "arrival wakeup");
                        hold.take_bucket(&event.topic, event.queue_id)
                    }
                    None => break,
                },
                _ = sweep.tick() => hold.take_expired(Instant::now()),
            };

            for held in woken {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    rerun_held_pull(&pipeline, held).await;
                });
            }
        }
        debug!("hold worker stopped");
    })
}

async fn rerun_held_pull(pipeline: &PullPipeline, held: HeldPull) {
    let opaque = held.request.opaque;
    match pipeline.process(&held.channel, &held.request, false).await {
        Ok(Some(mut response)) => {
            response.finish_response(opaque);
            if !held.channel.send(response) {
                warn!(peer = %held.channel.peer, "write-back to suspended puller failed");
            }
        }
        // allow_suspend=false guarantees a response; treat None as a bug
        // guard rather than silence.
        Ok(None) => error!("re-executed pull tried to re-suspend"),
        Err(error) => {
            error!(%error, peer = %held.channel.peer, "re-executed pull failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgermq_core::ChannelId;
    use std::net::SocketAddr;

    fn test_channel() -> (Arc<ClientChannel>, mpsc::UnboundedReceiver<RemotingCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let store: Arc<dyn ledgermq_backend::LogStore> =
            Arc::new(ledgermq_backend::MemoryLogStore::new());
        let session = crate::session::Session::for_tests(
            store,
            Arc::new(crate::config::BrokerConfig::fast_for_testing()),
        );
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let local: SocketAddr = "127.0.0.1:9876".parse().unwrap();
        (
            Arc::new(ClientChannel {
                id: ChannelId::new(1),
                peer,
                local,
                sender,
                session,
                closed: Arc::new(tokio::sync::Notify::new()),
            }),
            receiver,
        )
    }

    fn held(channel: &Arc<ClientChannel>, deadline: Instant) -> HeldPull {
        HeldPull {
            channel: Arc::clone(channel),
            request: RemotingCommand::new_request(crate::remoting::code::request::PULL_MESSAGE),
            deadline,
        }
    }

    #[tokio::test]
    async fn test_suspend_and_take_bucket() {
        let (hold, _arrivals) = PullHold::new();
        let (channel, _rx) = test_channel();

        hold.suspend("orders", 0, held(&channel, Instant::now() + Duration::from_secs(5)));
        hold.suspend("orders", 0, held(&channel, Instant::now() + Duration::from_secs(5)));
        hold.suspend("orders", 1, held(&channel, Instant::now() + Duration::from_secs(5)));
        assert_eq!(hold.pending_count(), 3);

        let woken = hold.take_bucket("orders", 0);
        assert_eq!(woken.len(), 2);
        assert_eq!(hold.pending_count(), 1);
        assert!(hold.take_bucket("orders", 0).is_empty());
        assert!(hold.take_bucket("other", 0).is_empty());
    }

    #[tokio::test]
    async fn test_take_expired_only_past_deadline() {
        let (hold, _arrivals) = PullHold::new();
        let (channel, _rx) = test_channel();
        let now = Instant::now();

        hold.suspend("orders", 0, held(&channel, now - Duration::from_millis(1)));
        hold.suspend("orders", 0, held(&channel, now + Duration::from_secs(5)));

        let expired = hold.take_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(hold.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_notify_reaches_receiver() {
        let (hold, mut arrivals) = PullHold::new();
        hold.notify_arrival("orders", 3);
        let event = arrivals.recv().await.unwrap();
        assert_eq!(
            event,
            ArrivalEvent {
                topic: "orders".to_string(),
                queue_id: 3
            }
        );
    }
}
