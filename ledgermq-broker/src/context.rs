//! Shared broker state and the per-connection channel handle.

use std::net::SocketAddr;
use std::sync::Arc;

use ledgermq_backend::LogStore;
use ledgermq_core::ChannelId;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::config::BrokerConfig;
use crate::error::BrokerResult;
use crate::hold::{ArrivalEvent, PullHold};
use crate::offsets::ConsumerOffsetManager;
use crate::remoting::RemotingCommand;
use crate::session::Session;
use crate::stats::BrokerStats;
use crate::subscription::{ConsumerManager, SubscriptionGroupManager};
use crate::topics::TopicConfigManager;

/// Everything the request pipelines share. Immutable wiring; all interior
/// state lives behind the managers' own locks.
pub struct BrokerContext {
    pub config: Arc<BrokerConfig>,
    pub store: Arc<dyn LogStore>,
    pub topics: Arc<TopicConfigManager>,
    pub groups: Arc<SubscriptionGroupManager>,
    pub consumers: Arc<ConsumerManager>,
    pub offsets: Arc<ConsumerOffsetManager>,
    pub stats: Arc<BrokerStats>,
    pub hold: Arc<PullHold>,
}

impl BrokerContext {
    /// Wires up the context. Returns the arrival-event receiver the hold
    /// worker consumes.
    ///
    /// # Errors
    ///
    /// Fails when the config does not validate.
    pub fn new(
        config: BrokerConfig,
        store: Arc<dyn LogStore>,
    ) -> BrokerResult<(Arc<Self>, mpsc::UnboundedReceiver<ArrivalEvent>)> {
        config.validate()?;
        let config = Arc::new(config);
        let topics = Arc::new(TopicConfigManager::new(Arc::clone(&store), &config));
        let offsets = Arc::new(ConsumerOffsetManager::new(Arc::clone(&store)));
        let (hold, arrivals) = PullHold::new();
        let ctx = Arc::new(Self {
            topics,
            offsets,
            groups: Arc::new(SubscriptionGroupManager::new(config.auto_create_groups)),
            consumers: Arc::new(ConsumerManager::default()),
            stats: Arc::new(BrokerStats::default()),
            hold,
            store,
            config,
        });
        Ok((ctx, arrivals))
    }

    /// Builds the session for a newly accepted connection.
    #[must_use]
    pub fn new_session(
        &self,
        channel_id: ChannelId,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Arc<Session> {
        Session::new(
            channel_id,
            peer,
            local,
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            Arc::clone(&self.topics),
            Arc::clone(&self.offsets),
        )
    }
}

/// Handle to one client connection: identity plus the outbound command
/// funnel (a dedicated writer task owns the socket's write half).
pub struct ClientChannel {
    pub id: ChannelId,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub sender: mpsc::UnboundedSender<RemotingCommand>,
    pub session: Arc<Session>,
    /// Signaled to force-close the connection (fatal protocol violations).
    pub closed: Arc<Notify>,
}

impl ClientChannel {
    /// Queues a command for the writer task. Returns false once the
    /// connection is gone.
    pub fn send(&self, command: RemotingCommand) -> bool {
        let sent = self.sender.send(command).is_ok();
        if !sent {
            debug!(peer = %self.peer, "dropping response for closed connection");
        }
        sent
    }

    /// Severs the connection; the read loop exits on the next poll. Uses a
    /// stored permit so a close signaled between polls is not lost.
    pub fn close(&self) {
        self.closed.notify_one();
    }
}
