//! The broker's TCP front: accept loop, per-connection framing, and the
//! request-code dispatch table.
//!
//! Each connection gets one read loop (frame splitting and decode only; it
//! never blocks on the backend), a writer task that owns the socket's write
//! half and drains the connection's outbound queue, and a session. Requests
//! are handled on spawned tasks; backend calls therefore never run on the
//! read loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use ledgermq_backend::LogStore;
use ledgermq_core::filter::ExpressionType;
use ledgermq_core::ChannelId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::context::{BrokerContext, ClientChannel};
use crate::error::{BrokerError, BrokerResult};
use crate::hold::{start_hold_worker, ArrivalEvent};
use crate::producer::ProducerPipeline;
use crate::pull::PullPipeline;
use crate::remoting::code::{request, response};
use crate::remoting::{codec, RemotingCommand};
use crate::route::RouteResponder;
use crate::subscription::{ClientChannelInfo, HeartbeatData, MessageModel, SubscriptionData};

/// The protocol broker server.
pub struct BrokerServer {
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<Notify>,
    arrivals: Mutex<Option<mpsc::UnboundedReceiver<ArrivalEvent>>>,
    next_channel_id: AtomicU64,
}

impl BrokerServer {
    /// Wires the broker against a log store.
    ///
    /// # Errors
    ///
    /// Fails when the configuration does not validate.
    pub fn new(config: BrokerConfig, store: Arc<dyn LogStore>) -> BrokerResult<Self> {
        let (ctx, arrivals) = BrokerContext::new(config, store)?;
        let pull = Arc::new(PullPipeline::new(Arc::clone(&ctx)));
        let dispatcher = Arc::new(Dispatcher {
            producer: ProducerPipeline::new(Arc::clone(&ctx)),
            route: RouteResponder::new(Arc::clone(&ctx)),
            pull,
            ctx,
        });
        Ok(Self {
            dispatcher,
            shutdown: Arc::new(Notify::new()),
            arrivals: Mutex::new(Some(arrivals)),
            next_channel_id: AtomicU64::new(1),
        })
    }

    /// Shared broker state (test and embedding surface).
    #[must_use]
    pub fn context(&self) -> Arc<BrokerContext> {
        Arc::clone(&self.dispatcher.ctx)
    }

    /// Handle to signal shutdown.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the configured address and serves until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind fails.
    pub async fn run(&self) -> BrokerResult<()> {
        let listener = TcpListener::bind(self.dispatcher.ctx.config.bind_addr).await?;
        info!(addr = %self.dispatcher.ctx.config.bind_addr, "broker listening");
        self.run_with_listener(listener).await
    }

    /// Serves on an already-bound listener until shutdown (lets tests bind
    /// port 0 first).
    ///
    /// # Errors
    ///
    /// Never fails once accepting; accept errors are logged and retried.
    pub async fn run_with_listener(&self, listener: TcpListener) -> BrokerResult<()> {
        if let Some(arrivals) = self.arrivals.lock().expect("arrivals lock").take() {
            start_hold_worker(
                Arc::clone(&self.dispatcher.ctx.hold),
                arrivals,
                Arc::clone(&self.dispatcher.pull),
            );
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let channel_id =
                                ChannelId::new(self.next_channel_id.fetch_add(1, Ordering::Relaxed));
                            debug!(%peer, channel = %channel_id, "new connection");
                            let dispatcher = Arc::clone(&self.dispatcher);
                            tokio::spawn(async move {
                                handle_connection(dispatcher, channel_id, stream, peer).await;
                            });
                        }
                        Err(error) => {
                            error!(%error, "accept failed");
                        }
                    }
                }
                () = self.shutdown.notified() => {
                    info!("broker shutting down");
                    return Ok(());
                }
            }
        }
    }
}

struct Dispatcher {
    ctx: Arc<BrokerContext>,
    producer: ProducerPipeline,
    pull: Arc<PullPipeline>,
    route: RouteResponder,
}

impl Dispatcher {
    async fn dispatch(
        &self,
        channel: &Arc<ClientChannel>,
        command: &RemotingCommand,
    ) -> BrokerResult<Option<RemotingCommand>> {
        match command.code {
            request::SEND_MESSAGE
            | request::SEND_MESSAGE_V2
            | request::SEND_BATCH_MESSAGE
            | request::CONSUMER_SEND_MSG_BACK => {
                self.producer.process(channel, command).await.map(Some)
            }
            request::PULL_MESSAGE => self.pull.process(channel, command, true).await,
            request::GET_ROUTEINFO_BY_TOPIC | request::GET_BROKER_CLUSTER_INFO => {
                self.route.process(channel, command).await.map(Some)
            }
            request::HEART_BEAT => self.heartbeat(channel, command).map(Some),
            request::UNREGISTER_CLIENT => {
                self.ctx.consumers.unregister_channel(channel.id);
                Ok(Some(RemotingCommand::new_response(response::SUCCESS, None)))
            }
            other => {
                warn!(code = other, peer = %channel.peer, "unsupported request code");
                Ok(Some(RemotingCommand::new_response(
                    response::REQUEST_CODE_NOT_SUPPORTED,
                    Some(format!("request code {other} not supported")),
                )))
            }
        }
    }

    /// Heartbeats create/refresh consumer group membership; pulls validate
    /// against the state registered here.
    fn heartbeat(
        &self,
        channel: &Arc<ClientChannel>,
        command: &RemotingCommand,
    ) -> BrokerResult<RemotingCommand> {
        let data: HeartbeatData = serde_json::from_slice(&command.body)?;
        for consumer in &data.consumer_data_set {
            // Ensure the group config exists (auto-create path).
            let _ = self.ctx.groups.find(&consumer.group_name);

            let mut subscriptions = Vec::with_capacity(consumer.subscription_data_set.len());
            for wire in &consumer.subscription_data_set {
                match SubscriptionData::build(
                    &wire.topic,
                    &wire.sub_string,
                    ExpressionType::from_wire(wire.expression_type.as_deref()),
                    wire.sub_version,
                ) {
                    Ok(subscription) => subscriptions.push(subscription),
                    Err(error) => {
                        warn!(
                            %error,
                            group = %consumer.group_name,
                            topic = %wire.topic,
                            "skipping unparsable subscription"
                        );
                    }
                }
            }

            self.ctx.consumers.register(
                &consumer.group_name,
                MessageModel::from_wire(&consumer.message_model),
                subscriptions,
                ClientChannelInfo {
                    channel_id: channel.id,
                    client_id: data.client_id.clone(),
                    session: Arc::clone(&channel.session),
                },
            );
        }
        Ok(RemotingCommand::new_response(response::SUCCESS, None))
    }
}

async fn handle_connection(
    dispatcher: Arc<Dispatcher>,
    channel_id: ChannelId,
    stream: TcpStream,
    peer: std::net::SocketAddr,
) {
    let local = match stream.local_addr() {
        Ok(local) => local,
        Err(error) => {
            warn!(%error, %peer, "no local address for connection");
            return;
        }
    };

    let session = dispatcher.ctx.new_session(channel_id, peer, local);
    let (sender, mut outbound) = mpsc::unbounded_channel::<RemotingCommand>();
    let channel = Arc::new(ClientChannel {
        id: channel_id,
        peer,
        local,
        sender,
        session: Arc::clone(&session),
        closed: Arc::new(Notify::new()),
    });

    let (mut read_half, mut write_half) = stream.into_split();

    let writer = tokio::spawn(async move {
        while let Some(command) = outbound.recv().await {
            match command.encode() {
                Ok(frame) => {
                    if let Err(error) = write_half.write_all(&frame).await {
                        debug!(%error, "write failed, stopping writer");
                        break;
                    }
                }
                Err(error) => {
                    error!(%error, "response encode failed");
                }
            }
        }
    });

    match read_loop(&dispatcher, &channel, &mut read_half).await {
        Ok(()) => info!(%peer, channel = %channel_id, "connection closed"),
        Err(error) => {
            // First exception moves the session to FAILED and logs loudly;
            // anything after that is debug noise.
            if channel.session.mark_failed() {
                warn!(%peer, channel = %channel_id, %error, "connection error");
            } else {
                debug!(%peer, channel = %channel_id, %error, "connection error after failure");
            }
        }
    }

    dispatcher.ctx.consumers.unregister_channel(channel_id);
    session.close_all().await;
    writer.abort();
}

async fn read_loop(
    dispatcher: &Arc<Dispatcher>,
    channel: &Arc<ClientChannel>,
    read_half: &mut OwnedReadHalf,
) -> BrokerResult<()> {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    loop {
        tokio::select! {
            read = read_half.read_buf(&mut buf) => {
                if read? == 0 {
                    return Ok(());
                }
            }
            () = channel.closed.notified() => {
                return Err(BrokerError::ConnectionClosed);
            }
        }

        while let Some(payload) = codec::read_frame(&mut buf)? {
            let command = RemotingCommand::decode(payload)?;
            let dispatcher = Arc::clone(dispatcher);
            let channel = Arc::clone(channel);
            // Handlers may block on the backend; keep them off the read
            // loop.
            tokio::spawn(async move {
                handle_command(&dispatcher, &channel, command).await;
            });
        }
    }
}

async fn handle_command(
    dispatcher: &Dispatcher,
    channel: &Arc<ClientChannel>,
    command: RemotingCommand,
) {
    let opaque = command.opaque;
    let oneway = command.is_oneway();
    match dispatcher.dispatch(channel, &command).await {
        Ok(Some(mut response_cmd)) => {
            if !oneway {
                response_cmd.finish_response(opaque);
                channel.send(response_cmd);
            }
        }
        Ok(None) => {} // suspended; the hold path responds later
        Err(error) if error.is_fatal() => {
            error!(%error, peer = %channel.peer, code = command.code, "fatal request failure");
            channel.session.mark_failed();
            channel.close();
        }
        Err(error) => {
            warn!(%error, peer = %channel.peer, code = command.code, "request failed");
            if !oneway {
                let mut response_cmd = RemotingCommand::new_response(
                    error.response_code(),
                    Some(error.to_string()),
                );
                response_cmd.finish_response(opaque);
                channel.send(response_cmd);
            }
        }
    }
}
