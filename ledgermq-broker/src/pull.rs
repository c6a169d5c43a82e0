//! Pull pipeline: subscription validation, bounded read, long-poll
//! hand-off, and the commit-offset side effect.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use ledgermq_core::filter::ExpressionType;
use ledgermq_core::message::read_store_timestamp;
use tracing::{debug, info, warn};

use crate::context::{BrokerContext, ClientChannel};
use crate::error::BrokerResult;
use crate::hold::HeldPull;
use crate::remoting::code::{perm, pull_flag, response, MASTER_ID};
use crate::remoting::header::{PullMessageRequestHeader, PullMessageResponseHeader};
use crate::remoting::RemotingCommand;
use crate::session::GetMessageStatus;
use crate::subscription::{MessageModel, SubscriptionData};

/// Handles `PULL_MESSAGE`.
pub struct PullPipeline {
    ctx: Arc<BrokerContext>,
}

impl PullPipeline {
    /// Creates the pipeline.
    #[must_use]
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    /// Processes one pull.
    ///
    /// `allow_suspend` is true for first-time invocations from the wire and
    /// false when the hold service re-executes a parked request; a
    /// re-executed pull never re-suspends. `Ok(None)` means the request was
    /// parked and no response goes out now.
    ///
    /// # Errors
    ///
    /// Only fatal errors escape; every expected failure becomes a response
    /// code.
    #[allow(clippy::too_many_lines)]
    pub async fn process(
        &self,
        channel: &Arc<ClientChannel>,
        request_cmd: &RemotingCommand,
        allow_suspend: bool,
    ) -> BrokerResult<Option<RemotingCommand>> {
        let mut header: PullMessageRequestHeader = request_cmd.decode_header()?;
        debug!(
            group = %header.consumer_group,
            topic = %header.topic,
            queue_id = header.queue_id,
            queue_offset = header.queue_offset,
            allow_suspend,
            "pull request"
        );

        if !perm::is_readable(self.ctx.config.broker_permission) {
            return Ok(Some(RemotingCommand::new_response(
                response::NO_PERMISSION,
                Some("the broker pulling message is forbidden".to_string()),
            )));
        }

        let Some(group_config) = self.ctx.groups.find(&header.consumer_group) else {
            return Ok(Some(RemotingCommand::new_response(
                response::SUBSCRIPTION_GROUP_NOT_EXIST,
                Some(format!(
                    "subscription group [{}] does not exist",
                    header.consumer_group
                )),
            )));
        };

        if !group_config.consume_enable {
            return Ok(Some(RemotingCommand::new_response(
                response::NO_PERMISSION,
                Some(format!(
                    "subscription group no permission, {}",
                    header.consumer_group
                )),
            )));
        }

        let has_suspend = pull_flag::has_suspend(header.sys_flag);
        let has_commit_offset = pull_flag::has_commit_offset(header.sys_flag);
        let has_subscription = pull_flag::has_subscription(header.sys_flag);

        let Some(topic_config) = self.ctx.topics.select(&header.topic) else {
            warn!(topic = %header.topic, peer = %channel.peer, "pull for unknown topic");
            return Ok(Some(RemotingCommand::new_response(
                response::TOPIC_NOT_EXIST,
                Some(format!("topic [{}] not exist, apply first", header.topic)),
            )));
        };

        if !perm::is_readable(topic_config.perm) {
            return Ok(Some(RemotingCommand::new_response(
                response::NO_PERMISSION,
                Some(format!(
                    "the topic [{}] pulling message is forbidden",
                    header.topic
                )),
            )));
        }

        #[allow(clippy::cast_sign_loss)]
        if header.queue_id < 0 || header.queue_id as u32 >= topic_config.read_queue_nums {
            let remark = format!(
                "queueId [{}] is illegal, topic [{}] readQueueNums [{}]",
                header.queue_id, header.topic, topic_config.read_queue_nums
            );
            warn!(peer = %channel.peer, "{remark}");
            return Ok(Some(RemotingCommand::new_response(
                response::SYSTEM_ERROR,
                Some(remark),
            )));
        }

        let subscription = if has_subscription {
            match SubscriptionData::build(
                &header.topic,
                header.subscription.as_deref().unwrap_or("*"),
                ExpressionType::from_wire(header.expression_type.as_deref()),
                header.sub_version,
            ) {
                Ok(subscription) => subscription,
                Err(error) => {
                    warn!(%error, group = %header.consumer_group, "inline subscription parse failed");
                    return Ok(Some(RemotingCommand::new_response(
                        response::SUBSCRIPTION_PARSE_FAILED,
                        Some("parse the consumer's subscription failed".to_string()),
                    )));
                }
            }
        } else {
            if !self.ctx.consumers.group_exists(&header.consumer_group) {
                return Ok(Some(RemotingCommand::new_response(
                    response::SUBSCRIPTION_NOT_EXIST,
                    Some("the consumer's group info not exist".to_string()),
                )));
            }

            if !group_config.consume_broadcast_enable
                && self.ctx.consumers.group_model(&header.consumer_group)
                    == Some(MessageModel::Broadcasting)
            {
                return Ok(Some(RemotingCommand::new_response(
                    response::NO_PERMISSION,
                    Some(format!(
                        "the consumer group [{}] can not consume by broadcast way",
                        header.consumer_group
                    )),
                )));
            }

            let Some(stored) = self
                .ctx
                .consumers
                .find_subscription(&header.consumer_group, &header.topic)
            else {
                return Ok(Some(RemotingCommand::new_response(
                    response::SUBSCRIPTION_NOT_EXIST,
                    Some("the consumer's subscription not exist".to_string()),
                )));
            };

            if stored.sub_version < header.sub_version {
                warn!(
                    group = %header.consumer_group,
                    stored = stored.sub_version,
                    carried = header.sub_version,
                    "subscription not latest"
                );
                return Ok(Some(RemotingCommand::new_response(
                    response::SUBSCRIPTION_NOT_LATEST,
                    Some("the consumer's subscription not latest".to_string()),
                )));
            }
            stored
        };

        // The session comes from the group's registered channel table, not
        // from the connection directly: an unregistered consumer is told to
        // retry and re-heartbeat first.
        let Some(session) = self
            .ctx
            .consumers
            .session_for(&header.consumer_group, channel.id)
        else {
            info!(
                group = %header.consumer_group,
                peer = %channel.peer,
                "pull before consumer registration"
            );
            return Ok(Some(RemotingCommand::new_response(
                response::PULL_RETRY_IMMEDIATELY,
                Some("store getMessage return null".to_string()),
            )));
        };

        let result = session.get_message(&mut header, &subscription.filter).await?;
        // The session may have demanded suspension (partition not owned).
        let has_suspend = has_suspend || pull_flag::has_suspend(header.sys_flag);

        let mut response_header = PullMessageResponseHeader {
            suggest_which_broker_id: MASTER_ID,
            next_begin_offset: result.next_begin_offset,
            min_offset: result.min_offset,
            max_offset: result.max_offset,
        };

        let code = match result.status {
            GetMessageStatus::Found => response::SUCCESS,
            GetMessageStatus::MessageWasRemoving | GetMessageStatus::NoMatchedMessage => {
                response::PULL_RETRY_IMMEDIATELY
            }
            GetMessageStatus::NoMatchedLogicQueue | GetMessageStatus::NoMessageInQueue => {
                if header.queue_offset == 0 {
                    response::PULL_NOT_FOUND
                } else {
                    info!(
                        topic = %header.topic,
                        queue_id = header.queue_id,
                        group = %header.consumer_group,
                        requested = header.queue_offset,
                        corrected = result.next_begin_offset,
                        "no queue data, correcting request offset"
                    );
                    response::PULL_OFFSET_MOVED
                }
            }
            GetMessageStatus::OffsetFoundNull | GetMessageStatus::OffsetOverflowOne => {
                response::PULL_NOT_FOUND
            }
            GetMessageStatus::OffsetOverflowBadly => {
                info!(
                    requested = header.queue_offset,
                    max = result.max_offset,
                    peer = %channel.peer,
                    "request offset overflows badly"
                );
                response::PULL_OFFSET_MOVED
            }
            GetMessageStatus::OffsetTooSmall => {
                info!(
                    group = %header.consumer_group,
                    topic = %header.topic,
                    requested = header.queue_offset,
                    min = result.min_offset,
                    peer = %channel.peer,
                    "request offset too small"
                );
                response::PULL_OFFSET_MOVED
            }
        };

        let mut response_cmd = match code {
            response::SUCCESS => {
                let group = &header.consumer_group;
                self.ctx.stats.inc_group_get(
                    group,
                    &header.topic,
                    result.message_count() as u64,
                    result.buffer_total_size() as u64,
                );
                #[allow(clippy::cast_sign_loss)]
                let queue_id = header.queue_id as u32;
                if let Some(store_timestamp) =
                    result.buffers.last().and_then(|b| read_store_timestamp(b))
                {
                    let latency = now_millis().saturating_sub(store_timestamp).max(0);
                    #[allow(clippy::cast_sign_loss)]
                    self.ctx.stats.record_group_get_latency(
                        group,
                        &header.topic,
                        queue_id,
                        latency as u64,
                    );
                }
                self.ctx.stats.inc_commercial_rcv(
                    group,
                    result.message_count() as u64 * self.ctx.config.commercial_base_count,
                );

                let mut body = BytesMut::with_capacity(result.buffer_total_size());
                for buffer in &result.buffers {
                    body.extend_from_slice(buffer);
                }
                let mut cmd = RemotingCommand::new_response(response::SUCCESS, None);
                cmd.body = body.freeze();
                cmd
            }
            response::PULL_NOT_FOUND => {
                if allow_suspend && has_suspend {
                    let hold_timeout = if self.ctx.config.long_polling_enable {
                        Duration::from_millis(
                            u64::try_from(header.suspend_timeout_millis).unwrap_or(0),
                        )
                        .min(self.ctx.config.max_suspend_timeout)
                    } else {
                        self.ctx.config.short_polling_time
                    };
                    #[allow(clippy::cast_sign_loss)]
                    let queue_id = header.queue_id as u32;
                    debug!(
                        topic = %header.topic,
                        queue_id,
                        timeout_ms = hold_timeout.as_millis() as u64,
                        "suspending pull"
                    );
                    self.ctx.hold.suspend(
                        &header.topic,
                        queue_id,
                        HeldPull {
                            channel: Arc::clone(channel),
                            request: request_cmd.clone(),
                            deadline: Instant::now() + hold_timeout,
                        },
                    );
                    self.commit_offset_if_asked(channel, &header, allow_suspend, has_commit_offset);
                    return Ok(None);
                }
                RemotingCommand::new_response(response::PULL_NOT_FOUND, None)
            }
            response::PULL_OFFSET_MOVED => {
                response_header.suggest_which_broker_id = group_config.broker_id;
                RemotingCommand::new_response(response::PULL_OFFSET_MOVED, None)
            }
            _ => RemotingCommand::new_response(code, None),
        };
        response_cmd.remark = response_cmd
            .remark
            .take()
            .or_else(|| Some(format!("{:?}", result.status)));
        response_cmd.set_header(&response_header);

        self.commit_offset_if_asked(channel, &header, allow_suspend, has_commit_offset);
        Ok(Some(response_cmd))
    }

    /// The commit-offset side effect: applied once per pull that both allows
    /// suspension (a first-time invocation) and carries the commit flag.
    fn commit_offset_if_asked(
        &self,
        channel: &ClientChannel,
        header: &PullMessageRequestHeader,
        allow_suspend: bool,
        has_commit_offset: bool,
    ) {
        if allow_suspend && has_commit_offset {
            #[allow(clippy::cast_sign_loss)]
            self.ctx.offsets.commit_offset(
                channel.peer,
                &header.consumer_group,
                &header.topic,
                header.queue_id as u32,
                header.commit_offset,
            );
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
