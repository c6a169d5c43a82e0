//! Producer pipeline: send, batch send, and consumer send-back.
//!
//! Validates the send header, classifies the message (normal / retry / DLQ /
//! delayed / batch), rewrites topic and queue where escalation demands it,
//! invokes the session's publish, and translates the store status into the
//! wire response code table.

use std::collections::HashMap;
use std::sync::Arc;

use ledgermq_core::limits::{DLQ_NUMS_PER_GROUP, MAX_TOPIC_LENGTH, VERSION_RETRY_OVERRIDE};
use ledgermq_core::message::{decode_batch_body, props, string_to_properties, BrokerMessage};
use ledgermq_core::topic::{LegacyTopic, RETRY_TOPIC_PREFIX};
use rand::Rng;
use tracing::{debug, warn};

use crate::context::{BrokerContext, ClientChannel};
use crate::error::BrokerResult;
use crate::remoting::code::{perm, request, response};
use crate::remoting::header::{
    ConsumerSendMsgBackRequestHeader, SendMessageRequestHeader, SendMessageResponseHeader,
};
use crate::remoting::RemotingCommand;
use crate::session::{PutMessageResult, PutMessageStatus};
use crate::topics::TopicConfig;

/// Handles `SEND_MESSAGE`, `SEND_MESSAGE_V2`, `SEND_BATCH_MESSAGE`, and
/// `CONSUMER_SEND_MSG_BACK`.
pub struct ProducerPipeline {
    ctx: Arc<BrokerContext>,
}

impl ProducerPipeline {
    /// Creates the pipeline.
    #[must_use]
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    /// Processes one producer-side request.
    ///
    /// # Errors
    ///
    /// Only fatal errors escape; every expected failure becomes a response
    /// code.
    pub async fn process(
        &self,
        channel: &ClientChannel,
        request_cmd: &RemotingCommand,
    ) -> BrokerResult<RemotingCommand> {
        if request_cmd.code == request::CONSUMER_SEND_MSG_BACK {
            return self.send_back(channel, request_cmd).await;
        }

        let header = parse_send_header(request_cmd)?;
        debug!(
            topic = %header.topic,
            group = %header.producer_group,
            queue_id = header.queue_id,
            batch = header.batch,
            "send request"
        );
        if header.batch {
            self.send_batch(channel, request_cmd, header).await
        } else {
            self.send_single(channel, request_cmd, header).await
        }
    }

    async fn send_single(
        &self,
        channel: &ClientChannel,
        request_cmd: &RemotingCommand,
        header: SendMessageRequestHeader,
    ) -> BrokerResult<RemotingCommand> {
        let topic_config = match self.msg_check(&header) {
            Ok(config) => config,
            Err(response) => return Ok(response),
        };

        let queue_id = resolve_queue_id(header.queue_id, topic_config.write_queue_nums);
        let properties = header
            .properties
            .as_deref()
            .map(string_to_properties)
            .unwrap_or_default();

        let mut msg = BrokerMessage {
            topic: header.topic.clone(),
            queue_id,
            flag: header.flag,
            sys_flag: header.sys_flag,
            body: request_cmd.body.clone(),
            properties,
            born_timestamp: header.born_timestamp,
            born_host: channel.peer,
            store_host: channel.local,
            reconsume_times: header.reconsume_times.unwrap_or(0),
        };

        if let Err(response) = self.handle_retry_and_dlq(request_cmd, &header, &mut msg) {
            return Ok(response);
        }
        msg.put_property(props::CLUSTER, self.ctx.config.cluster_name.clone());

        // Transaction prepare messages are rejected outright; only the
        // reconsume-with-delay shape older clients emit slips through.
        let prepared = msg
            .property(props::TRANSACTION_PREPARED)
            .is_some_and(|raw| raw.eq_ignore_ascii_case("true"));
        let delayed = msg.delay_level() > 0;
        let result = if prepared && !(msg.reconsume_times > 0 && delayed) {
            PutMessageResult::illegal()
        } else {
            channel
                .session
                .put_message(msg.clone(), &header.producer_group)
                .await?
        };

        let response = self.handle_put_result(&result, &msg.topic, msg.queue_id);
        // Delayed messages land on a delay pseudo-topic; waiters on the
        // client-visible topic only wake when the scheduler redelivers.
        if result.status == PutMessageStatus::PutOk && !delayed {
            self.ctx.hold.notify_arrival(&msg.topic, msg.queue_id);
        }
        Ok(response)
    }

    async fn send_batch(
        &self,
        channel: &ClientChannel,
        request_cmd: &RemotingCommand,
        header: SendMessageRequestHeader,
    ) -> BrokerResult<RemotingCommand> {
        let topic_config = match self.msg_check(&header) {
            Ok(config) => config,
            Err(response) => return Ok(response),
        };

        if header.topic.starts_with(RETRY_TOPIC_PREFIX) {
            return Ok(RemotingCommand::new_response(
                response::MESSAGE_ILLEGAL,
                Some(format!(
                    "batch request does not support retry group {}",
                    header.topic
                )),
            ));
        }

        let queue_id = resolve_queue_id(header.queue_id, topic_config.write_queue_nums);
        let shared_properties = header
            .properties
            .as_deref()
            .map(string_to_properties)
            .unwrap_or_default();

        let items = match decode_batch_body(&request_cmd.body) {
            Ok(items) if !items.is_empty() => items,
            Ok(_) => {
                return Ok(RemotingCommand::new_response(
                    response::MESSAGE_ILLEGAL,
                    Some("empty batch".to_string()),
                ));
            }
            Err(error) => {
                return Ok(RemotingCommand::new_response(
                    response::MESSAGE_ILLEGAL,
                    Some(format!("malformed batch body: {error}")),
                ));
            }
        };

        let messages: Vec<BrokerMessage> = items
            .into_iter()
            .map(|item| {
                let mut properties = shared_properties.clone();
                properties.extend(item.properties);
                properties.insert(
                    props::CLUSTER.to_string(),
                    self.ctx.config.cluster_name.clone(),
                );
                BrokerMessage {
                    topic: header.topic.clone(),
                    queue_id,
                    flag: item.flag,
                    sys_flag: header.sys_flag,
                    body: item.body,
                    properties,
                    born_timestamp: header.born_timestamp,
                    born_host: channel.peer,
                    store_host: channel.local,
                    reconsume_times: header.reconsume_times.unwrap_or(0),
                }
            })
            .collect();

        let result = channel
            .session
            .put_batch(messages, &header.producer_group)
            .await?;
        let response = self.handle_put_result(&result, &header.topic, queue_id);
        if result.status == PutMessageStatus::PutOk {
            self.ctx.hold.notify_arrival(&header.topic, queue_id);
        }
        Ok(response)
    }

    async fn send_back(
        &self,
        channel: &ClientChannel,
        request_cmd: &RemotingCommand,
    ) -> BrokerResult<RemotingCommand> {
        let header: ConsumerSendMsgBackRequestHeader = request_cmd.decode_header()?;

        let Some(group_config) = self.ctx.groups.find(&header.group) else {
            return Ok(RemotingCommand::new_response(
                response::SUBSCRIPTION_GROUP_NOT_EXIST,
                Some(format!("subscription group not exist, {}", header.group)),
            ));
        };

        if !perm::is_writeable(self.ctx.config.broker_permission) {
            return Ok(RemotingCommand::new_response(
                response::NO_PERMISSION,
                Some("the broker sending message is forbidden".to_string()),
            ));
        }

        if group_config.retry_queue_nums == 0 {
            return Ok(RemotingCommand::new_response(response::SUCCESS, None));
        }

        let mut new_topic = LegacyTopic::retry_topic(&header.group);
        let mut queue_id = rand::thread_rng().gen_range(0..group_config.retry_queue_nums);
        self.ctx.topics.create_for_send_back(
            &new_topic,
            group_config.retry_queue_nums,
            perm::READ | perm::WRITE,
        );

        let session = Arc::clone(&channel.session);
        let Some(origin) = session
            .lookup_by_offset(&header.origin_topic, header.offset)
            .await
        else {
            return Ok(RemotingCommand::new_response(
                response::SYSTEM_ERROR,
                Some(format!("look message by offset failed, {}", header.offset)),
            ));
        };

        let mut properties = origin.properties.clone();
        properties
            .entry(props::RETRY_TOPIC.to_string())
            .or_insert_with(|| origin.topic.clone());

        let mut delay_level = header.delay_level;
        let mut max_reconsume_times = group_config.retry_max_times;
        if request_cmd.version >= VERSION_RETRY_OVERRIDE {
            if let Some(header_max) = header.max_reconsume_times {
                max_reconsume_times = header_max;
            }
        }

        if origin.reconsume_times >= max_reconsume_times || delay_level < 0 {
            // Out of retries: the message parks in the group's dead-letter
            // bucket.
            new_topic = LegacyTopic::dlq_topic(&header.group);
            queue_id = rand::thread_rng().gen_range(0..DLQ_NUMS_PER_GROUP);
            self.ctx
                .topics
                .create_for_send_back(&new_topic, DLQ_NUMS_PER_GROUP, perm::WRITE);
        } else {
            if delay_level == 0 {
                delay_level = 3 + origin.reconsume_times;
            }
            properties.insert(props::DELAY.to_string(), delay_level.to_string());
        }

        properties
            .entry(props::ORIGIN_MESSAGE_ID.to_string())
            .or_insert_with(|| {
                header
                    .origin_msg_id
                    .clone()
                    .unwrap_or_else(|| format!("{}", header.offset))
            });

        let msg = BrokerMessage {
            topic: new_topic.clone(),
            queue_id,
            flag: origin.flag,
            sys_flag: origin.sys_flag,
            body: origin.body.clone(),
            properties,
            born_timestamp: origin.born_timestamp,
            born_host: origin.born_host,
            store_host: channel.local,
            reconsume_times: origin.reconsume_times + 1,
        };
        let delayed = msg.delay_level() > 0;

        let result = session.put_message(msg, &header.group).await?;
        if result.status == PutMessageStatus::PutOk {
            let back_topic = origin
                .property(props::RETRY_TOPIC)
                .unwrap_or_else(|| origin.topic.as_str());
            self.ctx.stats.inc_send_back(&header.group, back_topic);
            if !delayed {
                self.ctx.hold.notify_arrival(&new_topic, queue_id);
            }
            return Ok(RemotingCommand::new_response(response::SUCCESS, None));
        }
        Ok(RemotingCommand::new_response(
            response::SYSTEM_ERROR,
            Some(format!("{:?}", result.status)),
        ))
    }

    /// Precondition checks shared by single and batch sends. Returns the
    /// topic config or the short-circuit response.
    fn msg_check(&self, header: &SendMessageRequestHeader) -> Result<TopicConfig, RemotingCommand> {
        if !perm::is_writeable(self.ctx.config.broker_permission) {
            return Err(RemotingCommand::new_response(
                response::NO_PERMISSION,
                Some("the broker sending message is forbidden".to_string()),
            ));
        }
        if header.topic.is_empty() || header.topic.len() > MAX_TOPIC_LENGTH {
            return Err(RemotingCommand::new_response(
                response::MESSAGE_ILLEGAL,
                Some(format!("topic length {} is illegal", header.topic.len())),
            ));
        }
        if LegacyTopic::parse(&header.topic).is_err() {
            return Err(RemotingCommand::new_response(
                response::MESSAGE_ILLEGAL,
                Some(format!("topic [{}] is illegal", header.topic)),
            ));
        }
        let Some(topic_config) = self.ctx.topics.select(&header.topic) else {
            return Err(RemotingCommand::new_response(
                response::TOPIC_NOT_EXIST,
                Some(format!("topic [{}] not exist, apply first", header.topic)),
            ));
        };
        if !perm::is_writeable(topic_config.perm) {
            return Err(RemotingCommand::new_response(
                response::NO_PERMISSION,
                Some(format!("the topic [{}] sending message is forbidden", header.topic)),
            ));
        }
        let max_queue = topic_config
            .write_queue_nums
            .max(topic_config.read_queue_nums);
        if header.queue_id >= 0 {
            #[allow(clippy::cast_sign_loss)]
            let queue_id = header.queue_id as u32;
            if queue_id >= max_queue {
                return Err(RemotingCommand::new_response(
                    response::SYSTEM_ERROR,
                    Some(format!(
                        "queueId [{}] is illegal, topic [{}] queue nums [{max_queue}]",
                        header.queue_id, header.topic
                    )),
                ));
            }
        }
        Ok(topic_config)
    }

    /// Retry-topic sends past the retry budget are diverted to the group's
    /// DLQ before they reach the store.
    fn handle_retry_and_dlq(
        &self,
        request_cmd: &RemotingCommand,
        header: &SendMessageRequestHeader,
        msg: &mut BrokerMessage,
    ) -> Result<(), RemotingCommand> {
        let Some(group) = header.topic.strip_prefix(RETRY_TOPIC_PREFIX) else {
            return Ok(());
        };
        let group = group.to_string();

        let Some(group_config) = self.ctx.groups.find(&group) else {
            return Err(RemotingCommand::new_response(
                response::SUBSCRIPTION_GROUP_NOT_EXIST,
                Some(format!("subscription group not exist, {group}")),
            ));
        };

        let mut max_reconsume_times = group_config.retry_max_times;
        if request_cmd.version >= VERSION_RETRY_OVERRIDE {
            if let Some(header_max) = header.max_reconsume_times {
                max_reconsume_times = header_max;
            }
        }

        let reconsume_times = header.reconsume_times.unwrap_or(0);
        if reconsume_times >= max_reconsume_times {
            let dlq_topic = LegacyTopic::dlq_topic(&group);
            let queue_id = rand::thread_rng().gen_range(0..DLQ_NUMS_PER_GROUP);
            self.ctx
                .topics
                .create_for_send_back(&dlq_topic, DLQ_NUMS_PER_GROUP, perm::WRITE);
            warn!(
                group,
                topic = %dlq_topic,
                reconsume_times,
                "retry budget exhausted, diverting to DLQ"
            );
            msg.topic = dlq_topic;
            msg.queue_id = queue_id;
        }
        Ok(())
    }

    fn handle_put_result(
        &self,
        result: &PutMessageResult,
        topic: &str,
        queue_id: u32,
    ) -> RemotingCommand {
        let (code, remark, send_ok) = match result.status {
            PutMessageStatus::PutOk => (response::SUCCESS, None, true),
            PutMessageStatus::FlushDiskTimeout => (response::FLUSH_DISK_TIMEOUT, None, true),
            PutMessageStatus::FlushSlaveTimeout => (response::FLUSH_SLAVE_TIMEOUT, None, true),
            PutMessageStatus::SlaveNotAvailable => (response::SLAVE_NOT_AVAILABLE, None, true),
            PutMessageStatus::CreateMappedFileFailed => (
                response::SYSTEM_ERROR,
                Some("create mapped file failed, server is busy or broken.".to_string()),
                false,
            ),
            PutMessageStatus::MessageIllegal | PutMessageStatus::PropertiesSizeExceeded => (
                response::MESSAGE_ILLEGAL,
                Some("the message is illegal, maybe msg body or properties length not matched"
                    .to_string()),
                false,
            ),
            PutMessageStatus::ServiceNotAvailable => (
                response::SERVICE_NOT_AVAILABLE,
                Some("service not available now".to_string()),
                false,
            ),
            PutMessageStatus::OsPageCacheBusy => (
                response::SYSTEM_ERROR,
                Some("broker busy, start flow control for a while".to_string()),
                false,
            ),
            PutMessageStatus::UnknownError => {
                (response::SYSTEM_ERROR, Some("UNKNOWN_ERROR".to_string()), false)
            }
        };

        let mut response_cmd = RemotingCommand::new_response(code, remark);
        if send_ok {
            self.ctx.stats.inc_topic_put(
                topic,
                result.append.msg_num as u64,
                result.append.wrote_bytes as u64,
            );
            #[allow(clippy::cast_possible_wrap)]
            response_cmd.set_header(&SendMessageResponseHeader {
                msg_id: result.append.msg_id.clone(),
                queue_id: queue_id as i32,
                queue_offset: result.append.logics_offset,
            });
        }
        response_cmd
    }
}

/// Parses the send header for any of the three send request codes.
fn parse_send_header(request_cmd: &RemotingCommand) -> BrokerResult<SendMessageRequestHeader> {
    match request_cmd.code {
        request::SEND_MESSAGE => request_cmd.decode_header(),
        _ => {
            // V2 and batch sends use the compact single-letter field names.
            let empty = HashMap::new();
            let fields = request_cmd.ext_fields.as_ref().unwrap_or(&empty);
            let mut header = SendMessageRequestHeader::from_v2_fields(fields)?;
            if request_cmd.code == request::SEND_BATCH_MESSAGE {
                header.batch = true;
            }
            Ok(header)
        }
    }
}

fn resolve_queue_id(requested: i32, write_queue_nums: u32) -> u32 {
    if requested < 0 {
        rand::thread_rng().gen_range(0..write_queue_nums.max(1))
    } else {
        #[allow(clippy::cast_sign_loss)]
        let queue_id = requested as u32;
        queue_id
    }
}
