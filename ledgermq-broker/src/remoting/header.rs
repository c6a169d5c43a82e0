//! Typed command headers.
//!
//! The wire carries custom headers as a string→string ext-field map; these
//! structs give the pipelines typed access with per-field validation. Field
//! names follow the legacy protocol exactly, including the single-letter
//! names of the compact V2 send header.

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{BrokerError, BrokerResult};

/// A header that flattens to/from the command ext-field map.
pub trait CommandHeader: Sized {
    /// Serializes into ext fields.
    fn to_ext_fields(&self) -> HashMap<String, String>;

    /// Deserializes from ext fields.
    ///
    /// # Errors
    ///
    /// Returns a header error when a required field is missing or does not
    /// parse.
    fn from_ext_fields(fields: &HashMap<String, String>) -> BrokerResult<Self>;
}

fn required<'a>(fields: &'a HashMap<String, String>, key: &str) -> BrokerResult<&'a str> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| BrokerError::header(format!("missing field {key}")))
}

fn parse<T: FromStr>(fields: &HashMap<String, String>, key: &str) -> BrokerResult<T> {
    required(fields, key)?
        .parse()
        .map_err(|_| BrokerError::header(format!("malformed field {key}")))
}

fn parse_optional<T: FromStr>(
    fields: &HashMap<String, String>,
    key: &str,
) -> BrokerResult<Option<T>> {
    match fields.get(key) {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| BrokerError::header(format!("malformed field {key}"))),
    }
}

fn put(fields: &mut HashMap<String, String>, key: &str, value: impl ToString) {
    fields.insert(key.to_string(), value.to_string());
}

fn put_optional(fields: &mut HashMap<String, String>, key: &str, value: Option<impl ToString>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), value.to_string());
    }
}

/// Header of `SEND_MESSAGE`, `SEND_MESSAGE_V2`, and `SEND_BATCH_MESSAGE`.
#[derive(Debug, Clone, Default)]
pub struct SendMessageRequestHeader {
    pub producer_group: String,
    pub topic: String,
    pub default_topic: String,
    pub default_topic_queue_nums: i32,
    pub queue_id: i32,
    pub sys_flag: i32,
    pub born_timestamp: i64,
    pub flag: i32,
    pub properties: Option<String>,
    pub reconsume_times: Option<i32>,
    pub unit_mode: bool,
    pub batch: bool,
    pub max_reconsume_times: Option<i32>,
}

impl SendMessageRequestHeader {
    /// Decodes the compact V2 form (single-letter field names).
    ///
    /// # Errors
    ///
    /// Returns a header error when a required field is missing or malformed.
    pub fn from_v2_fields(fields: &HashMap<String, String>) -> BrokerResult<Self> {
        Ok(Self {
            producer_group: required(fields, "a")?.to_string(),
            topic: required(fields, "b")?.to_string(),
            default_topic: required(fields, "c")?.to_string(),
            default_topic_queue_nums: parse(fields, "d")?,
            queue_id: parse(fields, "e")?,
            sys_flag: parse(fields, "f")?,
            born_timestamp: parse(fields, "g")?,
            flag: parse(fields, "h")?,
            properties: fields.get("i").cloned(),
            reconsume_times: parse_optional(fields, "j")?,
            unit_mode: parse_optional(fields, "k")?.unwrap_or(false),
            max_reconsume_times: parse_optional(fields, "l")?,
            batch: parse_optional(fields, "m")?.unwrap_or(false),
        })
    }

    /// Encodes the compact V2 form.
    #[must_use]
    pub fn to_v2_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        put(&mut fields, "a", &self.producer_group);
        put(&mut fields, "b", &self.topic);
        put(&mut fields, "c", &self.default_topic);
        put(&mut fields, "d", self.default_topic_queue_nums);
        put(&mut fields, "e", self.queue_id);
        put(&mut fields, "f", self.sys_flag);
        put(&mut fields, "g", self.born_timestamp);
        put(&mut fields, "h", self.flag);
        put_optional(&mut fields, "i", self.properties.as_ref());
        put_optional(&mut fields, "j", self.reconsume_times);
        put(&mut fields, "k", self.unit_mode);
        put_optional(&mut fields, "l", self.max_reconsume_times);
        put(&mut fields, "m", self.batch);
        fields
    }
}

impl CommandHeader for SendMessageRequestHeader {
    fn to_ext_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        put(&mut fields, "producerGroup", &self.producer_group);
        put(&mut fields, "topic", &self.topic);
        put(&mut fields, "defaultTopic", &self.default_topic);
        put(
            &mut fields,
            "defaultTopicQueueNums",
            self.default_topic_queue_nums,
        );
        put(&mut fields, "queueId", self.queue_id);
        put(&mut fields, "sysFlag", self.sys_flag);
        put(&mut fields, "bornTimestamp", self.born_timestamp);
        put(&mut fields, "flag", self.flag);
        put_optional(&mut fields, "properties", self.properties.as_ref());
        put_optional(&mut fields, "reconsumeTimes", self.reconsume_times);
        put(&mut fields, "unitMode", self.unit_mode);
        put(&mut fields, "batch", self.batch);
        put_optional(&mut fields, "maxReconsumeTimes", self.max_reconsume_times);
        fields
    }

    fn from_ext_fields(fields: &HashMap<String, String>) -> BrokerResult<Self> {
        Ok(Self {
            producer_group: required(fields, "producerGroup")?.to_string(),
            topic: required(fields, "topic")?.to_string(),
            default_topic: fields.get("defaultTopic").cloned().unwrap_or_default(),
            default_topic_queue_nums: parse_optional(fields, "defaultTopicQueueNums")?
                .unwrap_or(0),
            queue_id: parse(fields, "queueId")?,
            sys_flag: parse_optional(fields, "sysFlag")?.unwrap_or(0),
            born_timestamp: parse_optional(fields, "bornTimestamp")?.unwrap_or(0),
            flag: parse_optional(fields, "flag")?.unwrap_or(0),
            properties: fields.get("properties").cloned(),
            reconsume_times: parse_optional(fields, "reconsumeTimes")?,
            unit_mode: parse_optional(fields, "unitMode")?.unwrap_or(false),
            batch: parse_optional(fields, "batch")?.unwrap_or(false),
            max_reconsume_times: parse_optional(fields, "maxReconsumeTimes")?,
        })
    }
}

/// Header of a successful send response.
#[derive(Debug, Clone, Default)]
pub struct SendMessageResponseHeader {
    pub msg_id: String,
    pub queue_id: i32,
    pub queue_offset: i64,
}

impl CommandHeader for SendMessageResponseHeader {
    fn to_ext_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        put(&mut fields, "msgId", &self.msg_id);
        put(&mut fields, "queueId", self.queue_id);
        put(&mut fields, "queueOffset", self.queue_offset);
        fields
    }

    fn from_ext_fields(fields: &HashMap<String, String>) -> BrokerResult<Self> {
        Ok(Self {
            msg_id: required(fields, "msgId")?.to_string(),
            queue_id: parse(fields, "queueId")?,
            queue_offset: parse(fields, "queueOffset")?,
        })
    }
}

/// Header of `PULL_MESSAGE`.
#[derive(Debug, Clone, Default)]
pub struct PullMessageRequestHeader {
    pub consumer_group: String,
    pub topic: String,
    pub queue_id: i32,
    pub queue_offset: i64,
    pub max_msg_nums: i32,
    pub sys_flag: i32,
    pub commit_offset: i64,
    pub suspend_timeout_millis: i64,
    pub subscription: Option<String>,
    pub sub_version: i64,
    pub expression_type: Option<String>,
}

impl CommandHeader for PullMessageRequestHeader {
    fn to_ext_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        put(&mut fields, "consumerGroup", &self.consumer_group);
        put(&mut fields, "topic", &self.topic);
        put(&mut fields, "queueId", self.queue_id);
        put(&mut fields, "queueOffset", self.queue_offset);
        put(&mut fields, "maxMsgNums", self.max_msg_nums);
        put(&mut fields, "sysFlag", self.sys_flag);
        put(&mut fields, "commitOffset", self.commit_offset);
        put(
            &mut fields,
            "suspendTimeoutMillis",
            self.suspend_timeout_millis,
        );
        put_optional(&mut fields, "subscription", self.subscription.as_ref());
        put(&mut fields, "subVersion", self.sub_version);
        put_optional(&mut fields, "expressionType", self.expression_type.as_ref());
        fields
    }

    fn from_ext_fields(fields: &HashMap<String, String>) -> BrokerResult<Self> {
        Ok(Self {
            consumer_group: required(fields, "consumerGroup")?.to_string(),
            topic: required(fields, "topic")?.to_string(),
            queue_id: parse(fields, "queueId")?,
            queue_offset: parse(fields, "queueOffset")?,
            max_msg_nums: parse(fields, "maxMsgNums")?,
            sys_flag: parse(fields, "sysFlag")?,
            commit_offset: parse_optional(fields, "commitOffset")?.unwrap_or(0),
            suspend_timeout_millis: parse_optional(fields, "suspendTimeoutMillis")?.unwrap_or(0),
            subscription: fields.get("subscription").cloned(),
            sub_version: parse_optional(fields, "subVersion")?.unwrap_or(0),
            expression_type: fields.get("expressionType").cloned(),
        })
    }
}

/// Header of a pull response.
#[derive(Debug, Clone, Default)]
pub struct PullMessageResponseHeader {
    pub suggest_which_broker_id: u64,
    pub next_begin_offset: i64,
    pub min_offset: i64,
    pub max_offset: i64,
}

impl CommandHeader for PullMessageResponseHeader {
    fn to_ext_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        put(
            &mut fields,
            "suggestWhichBrokerId",
            self.suggest_which_broker_id,
        );
        put(&mut fields, "nextBeginOffset", self.next_begin_offset);
        put(&mut fields, "minOffset", self.min_offset);
        put(&mut fields, "maxOffset", self.max_offset);
        fields
    }

    fn from_ext_fields(fields: &HashMap<String, String>) -> BrokerResult<Self> {
        Ok(Self {
            suggest_which_broker_id: parse_optional(fields, "suggestWhichBrokerId")?.unwrap_or(0),
            next_begin_offset: parse(fields, "nextBeginOffset")?,
            min_offset: parse_optional(fields, "minOffset")?.unwrap_or(0),
            max_offset: parse_optional(fields, "maxOffset")?.unwrap_or(0),
        })
    }
}

/// Header of `CONSUMER_SEND_MSG_BACK`.
#[derive(Debug, Clone, Default)]
pub struct ConsumerSendMsgBackRequestHeader {
    pub offset: i64,
    pub group: String,
    pub delay_level: i32,
    pub origin_msg_id: Option<String>,
    pub origin_topic: String,
    pub unit_mode: bool,
    pub max_reconsume_times: Option<i32>,
}

impl CommandHeader for ConsumerSendMsgBackRequestHeader {
    fn to_ext_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        put(&mut fields, "offset", self.offset);
        put(&mut fields, "group", &self.group);
        put(&mut fields, "delayLevel", self.delay_level);
        put_optional(&mut fields, "originMsgId", self.origin_msg_id.as_ref());
        put(&mut fields, "originTopic", &self.origin_topic);
        put(&mut fields, "unitMode", self.unit_mode);
        put_optional(&mut fields, "maxReconsumeTimes", self.max_reconsume_times);
        fields
    }

    fn from_ext_fields(fields: &HashMap<String, String>) -> BrokerResult<Self> {
        Ok(Self {
            offset: parse(fields, "offset")?,
            group: required(fields, "group")?.to_string(),
            delay_level: parse_optional(fields, "delayLevel")?.unwrap_or(0),
            origin_msg_id: fields.get("originMsgId").cloned(),
            origin_topic: required(fields, "originTopic")?.to_string(),
            unit_mode: parse_optional(fields, "unitMode")?.unwrap_or(false),
            max_reconsume_times: parse_optional(fields, "maxReconsumeTimes")?,
        })
    }
}

/// Header of `GET_ROUTEINFO_BY_TOPIC`.
#[derive(Debug, Clone, Default)]
pub struct GetRouteInfoRequestHeader {
    pub topic: String,
}

impl CommandHeader for GetRouteInfoRequestHeader {
    fn to_ext_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        put(&mut fields, "topic", &self.topic);
        fields
    }

    fn from_ext_fields(fields: &HashMap<String, String>) -> BrokerResult<Self> {
        Ok(Self {
            topic: required(fields, "topic")?.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_header_round_trip() {
        let header = SendMessageRequestHeader {
            producer_group: "pg".into(),
            topic: "orders".into(),
            default_topic: "TBW102".into(),
            default_topic_queue_nums: 4,
            queue_id: 2,
            sys_flag: 0,
            born_timestamp: 1_700_000_000_000,
            flag: 0,
            properties: Some("TAGS\u{1}a\u{2}".into()),
            reconsume_times: Some(1),
            unit_mode: false,
            batch: false,
            max_reconsume_times: None,
        };
        let decoded =
            SendMessageRequestHeader::from_ext_fields(&header.to_ext_fields()).unwrap();
        assert_eq!(decoded.topic, "orders");
        assert_eq!(decoded.queue_id, 2);
        assert_eq!(decoded.reconsume_times, Some(1));
        assert_eq!(decoded.properties.as_deref(), Some("TAGS\u{1}a\u{2}"));
    }

    #[test]
    fn test_send_header_v2_round_trip() {
        let header = SendMessageRequestHeader {
            producer_group: "pg".into(),
            topic: "orders".into(),
            default_topic: "TBW102".into(),
            default_topic_queue_nums: 8,
            queue_id: 1,
            sys_flag: 4,
            born_timestamp: 123,
            flag: 9,
            properties: None,
            reconsume_times: None,
            unit_mode: true,
            batch: true,
            max_reconsume_times: Some(5),
        };
        let decoded =
            SendMessageRequestHeader::from_v2_fields(&header.to_v2_fields()).unwrap();
        assert_eq!(decoded.producer_group, "pg");
        assert_eq!(decoded.default_topic_queue_nums, 8);
        assert!(decoded.unit_mode);
        assert!(decoded.batch);
        assert_eq!(decoded.max_reconsume_times, Some(5));
    }

    #[test]
    fn test_pull_header_round_trip() {
        let header = PullMessageRequestHeader {
            consumer_group: "cg".into(),
            topic: "orders".into(),
            queue_id: 0,
            queue_offset: 42,
            max_msg_nums: 32,
            sys_flag: 3,
            commit_offset: 41,
            suspend_timeout_millis: 15_000,
            subscription: Some("*".into()),
            sub_version: 7,
            expression_type: Some("TAG".into()),
        };
        let decoded =
            PullMessageRequestHeader::from_ext_fields(&header.to_ext_fields()).unwrap();
        assert_eq!(decoded.queue_offset, 42);
        assert_eq!(decoded.sub_version, 7);
        assert_eq!(decoded.subscription.as_deref(), Some("*"));
    }

    #[test]
    fn test_missing_required_field() {
        let fields = HashMap::from([("topic".to_string(), "t".to_string())]);
        assert!(PullMessageRequestHeader::from_ext_fields(&fields).is_err());
    }

    #[test]
    fn test_malformed_numeric_field() {
        let mut fields = PullMessageRequestHeader::default().to_ext_fields();
        fields.insert("consumerGroup".into(), "cg".into());
        fields.insert("topic".into(), "t".into());
        fields.insert("queueOffset".into(), "not-a-number".into());
        assert!(PullMessageRequestHeader::from_ext_fields(&fields).is_err());
    }
}
