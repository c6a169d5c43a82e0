//! Message model and the legacy store frame.
//!
//! Messages cross three representations here:
//!
//! - [`BrokerMessage`]: a message accepted from a producer, after header
//!   validation and topic/queue rewrites, ready to encode;
//! - the **store frame**: the byte layout persisted in the backend and
//!   returned verbatim to pulling consumers (fixed prefix fields, then body,
//!   topic, properties);
//! - [`MessageExt`]: a decoded frame, used by the filter and the
//!   send-back/lookup paths.
//!
//! The frame layout is part of the wire contract: consumers parse it
//! directly out of the pull response body. Field order and widths are fixed;
//! only the two host fields vary (8 bytes for IPv4, 20 for IPv6, selected by
//! sys-flag bits).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, CoreResult};
use crate::limits::MAX_TOPIC_LENGTH;

/// Magic value in every store frame, kept bit-compatible with the legacy
/// broker so existing clients accept the frames.
pub const MESSAGE_MAGIC_CODE: i32 = -626_843_481;

/// Byte position of the queue-offset field in a store frame.
pub const QUEUE_OFFSET_POSITION: usize = 20;

/// Byte position of the physical-offset field in a store frame.
pub const PHYSICAL_OFFSET_POSITION: usize = 28;

/// Byte position of the sys-flag field in a store frame.
pub const SYS_FLAG_POSITION: usize = 36;

/// Sys-flag bits carried end to end through the broker.
pub mod sys_flag {
    /// Body is compressed.
    pub const COMPRESSED: i32 = 1;
    /// Message carries multiple tags.
    pub const MULTI_TAGS: i32 = 1 << 1;
    /// Transaction type mask (two bits).
    pub const TRANSACTION_TYPE_MASK: i32 = 0b11 << 2;
    /// Not a transactional message.
    pub const TRANSACTION_NOT_TYPE: i32 = 0;
    /// Transaction prepare (half) message.
    pub const TRANSACTION_PREPARED_TYPE: i32 = 1 << 2;
    /// Transaction commit marker.
    pub const TRANSACTION_COMMIT_TYPE: i32 = 2 << 2;
    /// Transaction rollback marker.
    pub const TRANSACTION_ROLLBACK_TYPE: i32 = 3 << 2;
    /// Born host is IPv6 (20-byte host field instead of 8).
    pub const BORNHOST_V6: i32 = 1 << 4;
    /// Store host is IPv6.
    pub const STOREHOST_V6: i32 = 1 << 5;

    /// Extracts the transaction type bits.
    #[must_use]
    pub const fn transaction_value(flag: i32) -> i32 {
        flag & TRANSACTION_TYPE_MASK
    }
}

/// Well-known property keys.
pub mod props {
    /// Comma-free tag string used by tag filters.
    pub const TAGS: &str = "TAGS";
    /// Business keys.
    pub const KEYS: &str = "KEYS";
    /// Delay level requested by the producer.
    pub const DELAY: &str = "DELAY";
    /// Original topic of a message parked on a delay pseudo-topic.
    pub const REAL_TOPIC: &str = "REAL_TOPIC";
    /// Original queue id of a message parked on a delay pseudo-topic.
    pub const REAL_QUEUE_ID: &str = "REAL_QID";
    /// First-failure topic recorded when a message enters a retry bucket.
    pub const RETRY_TOPIC: &str = "RETRY_TOPIC";
    /// Message id of the very first delivery attempt.
    pub const ORIGIN_MESSAGE_ID: &str = "ORIGIN_MESSAGE_ID";
    /// Cluster that first accepted the message.
    pub const CLUSTER: &str = "CLUSTER";
    /// Marks a transaction prepare message ("true").
    pub const TRANSACTION_PREPARED: &str = "TRAN_MSG";
    /// Client-generated unique key.
    pub const UNIQ_KEY: &str = "UNIQ_KEY";
}

/// Separator between a property name and its value inside the encoded
/// properties string.
pub const NAME_VALUE_SEPARATOR: char = '\u{1}';

/// Separator between properties inside the encoded properties string.
pub const PROPERTY_SEPARATOR: char = '\u{2}';

/// Encodes a property map into the wire string form.
#[must_use]
pub fn properties_to_string(properties: &HashMap<String, String>) -> String {
    let mut out = String::new();
    // Sorted so the encoding is deterministic (the wire does not care, the
    // tests do).
    let mut keys: Vec<&String> = properties.keys().collect();
    keys.sort();
    for key in keys {
        out.push_str(key);
        out.push(NAME_VALUE_SEPARATOR);
        out.push_str(&properties[key]);
        out.push(PROPERTY_SEPARATOR);
    }
    out
}

/// Decodes the wire properties string into a map. Entries without a value
/// separator are skipped.
#[must_use]
pub fn string_to_properties(raw: &str) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    for pair in raw.split(PROPERTY_SEPARATOR) {
        if pair.is_empty() {
            continue;
        }
        if let Some((name, value)) = pair.split_once(NAME_VALUE_SEPARATOR) {
            properties.insert(name.to_string(), value.to_string());
        }
    }
    properties
}

/// A message accepted by the producer pipeline, ready to store.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub queue_id: u32,
    pub flag: i32,
    pub sys_flag: i32,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
    pub born_timestamp: i64,
    pub born_host: SocketAddr,
    pub store_host: SocketAddr,
    pub reconsume_times: i32,
}

impl BrokerMessage {
    /// Looks up a property value.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Sets a property, replacing any previous value.
    pub fn put_property(&mut self, key: &str, value: impl Into<String>) {
        self.properties.insert(key.to_string(), value.into());
    }

    /// The delay level requested by the producer (0 when absent).
    #[must_use]
    pub fn delay_level(&self) -> i32 {
        self.property(props::DELAY)
            .and_then(|level| level.parse().ok())
            .unwrap_or(0)
    }

    /// Overwrites the delay level property.
    pub fn set_delay_level(&mut self, level: i32) {
        self.put_property(props::DELAY, level.to_string());
    }

    /// Encodes the store frame for this message.
    ///
    /// The queue-offset and physical-offset fields are written as zero; the
    /// pull path patches them once the backend position is known (see
    /// [`patch_frame_offsets`]).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Encode`] if the topic or properties exceed their
    /// length fields.
    pub fn encode(&self, store_timestamp: i64) -> CoreResult<Bytes> {
        if self.topic.len() > MAX_TOPIC_LENGTH {
            return Err(CoreError::Encode(format!(
                "topic length {} exceeds {MAX_TOPIC_LENGTH}",
                self.topic.len()
            )));
        }
        let properties = properties_to_string(&self.properties);
        if properties.len() > usize::from(u16::MAX) {
            return Err(CoreError::Encode(format!(
                "properties length {} exceeds {}",
                properties.len(),
                u16::MAX
            )));
        }

        let mut sys_flag = self.sys_flag;
        if self.born_host.is_ipv6() {
            sys_flag |= sys_flag::BORNHOST_V6;
        }
        if self.store_host.is_ipv6() {
            sys_flag |= sys_flag::STOREHOST_V6;
        }

        let total = 4 + 4 + 4 + 4 + 4       // totalsize, magic, bodycrc, queueid, flag
            + 8 + 8 + 4 + 8                 // queueoffset, physicaloffset, sysflag, borntimestamp
            + host_length(self.born_host)
            + 8                             // storetimestamp
            + host_length(self.store_host)
            + 4 + 8                         // reconsumetimes, preparedtransactionoffset
            + 4 + self.body.len()
            + 1 + self.topic.len()
            + 2 + properties.len();

        let mut buf = BytesMut::with_capacity(total);
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        buf.put_i32(total as i32);
        buf.put_i32(MESSAGE_MAGIC_CODE);
        #[allow(clippy::cast_possible_wrap)]
        buf.put_i32(crc32fast::hash(&self.body) as i32);
        #[allow(clippy::cast_possible_wrap)]
        buf.put_i32(self.queue_id as i32);
        buf.put_i32(self.flag);
        buf.put_i64(0); // queue offset, patched on read
        buf.put_i64(0); // physical offset, patched on read
        buf.put_i32(sys_flag);
        buf.put_i64(self.born_timestamp);
        put_host(&mut buf, self.born_host);
        buf.put_i64(store_timestamp);
        put_host(&mut buf, self.store_host);
        buf.put_i32(self.reconsume_times);
        buf.put_i64(0); // prepared transaction offset (transactions unsupported)
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        buf.put_i32(self.body.len() as i32);
        buf.put_slice(&self.body);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u8(self.topic.len() as u8);
        buf.put_slice(self.topic.as_bytes());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u16(properties.len() as u16);
        buf.put_slice(properties.as_bytes());

        Ok(buf.freeze())
    }
}

/// A decoded store frame.
#[derive(Debug, Clone)]
pub struct MessageExt {
    pub topic: String,
    pub queue_id: u32,
    pub flag: i32,
    pub sys_flag: i32,
    pub queue_offset: i64,
    pub physical_offset: i64,
    pub born_timestamp: i64,
    pub born_host: SocketAddr,
    pub store_timestamp: i64,
    pub store_host: SocketAddr,
    pub reconsume_times: i32,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
}

impl MessageExt {
    /// Looks up a property value.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// The message's tag string, if any.
    #[must_use]
    pub fn tags(&self) -> Option<&str> {
        self.property(props::TAGS)
    }
}

/// Decodes one store frame.
///
/// # Errors
///
/// Returns [`CoreError::MalformedFrame`] on truncation, a bad magic value, or
/// inconsistent length fields.
#[allow(clippy::missing_panics_doc)] // bounds are checked before every fixed-width read
pub fn decode_frame(frame: &[u8]) -> CoreResult<MessageExt> {
    let mut buf = frame;
    let need = |buf: &[u8], n: usize, what: &str| -> CoreResult<()> {
        if buf.remaining() < n {
            return Err(CoreError::MalformedFrame(format!(
                "truncated before {what}"
            )));
        }
        Ok(())
    };

    need(buf, 4 + 4 + 4 + 4 + 4 + 8 + 8 + 4 + 8, "fixed prefix")?;
    let total_size = buf.get_i32();
    if total_size < 0 || total_size as usize != frame.len() {
        return Err(CoreError::MalformedFrame(format!(
            "total size {total_size} != frame length {}",
            frame.len()
        )));
    }
    let magic = buf.get_i32();
    if magic != MESSAGE_MAGIC_CODE {
        return Err(CoreError::MalformedFrame(format!("bad magic {magic:#x}")));
    }
    let _body_crc = buf.get_i32();
    let queue_id = buf.get_i32();
    if queue_id < 0 {
        return Err(CoreError::MalformedFrame(format!(
            "negative queue id {queue_id}"
        )));
    }
    let flag = buf.get_i32();
    let queue_offset = buf.get_i64();
    let physical_offset = buf.get_i64();
    let sys_flag = buf.get_i32();
    let born_timestamp = buf.get_i64();
    let born_host = get_host(&mut buf, sys_flag & sys_flag::BORNHOST_V6 != 0)?;
    need(buf, 8, "store timestamp")?;
    let store_timestamp = buf.get_i64();
    let store_host = get_host(&mut buf, sys_flag & sys_flag::STOREHOST_V6 != 0)?;
    need(buf, 4 + 8 + 4, "body length")?;
    let reconsume_times = buf.get_i32();
    let _prepared_transaction_offset = buf.get_i64();

    let body_len = buf.get_i32();
    if body_len < 0 {
        return Err(CoreError::MalformedFrame("negative body length".into()));
    }
    need(buf, body_len as usize, "body")?;
    let body = Bytes::copy_from_slice(&buf[..body_len as usize]);
    buf.advance(body_len as usize);

    need(buf, 1, "topic length")?;
    let topic_len = usize::from(buf.get_u8());
    need(buf, topic_len, "topic")?;
    let topic = std::str::from_utf8(&buf[..topic_len])
        .map_err(|_| CoreError::MalformedFrame("topic is not utf-8".into()))?
        .to_string();
    buf.advance(topic_len);

    need(buf, 2, "properties length")?;
    let properties_len = usize::from(buf.get_u16());
    need(buf, properties_len, "properties")?;
    let properties = std::str::from_utf8(&buf[..properties_len])
        .map_err(|_| CoreError::MalformedFrame("properties are not utf-8".into()))?;
    let properties = string_to_properties(properties);

    #[allow(clippy::cast_sign_loss)]
    let queue_id = queue_id as u32;
    Ok(MessageExt {
        topic,
        queue_id,
        flag,
        sys_flag,
        queue_offset,
        physical_offset,
        born_timestamp,
        born_host,
        store_timestamp,
        store_host,
        reconsume_times,
        body,
        properties,
    })
}

/// Rewrites the queue-offset and physical-offset fields of an encoded frame
/// in place. The pull path uses this to stamp each returned frame with the
/// encoded ledger position it was read from.
pub fn patch_frame_offsets(frame: &mut [u8], queue_offset: i64, physical_offset: i64) {
    if frame.len() >= PHYSICAL_OFFSET_POSITION + 8 {
        frame[QUEUE_OFFSET_POSITION..QUEUE_OFFSET_POSITION + 8]
            .copy_from_slice(&queue_offset.to_be_bytes());
        frame[PHYSICAL_OFFSET_POSITION..PHYSICAL_OFFSET_POSITION + 8]
            .copy_from_slice(&physical_offset.to_be_bytes());
    }
}

/// Byte position of the store-timestamp field, which floats with the born
/// host width.
#[must_use]
pub const fn store_timestamp_position(sys_flag: i32) -> usize {
    let born_host = if sys_flag & sys_flag::BORNHOST_V6 == 0 {
        8
    } else {
        20
    };
    SYS_FLAG_POSITION + 4 + 8 + born_host
}

/// Reads the store timestamp out of an encoded frame, if long enough.
#[must_use]
pub fn read_store_timestamp(frame: &[u8]) -> Option<i64> {
    if frame.len() < SYS_FLAG_POSITION + 4 {
        return None;
    }
    let sys_flag = i32::from_be_bytes([
        frame[SYS_FLAG_POSITION],
        frame[SYS_FLAG_POSITION + 1],
        frame[SYS_FLAG_POSITION + 2],
        frame[SYS_FLAG_POSITION + 3],
    ]);
    let at = store_timestamp_position(sys_flag);
    if frame.len() < at + 8 {
        return None;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&frame[at..at + 8]);
    Some(i64::from_be_bytes(raw))
}

/// Formats the wire message-id string: store host ip + port + encoded offset,
/// hex encoded.
#[must_use]
pub fn create_message_id(store_host: SocketAddr, offset: i64) -> String {
    let mut raw = Vec::with_capacity(28);
    match store_host.ip() {
        IpAddr::V4(ip) => raw.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => raw.extend_from_slice(&ip.octets()),
    }
    raw.extend_from_slice(&i32::from(store_host.port()).to_be_bytes());
    raw.extend_from_slice(&offset.to_be_bytes());

    let mut out = String::with_capacity(raw.len() * 2);
    for byte in raw {
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// One sub-message inside a batch send body.
///
/// Batch bodies are a concatenation of light frames, each:
/// `TOTALSIZE(4) MAGIC(4) BODYCRC(4) FLAG(4) BODYLEN(4) body PROPLEN(2)
/// properties`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub flag: i32,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
}

/// Encodes one batch sub-message (client-side helper, used by tests).
#[must_use]
pub fn encode_batch_item(item: &BatchItem) -> Bytes {
    let properties = properties_to_string(&item.properties);
    let total = 4 + 4 + 4 + 4 + 4 + item.body.len() + 2 + properties.len();
    let mut buf = BytesMut::with_capacity(total);
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    buf.put_i32(total as i32);
    buf.put_i32(MESSAGE_MAGIC_CODE);
    #[allow(clippy::cast_possible_wrap)]
    buf.put_i32(crc32fast::hash(&item.body) as i32);
    buf.put_i32(item.flag);
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    buf.put_i32(item.body.len() as i32);
    buf.put_slice(&item.body);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(properties.len() as u16);
    buf.put_slice(properties.as_bytes());
    buf.freeze()
}

/// Splits a batch send body into its sub-messages.
///
/// # Errors
///
/// Returns [`CoreError::MalformedFrame`] on truncation or inconsistent
/// lengths.
pub fn decode_batch_body(mut buf: &[u8]) -> CoreResult<Vec<BatchItem>> {
    let mut items = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 + 4 + 4 + 4 + 4 {
            return Err(CoreError::MalformedFrame(
                "truncated batch item prefix".into(),
            ));
        }
        let total_size = buf.get_i32();
        let _magic = buf.get_i32();
        let _body_crc = buf.get_i32();
        let flag = buf.get_i32();
        let body_len = buf.get_i32();
        if total_size < 22 || body_len < 0 {
            return Err(CoreError::MalformedFrame(format!(
                "bad batch item lengths: total={total_size} body={body_len}"
            )));
        }
        if buf.remaining() < body_len as usize + 2 {
            return Err(CoreError::MalformedFrame("truncated batch body".into()));
        }
        let body = Bytes::copy_from_slice(&buf[..body_len as usize]);
        buf.advance(body_len as usize);
        let properties_len = usize::from(buf.get_u16());
        if buf.remaining() < properties_len {
            return Err(CoreError::MalformedFrame(
                "truncated batch properties".into(),
            ));
        }
        let properties = std::str::from_utf8(&buf[..properties_len])
            .map_err(|_| CoreError::MalformedFrame("batch properties are not utf-8".into()))?;
        buf.advance(properties_len);
        items.push(BatchItem {
            flag,
            body,
            properties: string_to_properties(properties),
        });
    }
    Ok(items)
}

fn host_length(addr: SocketAddr) -> usize {
    if addr.is_ipv6() {
        20
    } else {
        8
    }
}

fn put_host(buf: &mut BytesMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => buf.put_slice(&ip.octets()),
        IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
    }
    buf.put_i32(i32::from(addr.port()));
}

fn get_host(buf: &mut &[u8], v6: bool) -> CoreResult<SocketAddr> {
    let ip_len = if v6 { 16 } else { 4 };
    if buf.remaining() < ip_len + 4 {
        return Err(CoreError::MalformedFrame("truncated host field".into()));
    }
    let ip: IpAddr = if v6 {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&buf[..16]);
        IpAddr::from(octets)
    } else {
        let mut octets = [0u8; 4];
        octets.copy_from_slice(&buf[..4]);
        IpAddr::from(octets)
    };
    buf.advance(ip_len);
    let port = buf.get_i32();
    let port = u16::try_from(port)
        .map_err(|_| CoreError::MalformedFrame(format!("port {port} out of range")))?;
    Ok(SocketAddr::new(ip, port))
}
