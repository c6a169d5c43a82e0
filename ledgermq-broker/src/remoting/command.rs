//! The remoting command: the unit of the legacy wire protocol.
//!
//! # Wire format
//!
//! ```text
//! ┌──────────────┬──────────────────────┬─────────────┬──────────┐
//! │ total length │ serialize ┆ header   │   header    │   body   │
//! │   (4B, BE)   │ type (1B) ┆ len (3B) │   bytes     │  bytes   │
//! └──────────────┴──────────────────────┴─────────────┴──────────┘
//! ```
//!
//! `total length` covers everything after itself. The header is JSON
//! (serialize type 0) or the compact binary form (type 1); both carry the
//! same fields: code, language, version, opaque, flag, remark, and a
//! string→string ext-field map that typed headers flatten into.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};
use crate::remoting::header::CommandHeader;

/// Flag bit marking a command as a response.
const FLAG_RESPONSE: i32 = 1;

/// Flag bit marking a command as oneway (no response expected).
const FLAG_ONEWAY: i32 = 1 << 1;

/// Protocol version this broker advertises.
pub const BROKER_VERSION: i32 = 401;

/// Header serialization formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializeType {
    /// JSON header (the default, and what this broker emits).
    #[default]
    Json,
    /// Compact binary header.
    Binary,
}

impl SerializeType {
    fn from_byte(byte: u8) -> BrokerResult<Self> {
        match byte {
            0 => Ok(Self::Json),
            1 => Ok(Self::Binary),
            other => Err(BrokerError::frame(format!(
                "unknown header serialization {other}"
            ))),
        }
    }

    const fn as_byte(self) -> u8 {
        match self {
            Self::Json => 0,
            Self::Binary => 1,
        }
    }
}

/// Client language tag carried in every command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Language {
    Name(String),
}

impl Default for Language {
    fn default() -> Self {
        Self::Name("RUST".to_string())
    }
}

impl Language {
    fn as_str(&self) -> &str {
        let Self::Name(name) = self;
        name
    }

    fn to_binary(&self) -> u8 {
        match self.as_str() {
            "JAVA" => 0,
            "CPP" => 1,
            "GO" => 9,
            "RUST" => 12,
            _ => 7, // OTHER
        }
    }

    fn from_binary(byte: u8) -> Self {
        Self::Name(
            match byte {
                0 => "JAVA",
                1 => "CPP",
                9 => "GO",
                12 => "RUST",
                _ => "OTHER",
            }
            .to_string(),
        )
    }
}

/// One decoded protocol command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotingCommand {
    pub code: i32,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub opaque: i32,
    #[serde(default)]
    pub flag: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_fields: Option<HashMap<String, String>>,
    #[serde(skip)]
    pub body: Bytes,
    #[serde(skip)]
    pub serialize_type: SerializeType,
}

impl RemotingCommand {
    /// Creates a request command with no custom header.
    #[must_use]
    pub fn new_request(code: i32) -> Self {
        Self {
            code,
            language: Language::default(),
            version: BROKER_VERSION,
            opaque: 0,
            flag: 0,
            remark: None,
            ext_fields: None,
            body: Bytes::new(),
            serialize_type: SerializeType::Json,
        }
    }

    /// Creates a request carrying a typed header.
    #[must_use]
    pub fn with_header<H: CommandHeader>(code: i32, header: &H) -> Self {
        let mut command = Self::new_request(code);
        command.ext_fields = Some(header.to_ext_fields());
        command
    }

    /// Creates a response command.
    #[must_use]
    pub fn new_response(code: i32, remark: Option<String>) -> Self {
        let mut command = Self::new_request(code);
        command.remark = remark;
        command.flag |= FLAG_RESPONSE;
        command
    }

    /// Attaches a typed header, replacing any existing ext fields.
    pub fn set_header<H: CommandHeader>(&mut self, header: &H) {
        self.ext_fields = Some(header.to_ext_fields());
    }

    /// Decodes the typed header out of the ext-field map.
    ///
    /// # Errors
    ///
    /// Returns a header error when required fields are missing or malformed.
    pub fn decode_header<H: CommandHeader>(&self) -> BrokerResult<H> {
        match &self.ext_fields {
            Some(fields) => H::from_ext_fields(fields),
            None => H::from_ext_fields(&HashMap::new()),
        }
    }

    /// Marks this command as a response to `opaque`.
    pub fn finish_response(&mut self, opaque: i32) {
        self.opaque = opaque;
        self.flag |= FLAG_RESPONSE;
    }

    /// True for response commands.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        self.flag & FLAG_RESPONSE != 0
    }

    /// True for oneway requests (no response is written back).
    #[must_use]
    pub const fn is_oneway(&self) -> bool {
        self.flag & FLAG_ONEWAY != 0
    }

    /// Encodes the full frame, including the leading total-length word.
    ///
    /// # Errors
    ///
    /// Returns a frame error if the JSON header fails to serialize or the
    /// frame exceeds the length fields.
    pub fn encode(&self) -> BrokerResult<BytesMut> {
        let header = match self.serialize_type {
            SerializeType::Json => Bytes::from(serde_json::to_vec(self)?),
            SerializeType::Binary => self.encode_binary_header(),
        };
        if header.len() > 0x00FF_FFFF {
            return Err(BrokerError::frame(format!(
                "header too large: {} bytes",
                header.len()
            )));
        }

        let total = 4 + header.len() + self.body.len();
        let mut frame = BytesMut::with_capacity(4 + total);
        #[allow(clippy::cast_possible_truncation)]
        frame.put_u32(total as u32);
        #[allow(clippy::cast_possible_truncation)]
        let header_word =
            (u32::from(self.serialize_type.as_byte()) << 24) | (header.len() as u32);
        frame.put_u32(header_word);
        frame.put_slice(&header);
        frame.put_slice(&self.body);
        Ok(frame)
    }

    /// Decodes one frame payload (everything after the total-length word).
    ///
    /// # Errors
    ///
    /// Returns a frame error on truncation, unknown serialization type, or a
    /// malformed header.
    pub fn decode(mut payload: Bytes) -> BrokerResult<Self> {
        if payload.len() < 4 {
            return Err(BrokerError::frame("frame shorter than header word"));
        }
        let header_word = payload.get_u32();
        let serialize_type = SerializeType::from_byte((header_word >> 24) as u8)?;
        let header_len = (header_word & 0x00FF_FFFF) as usize;
        if payload.len() < header_len {
            return Err(BrokerError::frame(format!(
                "header length {header_len} exceeds frame"
            )));
        }
        let header = payload.split_to(header_len);
        let body = payload;

        let mut command = match serialize_type {
            SerializeType::Json => serde_json::from_slice::<Self>(&header)?,
            SerializeType::Binary => Self::decode_binary_header(header)?,
        };
        command.body = body;
        command.serialize_type = serialize_type;
        Ok(command)
    }

    fn encode_binary_header(&self) -> Bytes {
        let mut buf = BytesMut::new();
        #[allow(clippy::cast_possible_truncation)]
        buf.put_i16(self.code as i16);
        buf.put_u8(self.language.to_binary());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_i16(self.version as i16);
        buf.put_i32(self.opaque);
        buf.put_i32(self.flag);
        match &self.remark {
            Some(remark) => {
                #[allow(clippy::cast_possible_truncation)]
                buf.put_i32(remark.len() as i32);
                buf.put_slice(remark.as_bytes());
            }
            None => buf.put_i32(0),
        }
        let mut ext = BytesMut::new();
        if let Some(fields) = &self.ext_fields {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            for key in keys {
                let value = &fields[key];
                #[allow(clippy::cast_possible_truncation)]
                ext.put_i16(key.len() as i16);
                ext.put_slice(key.as_bytes());
                #[allow(clippy::cast_possible_truncation)]
                ext.put_i32(value.len() as i32);
                ext.put_slice(value.as_bytes());
            }
        }
        #[allow(clippy::cast_possible_truncation)]
        buf.put_i32(ext.len() as i32);
        buf.put_slice(&ext);
        buf.freeze()
    }

    fn decode_binary_header(mut header: Bytes) -> BrokerResult<Self> {
        let need = |header: &Bytes, n: usize| -> BrokerResult<()> {
            if header.len() < n {
                return Err(BrokerError::frame("truncated binary header"));
            }
            Ok(())
        };

        need(&header, 2 + 1 + 2 + 4 + 4 + 4)?;
        let code = i32::from(header.get_i16());
        let language = Language::from_binary(header.get_u8());
        let version = i32::from(header.get_i16());
        let opaque = header.get_i32();
        let flag = header.get_i32();
        let remark_len = header.get_i32();
        let remark_len = usize::try_from(remark_len)
            .map_err(|_| BrokerError::frame("negative remark length"))?;
        need(&header, remark_len)?;
        let remark = if remark_len == 0 {
            None
        } else {
            Some(
                String::from_utf8(header.split_to(remark_len).to_vec())
                    .map_err(|_| BrokerError::frame("remark is not utf-8"))?,
            )
        };

        need(&header, 4)?;
        let ext_len = usize::try_from(header.get_i32())
            .map_err(|_| BrokerError::frame("negative ext length"))?;
        need(&header, ext_len)?;
        let mut ext_bytes = header.split_to(ext_len);
        let mut ext_fields = HashMap::new();
        while ext_bytes.has_remaining() {
            if ext_bytes.remaining() < 2 {
                return Err(BrokerError::frame("truncated ext key length"));
            }
            let key_len = usize::try_from(ext_bytes.get_i16())
                .map_err(|_| BrokerError::frame("negative ext key length"))?;
            if ext_bytes.remaining() < key_len + 4 {
                return Err(BrokerError::frame("truncated ext key"));
            }
            let key = String::from_utf8(ext_bytes.split_to(key_len).to_vec())
                .map_err(|_| BrokerError::frame("ext key is not utf-8"))?;
            let value_len = usize::try_from(ext_bytes.get_i32())
                .map_err(|_| BrokerError::frame("negative ext value length"))?;
            if ext_bytes.remaining() < value_len {
                return Err(BrokerError::frame("truncated ext value"));
            }
            let value = String::from_utf8(ext_bytes.split_to(value_len).to_vec())
                .map_err(|_| BrokerError::frame("ext value is not utf-8"))?;
            ext_fields.insert(key, value);
        }

        Ok(Self {
            code,
            language,
            version,
            opaque,
            flag,
            remark,
            ext_fields: if ext_fields.is_empty() {
                None
            } else {
                Some(ext_fields)
            },
            body: Bytes::new(),
            serialize_type: SerializeType::Binary,
        })
    }
}
