//! Frame splitting for the legacy protocol.
//!
//! Every frame starts with a 4-byte big-endian total length covering the
//! rest of the frame (header word, header, body).

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{BrokerError, BrokerResult};

/// Largest accepted frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the total-length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Splits one complete frame payload off the buffer.
///
/// Returns `None` while the buffer holds less than a full frame; the caller
/// keeps reading. The returned payload excludes the length prefix.
///
/// # Errors
///
/// Returns a frame error when the announced length exceeds
/// [`MAX_FRAME_SIZE`].
pub fn read_frame(buf: &mut BytesMut) -> BrokerResult<Option<Bytes>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(BrokerError::frame(format!(
            "frame too large: {length} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    if buf.len() < FRAME_HEADER_SIZE + length {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_SIZE);
    Ok(Some(buf.split_to(length).freeze()))
}
