//! Wire format constants and length-prefix helpers.
//!
//! Every message after the handshake is a frame:
//! ```text
//! ┌──────────────┬─────────────────────┐
//! │ Length       │ Payload             │
//! │ 4 bytes      │ Length bytes        │
//! │ uint32 LE    │                     │
//! └──────────────┴─────────────────────┘
//! ```
//!
//! A zero length is reserved as the end-of-stream sentinel. On read the
//! prefix is interpreted as a signed 32-bit integer so that a corrupt prefix
//! with the high bit set is reported as a negative length.

use crate::error::{BridgeError, Result};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Handshake size in bytes (fixed, exactly 8).
pub const HANDSHAKE_SIZE: usize = 8;

/// Maximum payload of a single frame.
pub const MAX_CHUNK_BYTES: usize = 10_000_000;

/// Maximum byte length of a file path directive.
pub const MAX_PATH_BYTES: usize = 65_535;

/// Encode a payload length as a little-endian prefix.
#[inline]
pub fn encode_length(len: usize) -> [u8; LENGTH_PREFIX_SIZE] {
    (len as u32).to_le_bytes()
}

/// Decode a length prefix as the signed value the peer sent.
#[inline]
pub fn decode_length(buf: [u8; LENGTH_PREFIX_SIZE]) -> i32 {
    i32::from_le_bytes(buf)
}

/// Validate a decoded frame length against `max`.
///
/// Returns the usable length; zero means end of stream.
pub fn validate_frame_length(length: i32, max: usize) -> Result<usize> {
    if length < 0 || length as usize > max {
        return Err(BridgeError::InvalidFrameLength(length as i64));
    }
    Ok(length as usize)
}

/// Validate a decoded path directive length.
pub fn validate_path_length(length: i32) -> Result<usize> {
    if length <= 0 || length as usize > MAX_PATH_BYTES {
        return Err(BridgeError::InvalidPathLength(length as i64));
    }
    Ok(length as usize)
}
