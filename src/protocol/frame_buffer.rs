//! Incremental frame decoder for the file-mode drain.
//!
//! Socket reads hand over arbitrary slices; a frame may span several reads
//! and one read may hold several frames plus the sentinel. The decoder keeps
//! a `BytesMut` and alternates between two phases: expecting a 4-byte length
//! and expecting the rest of a payload.
//!
//! # Example
//!
//! ```
//! use renderwire::protocol::{build_frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = build_frame(b"rendered");
//!
//! assert!(buffer.push(&bytes[..3]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[3..]).unwrap();
//! assert_eq!(frames[0].payload(), b"rendered");
//! ```

use bytes::BytesMut;

use super::wire_format::{decode_length, validate_frame_length, LENGTH_PREFIX_SIZE, MAX_CHUNK_BYTES};
use super::Frame;
use crate::error::Result;

/// Initial buffer capacity, one drain read.
const INITIAL_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prefix,
    Payload { remaining: usize },
}

/// Accumulates reads and yields complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    phase: Phase,
    max_len: usize,
}

impl FrameBuffer {
    /// Decoder accepting payloads up to `MAX_CHUNK_BYTES`.
    pub fn new() -> Self {
        Self::with_max_payload(MAX_CHUNK_BYTES)
    }

    /// Decoder with a lower payload ceiling.
    pub fn with_max_payload(max_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            phase: Phase::Prefix,
            max_len,
        }
    }

    /// Append one read and return every frame it completed, in order.
    ///
    /// A trailing partial frame stays buffered for the next call. A negative
    /// or oversized length prefix fails with `InvalidFrameLength`.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.phase {
                Phase::Prefix if self.buffer.len() >= LENGTH_PREFIX_SIZE => {
                    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
                    prefix.copy_from_slice(&self.buffer.split_to(LENGTH_PREFIX_SIZE));
                    match validate_frame_length(decode_length(prefix), self.max_len)? {
                        0 => return Ok(Some(Frame::EndOfStream)),
                        remaining => self.phase = Phase::Payload { remaining },
                    }
                }
                Phase::Payload { remaining } if self.buffer.len() >= remaining => {
                    self.phase = Phase::Prefix;
                    let payload = self.buffer.split_to(remaining).freeze();
                    return Ok(Some(Frame::Data(payload)));
                }
                _ => return Ok(None),
            }
        }
    }

    /// Bytes still needed to complete the frame in progress (0 when idle).
    pub fn pending_payload(&self) -> usize {
        match self.phase {
            Phase::Prefix => 0,
            Phase::Payload { remaining } => remaining,
        }
    }

    /// Buffered bytes not yet returned as frames.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
