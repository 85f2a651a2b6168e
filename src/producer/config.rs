//! Producer configuration.

use std::time::Duration;

use crate::error::Result;
use crate::protocol::{BitDepth, Handshake};

/// Default time allowed to establish the connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of chunks sent before the first reply is awaited.
pub const DEFAULT_INITIAL_BURST: u32 = 10;

/// Default number of consecutive keepalives tolerated before giving up.
pub const DEFAULT_MAX_IDLE_REPLIES: u32 = 200;

/// Default streamed chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default render blocks per reply.
pub const DEFAULT_MANDATORY_FRAMES: u8 = 6;

/// Default output channel count.
pub const DEFAULT_OUTPUT_CHANNELS: u16 = 2;

/// Default samples per render block.
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Settings for one producer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Explicit endpoint. `None` means discovery.
    pub endpoint: Option<String>,
    pub connect_timeout: Duration,
    pub initial_burst: u32,
    pub max_idle_replies: u32,
    pub chunk_size: usize,
    pub bit_depth: BitDepth,
    pub mandatory_frames: u8,
    pub output_channels: u16,
    /// Absolute update rate; the sign is chosen from the input kind.
    pub block_size: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            initial_burst: DEFAULT_INITIAL_BURST,
            max_idle_replies: DEFAULT_MAX_IDLE_REPLIES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            bit_depth: BitDepth::Sixteen,
            mandatory_frames: DEFAULT_MANDATORY_FRAMES,
            output_channels: DEFAULT_OUTPUT_CHANNELS,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl ProducerConfig {
    /// Handshake for a streaming run.
    ///
    /// Fails with `ProtocolSync` when `block_size` or `output_channels`
    /// cannot go on the wire.
    pub fn streaming_handshake(&self) -> Result<Handshake> {
        Handshake::streaming(
            self.bit_depth,
            self.mandatory_frames,
            self.output_channels,
            self.block_size,
        )
    }

    /// Handshake for a file-mode run.
    pub fn file_handshake(&self) -> Result<Handshake> {
        Handshake::file(
            self.bit_depth,
            self.mandatory_frames,
            self.output_channels,
            self.block_size,
        )
    }
}
