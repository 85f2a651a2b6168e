//! Handshake codec.
//!
//! The handshake is the first and only control message on a connection:
//! ```text
//! ┌──────────┬───────────┬──────────┬─────────────┐
//! │ BitDepth │ Mandatory │ Channels │ Update rate │
//! │ 1 byte   │ 1 byte    │ uint16 LE│ int32 LE    │
//! └──────────┴───────────┴──────────┴─────────────┘
//! ```
//!
//! The sign of the update rate selects the mode: positive is streaming,
//! negative is file mode, zero is rejected.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::frame::read_full;
use super::wire_format::{HANDSHAKE_SIZE, MAX_CHUNK_BYTES};
use crate::error::{BridgeError, Result};

/// PCM sample width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitDepth {
    Eight,
    Sixteen,
    TwentyFour,
    ThirtyTwo,
}

impl BitDepth {
    /// Parse a bit count (8, 16, 24 or 32).
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(BitDepth::Eight),
            16 => Some(BitDepth::Sixteen),
            24 => Some(BitDepth::TwentyFour),
            32 => Some(BitDepth::ThirtyTwo),
            _ => None,
        }
    }

    /// Bits per sample.
    #[inline]
    pub fn bits(self) -> u8 {
        match self {
            BitDepth::Eight => 8,
            BitDepth::Sixteen => 16,
            BitDepth::TwentyFour => 24,
            BitDepth::ThirtyTwo => 32,
        }
    }

    /// Bytes per sample.
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        self.bits() as usize / 8
    }

    /// Byte value of digital silence. 8-bit PCM is unsigned.
    #[inline]
    pub fn silence_byte(self) -> u8 {
        match self {
            BitDepth::Eight => 0x80,
            _ => 0x00,
        }
    }
}

/// Operating mode, decided once when the handshake is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Input arrives as framed chunks, replies are lockstep.
    Streaming { update_rate: u32 },
    /// Input is a file path, output is pumped until a sentinel.
    File { block_size: u32 },
}

impl Mode {
    /// Samples per render block, regardless of mode.
    #[inline]
    pub fn block_size(self) -> u32 {
        match self {
            Mode::Streaming { update_rate } => update_rate,
            Mode::File { block_size } => block_size,
        }
    }

    /// Signed wire representation.
    ///
    /// The magnitude must fit `1..=i32::MAX`, otherwise the sign would no
    /// longer carry the mode.
    fn wire_rate(self) -> Result<i32> {
        let rate = i32::try_from(self.block_size())
            .ok()
            .filter(|rate| *rate > 0)
            .ok_or_else(|| {
                BridgeError::ProtocolSync(format!(
                    "update rate {} outside 1..={}",
                    self.block_size(),
                    i32::MAX
                ))
            })?;
        Ok(match self {
            Mode::Streaming { .. } => rate,
            Mode::File { .. } => -rate,
        })
    }
}

/// Decoded handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub bit_depth: BitDepth,
    /// Render blocks that must accumulate before a streaming reply.
    pub mandatory_frames: u8,
    pub output_channels: u16,
    pub mode: Mode,
}

impl Handshake {
    /// Create a streaming-mode handshake.
    ///
    /// Fails with `ProtocolSync` for a rate of 0 or above `i32::MAX`, or
    /// for zero channels.
    pub fn streaming(
        bit_depth: BitDepth,
        mandatory_frames: u8,
        output_channels: u16,
        update_rate: u32,
    ) -> Result<Self> {
        Self::checked(
            bit_depth,
            mandatory_frames,
            output_channels,
            Mode::Streaming { update_rate },
        )
    }

    /// Create a file-mode handshake. Same limits as [`streaming`](Self::streaming).
    pub fn file(
        bit_depth: BitDepth,
        mandatory_frames: u8,
        output_channels: u16,
        block_size: u32,
    ) -> Result<Self> {
        Self::checked(
            bit_depth,
            mandatory_frames,
            output_channels,
            Mode::File { block_size },
        )
    }

    fn checked(
        bit_depth: BitDepth,
        mandatory_frames: u8,
        output_channels: u16,
        mode: Mode,
    ) -> Result<Self> {
        let handshake = Self {
            bit_depth,
            mandatory_frames,
            output_channels,
            mode,
        };
        handshake.validate()?;
        Ok(handshake)
    }

    /// Check that the handshake survives an encode/decode round trip.
    pub fn validate(&self) -> Result<()> {
        if self.output_channels == 0 {
            return Err(BridgeError::ProtocolSync(
                "output channel count is zero".to_string(),
            ));
        }
        self.mode.wire_rate()?;
        Ok(())
    }

    /// Encode to the 8-byte wire form.
    ///
    /// # Example
    ///
    /// ```
    /// use renderwire::protocol::{BitDepth, Handshake};
    ///
    /// let hs = Handshake::file(BitDepth::Sixteen, 6, 2, 1024).unwrap();
    /// let bytes = hs.encode().unwrap();
    /// assert_eq!(&bytes[4..], &(-1024i32).to_le_bytes());
    /// ```
    pub fn encode(&self) -> Result<[u8; HANDSHAKE_SIZE]> {
        self.validate()?;
        let mut buf = [0u8; HANDSHAKE_SIZE];
        buf[0] = self.bit_depth.bits();
        buf[1] = self.mandatory_frames;
        buf[2..4].copy_from_slice(&self.output_channels.to_le_bytes());
        buf[4..8].copy_from_slice(&self.mode.wire_rate()?.to_le_bytes());
        Ok(buf)
    }

    /// Decode from the 8-byte wire form.
    pub fn decode(buf: &[u8; HANDSHAKE_SIZE]) -> Result<Self> {
        let bit_depth = BitDepth::from_bits(buf[0])
            .ok_or_else(|| BridgeError::ProtocolSync(format!("unsupported bit depth {}", buf[0])))?;
        let mandatory_frames = buf[1];
        let output_channels = u16::from_le_bytes([buf[2], buf[3]]);
        let update_rate = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if update_rate == 0 {
            return Err(BridgeError::ProtocolSync("update rate is zero".to_string()));
        }
        if output_channels == 0 {
            return Err(BridgeError::ProtocolSync(
                "output channel count is zero".to_string(),
            ));
        }

        let mode = if update_rate < 0 {
            Mode::File {
                block_size: update_rate.unsigned_abs(),
            }
        } else {
            Mode::Streaming {
                update_rate: update_rate as u32,
            }
        };

        Ok(Self {
            bit_depth,
            mandatory_frames,
            output_channels,
            mode,
        })
    }

    #[inline]
    pub fn is_file_mode(&self) -> bool {
        matches!(self.mode, Mode::File { .. })
    }

    /// Absolute update rate (samples per block).
    #[inline]
    pub fn block_size(&self) -> u32 {
        self.mode.block_size()
    }

    /// Size of one interleaved sample frame across all output channels.
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.output_channels as usize * self.bit_depth.bytes_per_sample()
    }

    /// Rendered bytes that must be pending before a streaming reply.
    pub fn mandatory_bytes(&self) -> usize {
        (self.mandatory_frames as usize)
            .saturating_mul(self.block_size() as usize)
            .saturating_mul(self.frame_bytes())
    }

    /// Largest whole number of sample frames that fits in one frame payload.
    pub fn max_reply_bytes(&self) -> usize {
        let frame = self.frame_bytes().max(1);
        MAX_CHUNK_BYTES - MAX_CHUNK_BYTES % frame
    }

    /// Size of one lockstep reply: `mandatory_bytes`, capped to
    /// [`max_reply_bytes`](Self::max_reply_bytes).
    pub fn reply_bytes(&self) -> usize {
        self.mandatory_bytes().min(self.max_reply_bytes())
    }
}

/// Read exactly one handshake from the transport.
pub async fn read_handshake<R>(reader: &mut R) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_SIZE];
    let n = read_full(reader, &mut buf).await?;
    if n < HANDSHAKE_SIZE {
        return Err(BridgeError::ConnectionClosed);
    }
    Handshake::decode(&buf)
}

/// Write a handshake and flush it.
pub async fn write_handshake<W>(writer: &mut W, handshake: &Handshake) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&handshake.encode()?).await?;
    writer.flush().await?;
    Ok(())
}
