//! Render module - the boundary to the external rendering engine.
//!
//! The engine itself is opaque. It is driven through the [`Renderer`] trait
//! on a blocking worker thread, fed from an input boundary (streaming) or an
//! opened file (file mode), and writes PCM into an output boundary that the
//! connection task drains.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use renderwire::render::{PassthroughRenderer, RenderSession};
//!
//! let mut session = RenderSession::new(handshake.render_format(48_000));
//! session.start_stream(Arc::new(PassthroughRenderer::default()));
//! session.push_input(&chunk)?;
//! ```

mod passthrough;
mod queue;
mod session;

use std::fs::File;
use std::io;

pub use passthrough::PassthroughRenderer;
pub use queue::{ByteQueue, InputReader, OutputWriter};
pub use session::{Readiness, RenderSession, RenderStatus};

use crate::protocol::{BitDepth, Handshake};

/// Default sample rate handed to the renderer.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Output format negotiated for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderFormat {
    pub bit_depth: BitDepth,
    pub output_channels: u16,
    /// Samples per render block (absolute update rate).
    pub block_size: u32,
    pub sample_rate: u32,
}

impl RenderFormat {
    /// Bytes in one interleaved output sample frame.
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.output_channels as usize * self.bit_depth.bytes_per_sample()
    }

    /// Bytes in one output render block.
    #[inline]
    pub fn block_bytes(&self) -> usize {
        self.frame_bytes() * self.block_size as usize
    }
}

impl Handshake {
    /// The renderer-facing format for this handshake.
    pub fn render_format(&self, sample_rate: u32) -> RenderFormat {
        RenderFormat {
            bit_depth: self.bit_depth,
            output_channels: self.output_channels,
            block_size: self.block_size(),
            sample_rate,
        }
    }
}

/// Where the renderer pulls its input from.
#[derive(Debug)]
pub enum RenderSource {
    /// Streamed bytes; EOF once the producer signals end of stream.
    Stream(InputReader),
    /// A file the server opened from the path directive.
    File(File),
}

/// One rendering run.
#[derive(Debug)]
pub struct RenderJob {
    pub format: RenderFormat,
    pub source: RenderSource,
    pub output: OutputWriter,
}

/// What a finished run reports back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderReport {
    /// Sample frames written to the output boundary.
    pub samples_rendered: u64,
    /// Total sample frames in the source, when the renderer knows it.
    pub total_samples: Option<u64>,
}

/// An external rendering engine.
///
/// `render` runs on a blocking thread and should return once its source is
/// exhausted. A write to the output failing with `BrokenPipe` means the
/// connection was torn down and the renderer should stop.
pub trait Renderer: Send + Sync + 'static {
    fn render(&self, job: RenderJob) -> io::Result<RenderReport>;
}

impl<F> Renderer for F
where
    F: Fn(RenderJob) -> io::Result<RenderReport> + Send + Sync + 'static,
{
    fn render(&self, job: RenderJob) -> io::Result<RenderReport> {
        self(job)
    }
}
