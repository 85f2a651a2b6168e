//! Output pump: drains rendered audio to the producer as frames.
//!
//! Used for file mode and for the tail of a streaming session once the
//! producer has signalled end of stream. The pump never lets the socket
//! outrun what the renderer has produced: it suspends on the session's
//! progress signal while the output boundary is empty, and pauses between
//! slices so the renderer thread gets CPU time.
//!
//! # Termination
//!
//! - Output empty and renderer finished: exactly one sentinel, then `Ok`.
//! - Write failure: returned as is, no sentinel.
//! - Render fault: `RenderFault`, no sentinel.

use std::time::Duration;

use tokio::io::AsyncWrite;

use crate::error::Result;
use crate::protocol::{write_end_of_stream, write_frame, MAX_CHUNK_BYTES};
use crate::render::{Readiness, RenderSession};

/// Default upper bound on one output frame.
pub const DEFAULT_MAX_SLICE: usize = 64 * 1024;

/// Default pause between slices.
pub const DEFAULT_YIELD_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for the output pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    /// Largest payload written per frame. Clamped to `1..=MAX_CHUNK_BYTES`.
    pub max_slice: usize,
    /// Pause after each frame. Zero means a cooperative yield only.
    pub yield_interval: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            max_slice: DEFAULT_MAX_SLICE,
            yield_interval: DEFAULT_YIELD_INTERVAL,
        }
    }
}

/// What a completed pump run wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Data frames, not counting the sentinel.
    pub frames: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct OutputPump {
    config: PumpConfig,
}

impl OutputPump {
    pub fn new(config: PumpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    /// Drain `session` into `writer` until the renderer finishes.
    pub async fn run<W>(&self, writer: &mut W, session: &RenderSession) -> Result<PumpReport>
    where
        W: AsyncWrite + Unpin,
    {
        let max_slice = self.config.max_slice.clamp(1, MAX_CHUNK_BYTES);
        let mut report = PumpReport::default();

        loop {
            match session.wait_for_output(1).await? {
                Readiness::Ready => {
                    let slice = session.take_output(max_slice);
                    write_frame(writer, &slice).await?;
                    report.frames += 1;
                    report.bytes += slice.len() as u64;
                    self.pause().await;
                }
                Readiness::Finished => {
                    write_end_of_stream(writer).await?;
                    tracing::debug!(
                        frames = report.frames,
                        bytes = report.bytes,
                        "Output drained, sentinel sent"
                    );
                    return Ok(report);
                }
            }
        }
    }

    async fn pause(&self) {
        if self.config.yield_interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.config.yield_interval).await;
        }
    }
}
