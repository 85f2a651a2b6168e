//! Per-connection render session.
//!
//! Owns the input and output boundaries, runs the renderer on a blocking
//! worker, and lets the connection task wait for output without polling.
//! Dropping the session closes both boundaries, which ends the worker.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::Notify;

use super::queue::{ByteQueue, InputReader, OutputWriter};
use super::{RenderFormat, RenderJob, RenderReport, RenderSource, Renderer};
use crate::error::{BridgeError, Result};

/// Lifecycle of the render worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderStatus {
    /// Not started yet.
    Idle,
    Running,
    /// Renderer returned normally; output may still be buffered.
    Finished(RenderReport),
    /// Renderer failed; the message is surfaced as `RenderFault`.
    Faulted(String),
}

/// Outcome of waiting for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least the requested number of bytes are pending.
    Ready,
    /// The renderer finished; whatever is pending is all there will be.
    Finished,
}

struct Shared {
    input: Arc<ByteQueue>,
    output: Arc<ByteQueue>,
    progress: Arc<Notify>,
    status: Mutex<RenderStatus>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, RenderStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: RenderStatus) {
        *self.status() = status;
        self.progress.notify_waiters();
    }
}

/// One connection's view of the external renderer.
pub struct RenderSession {
    format: RenderFormat,
    shared: Arc<Shared>,
}

impl RenderSession {
    pub fn new(format: RenderFormat) -> Self {
        let progress = Arc::new(Notify::new());
        Self {
            format,
            shared: Arc::new(Shared {
                input: Arc::new(ByteQueue::new(progress.clone())),
                output: Arc::new(ByteQueue::new(progress.clone())),
                progress,
                status: Mutex::new(RenderStatus::Idle),
            }),
        }
    }

    /// Start rendering from the input boundary.
    pub fn start_stream(&mut self, renderer: Arc<dyn Renderer>) {
        let reader = InputReader::new(self.shared.input.clone());
        self.spawn(renderer, RenderSource::Stream(reader));
    }

    /// Open `path` and start rendering from it.
    ///
    /// A file that cannot be opened faults the session.
    pub fn start_file(&mut self, renderer: Arc<dyn Renderer>, path: &Path) -> Result<()> {
        match std::fs::File::open(path) {
            Ok(file) => {
                self.spawn(renderer, RenderSource::File(file));
                Ok(())
            }
            Err(e) => {
                let msg = format!("cannot open {}: {}", path.display(), e);
                self.shared.set_status(RenderStatus::Faulted(msg.clone()));
                self.shared.output.close();
                Err(BridgeError::RenderFault(msg))
            }
        }
    }

    fn spawn(&mut self, renderer: Arc<dyn Renderer>, source: RenderSource) {
        let job = RenderJob {
            format: self.format,
            source,
            output: OutputWriter::new(self.shared.output.clone()),
        };
        let shared = self.shared.clone();
        shared.set_status(RenderStatus::Running);

        // Detached: the worker returns once both boundaries are closed.
        drop(tokio::task::spawn_blocking(move || {
            let status = match std::panic::catch_unwind(AssertUnwindSafe(|| renderer.render(job)))
            {
                Ok(Ok(report)) => {
                    tracing::debug!(samples = report.samples_rendered, "Renderer finished");
                    RenderStatus::Finished(report)
                }
                Ok(Err(e)) => RenderStatus::Faulted(e.to_string()),
                Err(_) => RenderStatus::Faulted("renderer panicked".to_string()),
            };
            shared.set_status(status);
            shared.output.close();
        }));
    }

    /// Append streamed input for the renderer.
    ///
    /// Input arriving after the renderer returned is discarded.
    pub fn push_input(&self, data: &[u8]) -> Result<()> {
        match &*self.shared.status() {
            RenderStatus::Faulted(msg) => return Err(BridgeError::RenderFault(msg.clone())),
            RenderStatus::Finished(_) => {
                tracing::trace!(bytes = data.len(), "Renderer finished, input discarded");
                return Ok(());
            }
            RenderStatus::Idle | RenderStatus::Running => {}
        }
        self.shared.input.push(data)?;
        Ok(())
    }

    /// Signal that no more streamed input will arrive.
    pub fn finish_input(&self) {
        self.shared.input.close();
    }

    /// Rendered bytes waiting to be sent.
    pub fn pending_output(&self) -> usize {
        self.shared.output.len()
    }

    /// Remove up to `max` rendered bytes.
    pub fn take_output(&self, max: usize) -> Bytes {
        self.shared.output.take(max)
    }

    pub fn status(&self) -> RenderStatus {
        self.shared.status().clone()
    }

    /// Wait until `want` bytes are pending or the renderer finishes.
    ///
    /// `want == 0` is immediately ready. A faulted renderer yields
    /// `RenderFault`.
    pub async fn wait_for_output(&self, want: usize) -> Result<Readiness> {
        loop {
            let notified = self.shared.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(readiness) = self.readiness(want)? {
                return Ok(readiness);
            }

            notified.await;
        }
    }

    /// Wait until the renderer is blocked on an empty input boundary.
    ///
    /// Never returns once input is finished, since a closed boundary cannot
    /// starve the reader.
    pub async fn wait_for_starvation(&self) {
        loop {
            let notified = self.shared.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.input.is_starved() {
                return;
            }

            notified.await;
        }
    }

    pub fn is_starved(&self) -> bool {
        self.shared.input.is_starved()
    }

    fn readiness(&self, want: usize) -> Result<Option<Readiness>> {
        let finished = match &*self.shared.status() {
            RenderStatus::Faulted(msg) => return Err(BridgeError::RenderFault(msg.clone())),
            RenderStatus::Finished(_) => true,
            RenderStatus::Idle | RenderStatus::Running => false,
        };

        if self.shared.output.len() >= want {
            return Ok(Some(Readiness::Ready));
        }
        if finished {
            return Ok(Some(Readiness::Finished));
        }
        Ok(None)
    }

    /// Tear down both boundaries. The worker sees EOF on input and
    /// `BrokenPipe` on output.
    pub fn close(&self) {
        self.shared.input.close();
        self.shared.output.close();
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BitDepth;
    use std::io::{Read, Write};
    use std::time::Duration;

    fn format() -> RenderFormat {
        RenderFormat {
            bit_depth: BitDepth::Sixteen,
            output_channels: 2,
            block_size: 4,
            sample_rate: 48_000,
        }
    }

    /// Doubles every input byte.
    fn doubler(job: RenderJob) -> std::io::Result<RenderReport> {
        let RenderJob {
            source, mut output, ..
        } = job;
        let mut reader: Box<dyn Read> = match source {
            RenderSource::Stream(r) => Box::new(r),
            RenderSource::File(f) => Box::new(f),
        };
        let mut buf = [0u8; 64];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            for &b in &buf[..n] {
                output.write_all(&[b, b])?;
            }
            total += n as u64;
        }
        Ok(RenderReport {
            samples_rendered: total,
            total_samples: None,
        })
    }

    #[tokio::test]
    async fn test_stream_render_ready_then_finished() {
        let mut session = RenderSession::new(format());
        session.start_stream(Arc::new(doubler));

        session.push_input(b"abcd").unwrap();
        let readiness = session.wait_for_output(8).await.unwrap();
        assert_eq!(readiness, Readiness::Ready);
        assert_eq!(&session.take_output(8)[..], b"aabbccdd");

        session.finish_input();
        let readiness = session.wait_for_output(1).await.unwrap();
        assert_eq!(readiness, Readiness::Finished);
        assert_eq!(session.pending_output(), 0);
        assert!(matches!(session.status(), RenderStatus::Finished(r) if r.samples_rendered == 4));
    }

    #[tokio::test]
    async fn test_starved_renderer_reported() {
        let mut session = RenderSession::new(format());
        session.start_stream(Arc::new(doubler));

        session.push_input(b"ab").unwrap();
        // Four bytes are produced, then the renderer blocks for more input.
        tokio::time::timeout(Duration::from_secs(2), session.wait_for_starvation())
            .await
            .expect("renderer should starve");
        assert!(session.is_starved());
        assert_eq!(session.pending_output(), 4);

        session.finish_input();
        assert!(!session.is_starved());
    }

    #[tokio::test]
    async fn test_zero_want_is_immediately_ready() {
        let mut session = RenderSession::new(format());
        session.start_stream(Arc::new(doubler));
        assert_eq!(
            session.wait_for_output(0).await.unwrap(),
            Readiness::Ready
        );
    }

    #[tokio::test]
    async fn test_renderer_error_is_render_fault() {
        let mut session = RenderSession::new(format());
        session.start_stream(Arc::new(|_job: RenderJob| -> std::io::Result<RenderReport> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "decoder exploded"))
        }));

        let err = session.wait_for_output(1).await.unwrap_err();
        assert!(matches!(err, BridgeError::RenderFault(msg) if msg.contains("decoder exploded")));
        assert!(matches!(
            session.push_input(b"x"),
            Err(BridgeError::RenderFault(_))
        ));
    }

    #[tokio::test]
    async fn test_renderer_panic_is_render_fault() {
        let mut session = RenderSession::new(format());
        session.start_stream(Arc::new(|_job: RenderJob| -> std::io::Result<RenderReport> {
            panic!("renderer bug")
        }));

        let err = session.wait_for_output(1).await.unwrap_err();
        assert!(matches!(err, BridgeError::RenderFault(_)));
    }

    #[tokio::test]
    async fn test_missing_file_faults_session() {
        let mut session = RenderSession::new(format());
        let missing = std::env::temp_dir().join("renderwire-missing-input.raw");
        let err = session
            .start_file(Arc::new(doubler), &missing)
            .unwrap_err();
        assert!(matches!(err, BridgeError::RenderFault(_)));
        assert!(matches!(session.status(), RenderStatus::Faulted(_)));
    }

    #[tokio::test]
    async fn test_close_unblocks_worker() {
        let mut session = RenderSession::new(format());
        session.start_stream(Arc::new(doubler));
        session.push_input(b"a").unwrap();
        session.close();

        // Finished on EOF, or faulted writing to the closed output.
        let _ = tokio::time::timeout(Duration::from_secs(2), session.wait_for_output(usize::MAX))
            .await
            .expect("worker should exit once the boundaries close");
        assert_ne!(session.status(), RenderStatus::Running);
    }

    #[tokio::test]
    async fn test_input_after_finish_is_discarded() {
        let mut session = RenderSession::new(format());
        session.start_stream(Arc::new(|_job: RenderJob| -> std::io::Result<RenderReport> {
            Ok(RenderReport::default())
        }));
        assert_eq!(
            session.wait_for_output(1).await.unwrap(),
            Readiness::Finished
        );

        session.push_input(&[0u8; 4096]).unwrap();
        session.push_input(&[0u8; 4096]).unwrap();
        assert!(session.shared.input.is_empty());
    }
}
