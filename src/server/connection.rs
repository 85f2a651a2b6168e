//! Per-connection handler.
//!
//! Decodes the handshake, then runs the mode-specific loop against one
//! [`RenderSession`].
//!
//! # Streaming
//!
//! Input frames are read continuously and pushed to the renderer; every data
//! frame puts the server in debt by one reply. A debt is paid with exactly
//! `mandatory_bytes` of rendered audio, or with a zero-length keepalive when
//! the renderer is starved and no new input has arrived for
//! `keepalive_grace`, or when nothing could be paid for `stall_timeout`.
//! The end-of-stream frame closes the render input; outstanding debts are
//! paid from the tail of the render, the rest goes out through the
//! [`OutputPump`] and the sentinel follows.
//!
//! # File
//!
//! The path directive is read, the renderer opens the file, and the pump
//! drains its output.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::pump::{OutputPump, PumpConfig};
use crate::error::Result;
use crate::protocol::{
    read_frame_or_eof, read_handshake, read_path_directive, write_frame, Frame, Handshake, Mode,
    MAX_CHUNK_BYTES,
};
use crate::render::{Readiness, RenderSession, Renderer, DEFAULT_SAMPLE_RATE};

/// Default time without any payable reply before a keepalive is forced.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default quiet period on a starved renderer before a keepalive is sent.
pub const DEFAULT_KEEPALIVE_GRACE: Duration = Duration::from_millis(50);

/// Settings shared by every connection a watchdog serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub stall_timeout: Duration,
    pub keepalive_grace: Duration,
    pub sample_rate: u32,
    pub pump: PumpConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            keepalive_grace: DEFAULT_KEEPALIVE_GRACE,
            sample_rate: DEFAULT_SAMPLE_RATE,
            pump: PumpConfig::default(),
        }
    }
}

/// Traffic counters for one finished connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionReport {
    pub mode: Mode,
    pub frames_in: u64,
    pub bytes_in: u64,
    /// Data frames written, sentinel and keepalives excluded.
    pub frames_out: u64,
    pub bytes_out: u64,
    pub keepalives: u64,
}

impl ConnectionReport {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            frames_in: 0,
            bytes_in: 0,
            frames_out: 0,
            bytes_out: 0,
            keepalives: 0,
        }
    }
}

/// Serves connections with one renderer.
#[derive(Clone)]
pub struct ConnectionHandler {
    renderer: Arc<dyn Renderer>,
    config: ConnectionConfig,
}

impl ConnectionHandler {
    pub fn new(renderer: Arc<dyn Renderer>, config: ConnectionConfig) -> Self {
        Self { renderer, config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Read and validate the handshake.
    pub async fn handshake<S>(&self, stream: &mut S) -> Result<Handshake>
    where
        S: AsyncRead + Unpin,
    {
        let handshake = read_handshake(stream).await?;
        tracing::info!(
            bit_depth = handshake.bit_depth.bits(),
            channels = handshake.output_channels,
            mandatory_frames = handshake.mandatory_frames,
            mode = ?handshake.mode,
            "Handshake accepted"
        );
        Ok(handshake)
    }

    /// Run the session for an accepted handshake to completion.
    pub async fn serve<S>(&self, stream: S, handshake: Handshake) -> Result<ConnectionReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = RenderSession::new(handshake.render_format(self.config.sample_rate));
        match handshake.mode {
            Mode::Streaming { .. } => {
                session.start_stream(self.renderer.clone());
                self.serve_stream(stream, &handshake, &session).await
            }
            Mode::File { .. } => self.serve_file(stream, &handshake, &mut session).await,
        }
    }

    /// Handshake plus [`serve`](Self::serve).
    pub async fn run<S>(&self, mut stream: S) -> Result<ConnectionReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = self.handshake(&mut stream).await?;
        self.serve(stream, handshake).await
    }

    async fn serve_file<S>(
        &self,
        mut stream: S,
        handshake: &Handshake,
        session: &mut RenderSession,
    ) -> Result<ConnectionReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let path = read_path_directive(&mut stream).await?;
        tracing::info!(path = %path, "File render requested");

        session.start_file(self.renderer.clone(), Path::new(&path))?;
        let pump = OutputPump::new(self.config.pump);
        let pumped = pump.run(&mut stream, session).await?;

        let mut report = ConnectionReport::new(handshake.mode);
        report.frames_out = pumped.frames;
        report.bytes_out = pumped.bytes;
        Ok(report)
    }

    async fn serve_stream<S>(
        &self,
        stream: S,
        handshake: &Handshake,
        session: &RenderSession,
    ) -> Result<ConnectionReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let inbound = read_inbound(&mut reader, session, tx);
        let outbound = ReplyLoop {
            session,
            config: &self.config,
            pump: OutputPump::new(self.config.pump),
            mandatory: handshake.reply_bytes(),
            max_reply: handshake.max_reply_bytes(),
            report: ConnectionReport::new(handshake.mode),
        }
        .run(&mut writer, rx);

        let ((frames_in, bytes_in), mut report) = tokio::try_join!(inbound, outbound)?;
        report.frames_in = frames_in;
        report.bytes_in = bytes_in;
        Ok(report)
    }
}

/// What the inbound half saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    Data,
    EndOfStream,
    /// Peer closed on a frame boundary.
    Closed,
}

/// Push every input frame into the renderer and report it to the reply loop.
async fn read_inbound<R>(
    reader: &mut R,
    session: &RenderSession,
    tx: mpsc::UnboundedSender<Inbound>,
) -> Result<(u64, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut frames = 0u64;
    let mut bytes = 0u64;

    loop {
        match read_frame_or_eof(reader, MAX_CHUNK_BYTES).await? {
            Some(Frame::Data(payload)) => {
                session.push_input(&payload)?;
                frames += 1;
                bytes += payload.len() as u64;
                let _ = tx.send(Inbound::Data);
            }
            Some(Frame::EndOfStream) => {
                tracing::debug!(frames, bytes, "Input end of stream");
                session.finish_input();
                let _ = tx.send(Inbound::EndOfStream);
                return Ok((frames, bytes));
            }
            None => {
                tracing::debug!(frames, bytes, "Producer closed input");
                let _ = tx.send(Inbound::Closed);
                return Ok((frames, bytes));
            }
        }
    }
}

struct ReplyLoop<'a> {
    session: &'a RenderSession,
    config: &'a ConnectionConfig,
    pump: OutputPump,
    mandatory: usize,
    /// Whole sample frames only, even when `mandatory` is zero.
    max_reply: usize,
    report: ConnectionReport,
}

impl ReplyLoop<'_> {
    async fn run<W>(
        mut self,
        writer: &mut W,
        mut rx: mpsc::UnboundedReceiver<Inbound>,
    ) -> Result<ConnectionReport>
    where
        W: AsyncWrite + Unpin,
    {
        let mut owed = 0u64;
        let mut input: Option<Inbound> = None;
        let mut last_input = Instant::now();
        let mut stall_deadline = Instant::now() + self.config.stall_timeout;
        let mut finished_early = false;

        loop {
            if owed > 0 && self.payable() {
                self.reply(writer, self.mandatory).await?;
                owed -= 1;
                stall_deadline = Instant::now() + self.config.stall_timeout;
                continue;
            }

            match input {
                Some(Inbound::Closed) => return Ok(self.report),
                Some(Inbound::EndOfStream) if owed == 0 => {
                    let tail = self.pump.run(writer, self.session).await?;
                    self.report.frames_out += tail.frames;
                    self.report.bytes_out += tail.bytes;
                    return Ok(self.report);
                }
                _ => {}
            }

            tokio::select! {
                event = rx.recv(), if input.is_none() => {
                    match event.unwrap_or(Inbound::Closed) {
                        Inbound::Data => {
                            if owed == 0 {
                                stall_deadline = Instant::now() + self.config.stall_timeout;
                            }
                            owed += 1;
                            last_input = Instant::now();
                        }
                        other => input = Some(other),
                    }
                }
                readiness = self.session.wait_for_output(self.mandatory), if owed > 0 => {
                    if readiness? == Readiness::Finished {
                        // Nothing more will be rendered: settle with what is left.
                        if !finished_early && input.is_none() {
                            tracing::warn!("Renderer finished before end of input");
                            finished_early = true;
                        }
                        self.reply(writer, self.mandatory).await?;
                        owed -= 1;
                    }
                }
                _ = starved_for(self.session, last_input, self.config.keepalive_grace),
                    if owed > 0 && input.is_none() =>
                {
                    tracing::debug!(owed, "Renderer starved, sending keepalive");
                    self.reply(writer, 0).await?;
                    owed -= 1;
                    last_input = Instant::now();
                }
                _ = tokio::time::sleep_until(stall_deadline), if owed > 0 => {
                    tracing::warn!(
                        owed,
                        timeout = ?self.config.stall_timeout,
                        "No rendered output in time, sending keepalive"
                    );
                    self.reply(writer, 0).await?;
                    owed -= 1;
                    stall_deadline = Instant::now() + self.config.stall_timeout;
                }
            }
        }
    }

    /// With no mandatory size every debt is paid at once with whatever is
    /// pending.
    fn payable(&self) -> bool {
        self.mandatory == 0 || self.session.pending_output() >= self.mandatory
    }

    /// Write one reply of at most `size` bytes (all pending when the
    /// mandatory size is zero). An empty reply counts as a keepalive.
    async fn reply<W>(&mut self, writer: &mut W, size: usize) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let take = if self.mandatory == 0 {
            self.max_reply
        } else {
            size
        };
        let payload = self.session.take_output(take);
        write_frame(writer, &payload).await?;

        if payload.is_empty() {
            self.report.keepalives += 1;
        } else {
            self.report.frames_out += 1;
            self.report.bytes_out += payload.len() as u64;
        }
        Ok(())
    }
}

/// Resolves once the renderer has been starved and no input arrived for
/// `grace` since `last_input`.
async fn starved_for(session: &RenderSession, last_input: Instant, grace: Duration) {
    loop {
        session.wait_for_starvation().await;
        tokio::time::sleep_until(last_input + grace).await;
        if session.is_starved() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::protocol::{
        read_frame, write_end_of_stream, write_handshake, write_path_directive, BitDepth,
    };
    use crate::render::{PassthroughRenderer, RenderJob, RenderReport, RenderSource};
    use std::io::{Read, Write};
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            pump: PumpConfig {
                yield_interval: Duration::ZERO,
                ..PumpConfig::default()
            },
            ..ConnectionConfig::default()
        }
    }

    fn handler(renderer: Arc<dyn Renderer>) -> ConnectionHandler {
        ConnectionHandler::new(renderer, test_config())
    }

    fn spawn_server(
        handler: ConnectionHandler,
    ) -> (DuplexStream, tokio::task::JoinHandle<Result<ConnectionReport>>) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let task = tokio::spawn(async move { handler.run(server).await });
        (client, task)
    }

    /// Emits `factor` output bytes per input byte, holding back the first
    /// `prime` input bytes until end of input.
    fn expander(prime: usize, factor: usize) -> impl Renderer {
        move |job: RenderJob| -> std::io::Result<RenderReport> {
            let RenderJob {
                source, mut output, ..
            } = job;
            let RenderSource::Stream(mut reader) = source else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "stream only",
                ));
            };
            let mut seen = 0usize;
            let mut buf = vec![0u8; 4096];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                let before = seen.saturating_sub(prime);
                seen += n;
                let after = seen.saturating_sub(prime);
                output.write_all(&vec![0x22; (after - before) * factor])?;
            }
            output.write_all(&vec![0x33; seen.min(prime) * factor])?;
            Ok(RenderReport {
                samples_rendered: seen as u64,
                total_samples: None,
            })
        }
    }

    #[tokio::test]
    async fn test_streaming_reply_waits_for_mandatory_bytes() {
        // 16-bit mono, 4 samples per block, 2 blocks mandatory -> 16 bytes.
        let (mut client, task) = spawn_server(handler(Arc::new(expander(0, 2))));
        let hs = Handshake::streaming(BitDepth::Sixteen, 2, 1, 4).unwrap();
        write_handshake(&mut client, &hs).await.unwrap();

        write_frame(&mut client, &[1u8; 8]).await.unwrap();
        let reply = read_frame(&mut client, MAX_CHUNK_BYTES).await.unwrap();
        assert_eq!(reply.len(), 16);

        write_end_of_stream(&mut client).await.unwrap();
        let last = read_frame(&mut client, MAX_CHUNK_BYTES).await.unwrap();
        assert!(last.is_end_of_stream());

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.frames_in, 1);
        assert_eq!(report.bytes_in, 8);
        assert_eq!(report.frames_out, 1);
        assert_eq!(report.keepalives, 0);
    }

    #[tokio::test]
    async fn test_starved_renderer_gets_keepalive() {
        // Renderer holds everything back, so the only way forward is a keepalive.
        let (mut client, task) = spawn_server(handler(Arc::new(expander(usize::MAX, 1))));
        let hs = Handshake::streaming(BitDepth::Sixteen, 1, 2, 16).unwrap();
        write_handshake(&mut client, &hs).await.unwrap();

        write_frame(&mut client, &[0u8; 64]).await.unwrap();
        let reply = read_frame(&mut client, MAX_CHUNK_BYTES).await.unwrap();
        assert!(reply.is_empty());

        client.shutdown().await.unwrap();
        drop(client);
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.keepalives, 1);
        assert_eq!(report.frames_out, 0);
    }

    #[tokio::test]
    async fn test_end_of_stream_pays_debts_then_sentinel() {
        // Two frames sent back to back; all output appears only at the end.
        let (mut client, task) = spawn_server(handler(Arc::new(expander(usize::MAX, 1))));
        let hs = Handshake::streaming(BitDepth::Sixteen, 1, 1, 4).unwrap();
        write_handshake(&mut client, &hs).await.unwrap();

        write_frame(&mut client, &[5u8; 8]).await.unwrap();
        write_frame(&mut client, &[6u8; 8]).await.unwrap();
        write_end_of_stream(&mut client).await.unwrap();

        let mut frames = Vec::new();
        loop {
            let frame = read_frame(&mut client, MAX_CHUNK_BYTES).await.unwrap();
            let done = frame.is_end_of_stream();
            frames.push(frame);
            if done {
                break;
            }
        }

        // Two lockstep replies of mandatory size (8 bytes), then the sentinel.
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len(), 8);
        assert_eq!(frames[1].len(), 8);
        assert!(frames[2].is_end_of_stream());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_zero_mandatory_replies_with_pending() {
        let (mut client, task) = spawn_server(handler(Arc::new(PassthroughRenderer::default())));
        let hs = Handshake::streaming(BitDepth::Sixteen, 0, 1, 2).unwrap();
        write_handshake(&mut client, &hs).await.unwrap();

        write_frame(&mut client, &[1, 2, 3, 4]).await.unwrap();
        let reply = read_frame(&mut client, MAX_CHUNK_BYTES).await.unwrap();
        assert!(reply.len() % 2 == 0);

        client.shutdown().await.unwrap();
        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_capped_reply_keeps_sample_frames_whole() {
        // 24-bit, 7 channels: 21-byte sample frames, and a mandatory size
        // above the frame payload limit.
        let config = ConnectionConfig {
            keepalive_grace: Duration::from_secs(5),
            ..test_config()
        };
        let handler = ConnectionHandler::new(Arc::new(expander(0, 21)), config);
        let (mut client, task) = spawn_server(handler);
        let hs = Handshake::streaming(BitDepth::TwentyFour, 255, 7, 2048).unwrap();
        write_handshake(&mut client, &hs).await.unwrap();

        write_frame(&mut client, &vec![0u8; 1_000_000]).await.unwrap();
        let reply = read_frame(&mut client, MAX_CHUNK_BYTES).await.unwrap();
        assert_eq!(reply.len(), hs.reply_bytes());
        assert_eq!(reply.len() % 21, 0);

        client.shutdown().await.unwrap();
        drop(client);
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.frames_out, 1);
    }

    #[tokio::test]
    async fn test_stalled_renderer_gets_keepalive_after_timeout() {
        // Never reads input, so it is never starved; only the stall timer can
        // answer the debt.
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let gate = std::sync::Mutex::new(gate);
        let renderer = move |_job: RenderJob| -> std::io::Result<RenderReport> {
            let _ = gate.lock().map(|rx| rx.recv());
            Ok(RenderReport::default())
        };
        let config = ConnectionConfig {
            stall_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (mut client, task) = spawn_server(ConnectionHandler::new(Arc::new(renderer), config));
        let hs = Handshake::streaming(BitDepth::Sixteen, 1, 2, 16).unwrap();
        write_handshake(&mut client, &hs).await.unwrap();

        write_frame(&mut client, &[0u8; 64]).await.unwrap();
        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            read_frame(&mut client, MAX_CHUNK_BYTES),
        )
        .await
        .expect("stall keepalive should arrive")
        .unwrap();
        drop(release);
        assert!(reply.is_empty());

        client.shutdown().await.unwrap();
        drop(client);
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.keepalives, 1);
        assert_eq!(report.frames_out, 0);
    }

    #[tokio::test]
    async fn test_renderer_finishing_early_settles_remaining_debts() {
        // 16-bit mono, 4-sample blocks, 1 mandatory block: 8-byte replies.
        // The renderer answers the first read and then returns.
        let renderer = |job: RenderJob| -> std::io::Result<RenderReport> {
            let RenderJob {
                source, mut output, ..
            } = job;
            let RenderSource::Stream(mut reader) = source else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "stream only",
                ));
            };
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            output.write_all(&[7u8; 8])?;
            Ok(RenderReport {
                samples_rendered: 4,
                total_samples: None,
            })
        };
        let (mut client, task) = spawn_server(handler(Arc::new(renderer)));
        let hs = Handshake::streaming(BitDepth::Sixteen, 1, 1, 4).unwrap();
        write_handshake(&mut client, &hs).await.unwrap();

        write_frame(&mut client, &[1u8; 8]).await.unwrap();
        let first = read_frame(&mut client, MAX_CHUNK_BYTES).await.unwrap();
        assert_eq!(first.payload(), &[7u8; 8]);

        // Input keeps flowing after the renderer is done.
        write_frame(&mut client, &[2u8; 8]).await.unwrap();
        let second = read_frame(&mut client, MAX_CHUNK_BYTES).await.unwrap();
        assert!(second.is_empty());

        write_end_of_stream(&mut client).await.unwrap();
        let last = read_frame(&mut client, MAX_CHUNK_BYTES).await.unwrap();
        assert!(last.is_end_of_stream());

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.frames_in, 2);
        assert_eq!(report.frames_out, 1);
        assert_eq!(report.keepalives, 1);
    }

    #[tokio::test]
    async fn test_bad_handshake_is_protocol_sync() {
        let (mut client, task) = spawn_server(handler(Arc::new(PassthroughRenderer::default())));
        client.write_all(&[16, 6, 2, 0, 0, 0, 0, 0]).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolSync(_)));
    }

    #[tokio::test]
    async fn test_oversized_input_frame_rejected() {
        let (mut client, task) = spawn_server(handler(Arc::new(PassthroughRenderer::default())));
        let hs = Handshake::streaming(BitDepth::Sixteen, 1, 2, 16).unwrap();
        write_handshake(&mut client, &hs).await.unwrap();
        client
            .write_all(&((MAX_CHUNK_BYTES as u32) + 1).to_le_bytes())
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::InvalidFrameLength(_)));
    }

    #[tokio::test]
    async fn test_file_mode_renders_path() {
        let path = std::env::temp_dir().join(format!(
            "renderwire-conn-test-{}.raw",
            std::process::id()
        ));
        std::fs::write(&path, vec![9u8; 4 * 100]).unwrap();

        let (mut client, task) = spawn_server(handler(Arc::new(PassthroughRenderer::default())));
        let hs = Handshake::file(BitDepth::Sixteen, 0, 2, 10).unwrap();
        write_handshake(&mut client, &hs).await.unwrap();
        write_path_directive(&mut client, path.to_str().unwrap())
            .await
            .unwrap();

        let mut total = 0;
        loop {
            match read_frame(&mut client, MAX_CHUNK_BYTES).await.unwrap() {
                Frame::Data(bytes) => total += bytes.len(),
                Frame::EndOfStream => break,
            }
        }
        assert_eq!(total, 400);

        let report = task.await.unwrap().unwrap();
        assert!(matches!(report.mode, Mode::File { block_size: 10 }));
        assert_eq!(report.bytes_out, 400);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_file_mode_missing_file_is_render_fault() {
        let (mut client, task) = spawn_server(handler(Arc::new(PassthroughRenderer::default())));
        let hs = Handshake::file(BitDepth::Sixteen, 0, 2, 10).unwrap();
        write_handshake(&mut client, &hs).await.unwrap();
        write_path_directive(&mut client, "/nonexistent/renderwire/input.thd")
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::RenderFault(_)));
    }
}
