//! Producer session: the client side of one connection.
//!
//! # Streaming
//!
//! Chunks are sent without waiting for replies until `initial_burst` chunks
//! are out; from then on exactly one reply is read per chunk sent. The burst
//! lets a decoder warm up without deadlocking the pair. Zero-length replies
//! are keepalives and are never forwarded.
//!
//! # File
//!
//! The path directive is sent and every frame up to the sentinel is forwarded
//! to the sink.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::config::ProducerConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    read_frame, read_frame_or_eof, read_full, write_end_of_stream, write_frame, write_handshake,
    write_path_directive, Frame, FrameBuffer, MAX_CHUNK_BYTES,
};
use crate::transport::{connect_endpoint, discover_endpoint, PipeStream};

/// Read buffer for the file-mode drain.
const DRAIN_BUFFER_SIZE: usize = 64 * 1024;

/// Where a producer run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Connecting,
    HandshakeSent,
    StreamingLoop,
    FileWait,
    Draining,
    Closed,
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Input chunks sent to the server.
    pub chunks_in: u64,
    pub bytes_in: u64,
    /// Rendered frames forwarded to the sink.
    pub chunks_out: u64,
    pub bytes_out: u64,
    pub keepalives: u64,
}

/// A failed run, with what it managed before failing.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunError {
    #[source]
    pub error: BridgeError,
    pub stats: RunStats,
}

/// What to send.
#[derive(Debug)]
pub enum ProducerInput<R> {
    /// Stream bytes from a reader.
    Stream(R),
    /// Let the renderer open this file.
    File(PathBuf),
}

/// One connection from the producer side.
pub struct ProducerSession<S> {
    stream: S,
    config: ProducerConfig,
    state: ProducerState,
    stats: RunStats,
}

impl ProducerSession<PipeStream> {
    /// Discover the endpoint and connect to it.
    pub async fn connect(config: ProducerConfig) -> Result<Self> {
        tracing::debug!(from = ?ProducerState::Idle, to = ?ProducerState::Connecting, "Producer state");
        let endpoint = discover_endpoint(config.endpoint.as_deref())?;
        let stream = connect_endpoint(&endpoint, config.connect_timeout).await?;
        tracing::info!(endpoint = %endpoint, "Connected to render server");

        let mut session = Self::new(stream, config);
        session.state = ProducerState::Connecting;
        Ok(session)
    }
}

impl<S> ProducerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already connected stream.
    pub fn new(stream: S, config: ProducerConfig) -> Self {
        Self {
            stream,
            config,
            state: ProducerState::Idle,
            stats: RunStats::default(),
        }
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    fn transition(&mut self, next: ProducerState) {
        tracing::debug!(from = ?self.state, to = ?next, "Producer state");
        self.state = next;
    }

    /// Stream `source` to the server in lockstep and forward replies to `sink`.
    pub async fn stream<R, W>(
        mut self,
        source: &mut R,
        sink: &mut W,
    ) -> std::result::Result<RunStats, RunError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = self.run_stream(source, sink).await;
        self.finish(result)
    }

    /// Ask the server to render `path` and forward the output to `sink`.
    pub async fn file<W>(
        mut self,
        path: &Path,
        sink: &mut W,
    ) -> std::result::Result<RunStats, RunError>
    where
        W: AsyncWrite + Unpin,
    {
        let result = self.run_file(path, sink).await;
        self.finish(result)
    }

    fn finish(mut self, result: Result<()>) -> std::result::Result<RunStats, RunError> {
        self.transition(ProducerState::Closed);
        match result {
            Ok(()) => {
                tracing::info!(
                    chunks_in = self.stats.chunks_in,
                    chunks_out = self.stats.chunks_out,
                    bytes_out = self.stats.bytes_out,
                    keepalives = self.stats.keepalives,
                    "Producer run complete"
                );
                Ok(self.stats)
            }
            Err(error) => {
                tracing::error!(
                    error = %error,
                    chunks_in = self.stats.chunks_in,
                    chunks_out = self.stats.chunks_out,
                    bytes_out = self.stats.bytes_out,
                    keepalives = self.stats.keepalives,
                    "Producer run failed"
                );
                Err(RunError {
                    error,
                    stats: self.stats,
                })
            }
        }
    }

    async fn run_stream<R, W>(&mut self, source: &mut R, sink: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let handshake = self.config.streaming_handshake()?;
        write_handshake(&mut self.stream, &handshake).await?;
        self.transition(ProducerState::HandshakeSent);
        self.transition(ProducerState::StreamingLoop);

        let burst = u64::from(self.config.initial_burst);
        let chunk_size = self.config.chunk_size.clamp(1, MAX_CHUNK_BYTES);
        let mut chunk = vec![0u8; chunk_size];
        let mut sent = 0u64;
        let mut received = 0u64;
        let mut idle = 0u32;

        loop {
            let n = read_full(source, &mut chunk).await?;
            if n == 0 {
                break;
            }

            write_frame(&mut self.stream, &chunk[..n]).await?;
            sent += 1;
            self.stats.chunks_in += 1;
            self.stats.bytes_in += n as u64;

            if sent >= burst {
                self.read_reply(sink, &mut idle).await?;
                received += 1;
            }

            if n < chunk_size {
                break;
            }
        }

        write_end_of_stream(&mut self.stream).await?;
        self.transition(ProducerState::Draining);
        tracing::debug!(sent, received, "Input exhausted, collecting outstanding replies");

        while received < sent {
            self.read_reply(sink, &mut idle).await?;
            received += 1;
        }

        // Tail after the lockstep replies, up to the sentinel.
        while let Some(frame) = read_frame_or_eof(&mut self.stream, MAX_CHUNK_BYTES).await? {
            match frame {
                Frame::Data(payload) => self.forward(sink, &payload).await?,
                Frame::EndOfStream => break,
            }
        }
        Ok(())
    }

    /// Read one lockstep reply.
    async fn read_reply<W>(&mut self, sink: &mut W, idle: &mut u32) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match read_frame(&mut self.stream, MAX_CHUNK_BYTES).await? {
            Frame::Data(payload) => {
                *idle = 0;
                self.forward(sink, &payload).await
            }
            Frame::EndOfStream => {
                *idle += 1;
                self.stats.keepalives += 1;
                if *idle > self.config.max_idle_replies {
                    return Err(BridgeError::RenderStalled { replies: *idle });
                }
                tracing::trace!(idle = *idle, "Keepalive reply");
                Ok(())
            }
        }
    }

    async fn run_file<W>(&mut self, path: &Path, sink: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let path = path
            .to_str()
            .ok_or_else(|| BridgeError::InvalidPath(path.to_string_lossy().into_owned()))?;

        let handshake = self.config.file_handshake()?;
        write_handshake(&mut self.stream, &handshake).await?;
        self.transition(ProducerState::HandshakeSent);
        self.transition(ProducerState::FileWait);

        write_path_directive(&mut self.stream, path).await?;
        self.transition(ProducerState::Draining);

        let mut frames = FrameBuffer::new();
        let mut buf = vec![0u8; DRAIN_BUFFER_SIZE];
        loop {
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(match frames.pending_payload() {
                    0 => BridgeError::ConnectionClosed,
                    remaining => BridgeError::ShortRead {
                        expected: remaining,
                        received: frames.len(),
                    },
                });
            }

            for frame in frames.push(&buf[..n])? {
                match frame {
                    Frame::Data(payload) => self.forward(sink, &payload).await?,
                    Frame::EndOfStream => return Ok(()),
                }
            }
        }
    }

    async fn forward<W>(&mut self, sink: &mut W, payload: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        sink.write_all(payload).await?;
        sink.flush().await?;
        self.stats.chunks_out += 1;
        self.stats.bytes_out += payload.len() as u64;
        Ok(())
    }
}

/// Connect, then stream or hand over a file depending on `input`.
pub async fn run<R, W>(
    config: ProducerConfig,
    input: ProducerInput<R>,
    sink: &mut W,
) -> std::result::Result<RunStats, RunError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let session = ProducerSession::connect(config)
        .await
        .map_err(|error| RunError {
            error,
            stats: RunStats::default(),
        })?;

    match input {
        ProducerInput::Stream(mut reader) => session.stream(&mut reader, sink).await,
        ProducerInput::File(path) => session.file(&path, sink).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_handshake, read_path_directive, Mode};
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn config() -> ProducerConfig {
        ProducerConfig {
            initial_burst: 10,
            max_idle_replies: 200,
            chunk_size: 4096,
            ..ProducerConfig::default()
        }
    }

    async fn expect_no_frame(server: &mut DuplexStream) {
        let pending = tokio::time::timeout(
            Duration::from_millis(100),
            read_frame(server, MAX_CHUNK_BYTES),
        )
        .await;
        assert!(pending.is_err(), "producer sent before its reply arrived");
    }

    #[tokio::test]
    async fn test_lockstep_burst_then_one_reply_per_send() {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let source: Vec<u8> = vec![7u8; 12 * 4096];

        let producer = tokio::spawn(async move {
            let mut source = Cursor::new(source);
            let mut sink = Vec::new();
            let stats = ProducerSession::new(client, config())
                .stream(&mut source, &mut sink)
                .await
                .unwrap();
            (stats, sink)
        });

        let hs = read_handshake(&mut server).await.unwrap();
        assert_eq!(hs.mode, Mode::Streaming { update_rate: 1024 });

        // The burst needs no replies.
        for _ in 0..10 {
            assert_eq!(read_frame(&mut server, MAX_CHUNK_BYTES).await.unwrap().len(), 4096);
        }
        expect_no_frame(&mut server).await;

        // Reply to send #1 releases send #11, which then waits for reply #2.
        write_frame(&mut server, &[1u8; 8]).await.unwrap();
        assert_eq!(read_frame(&mut server, MAX_CHUNK_BYTES).await.unwrap().len(), 4096);
        expect_no_frame(&mut server).await;

        write_frame(&mut server, &[2u8; 8]).await.unwrap();
        assert_eq!(read_frame(&mut server, MAX_CHUNK_BYTES).await.unwrap().len(), 4096);

        write_frame(&mut server, &[3u8; 8]).await.unwrap();
        assert!(read_frame(&mut server, MAX_CHUNK_BYTES)
            .await
            .unwrap()
            .is_end_of_stream());

        // Nine replies are still owed, then a tail frame and the sentinel.
        for i in 0..9u8 {
            write_frame(&mut server, &[10 + i; 8]).await.unwrap();
        }
        write_frame(&mut server, &[99u8; 4]).await.unwrap();
        write_end_of_stream(&mut server).await.unwrap();

        let (stats, sink) = producer.await.unwrap();
        assert_eq!(stats.chunks_in, 12);
        assert_eq!(stats.bytes_in, 12 * 4096);
        assert_eq!(stats.chunks_out, 13);
        assert_eq!(stats.bytes_out, 12 * 8 + 4);
        assert_eq!(stats.keepalives, 0);
        assert_eq!(&sink[..8], &[1u8; 8]);
        assert_eq!(&sink[sink.len() - 4..], &[99u8; 4]);
    }

    #[tokio::test]
    async fn test_keepalives_beyond_limit_are_render_stalled() {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let cfg = ProducerConfig {
            initial_burst: 1,
            max_idle_replies: 5,
            chunk_size: 16,
            ..ProducerConfig::default()
        };

        let producer = tokio::spawn(async move {
            let mut source = Cursor::new(vec![0u8; 16 * 100]);
            let mut sink = Vec::new();
            let result = ProducerSession::new(client, cfg)
                .stream(&mut source, &mut sink)
                .await;
            (result, sink)
        });

        read_handshake(&mut server).await.unwrap();
        let server_task = tokio::spawn(async move {
            // Keep answering every chunk with a keepalive.
            while let Ok(Frame::Data(_)) = read_frame(&mut server, MAX_CHUNK_BYTES).await {
                if write_end_of_stream(&mut server).await.is_err() {
                    break;
                }
            }
        });

        let (result, sink) = producer.await.unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err.error, BridgeError::RenderStalled { replies: 6 }));
        assert_eq!(err.stats.keepalives, 6);
        assert_eq!(err.stats.chunks_out, 0);
        assert!(sink.is_empty());
        server_task.abort();
    }

    #[tokio::test]
    async fn test_keepalive_counter_resets_on_data() {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let cfg = ProducerConfig {
            initial_burst: 1,
            max_idle_replies: 2,
            chunk_size: 4,
            ..ProducerConfig::default()
        };

        let producer = tokio::spawn(async move {
            let mut source = Cursor::new(vec![0u8; 4 * 6]);
            let mut sink = Vec::new();
            ProducerSession::new(client, cfg)
                .stream(&mut source, &mut sink)
                .await
        });

        read_handshake(&mut server).await.unwrap();
        // keepalive, keepalive, data, keepalive, keepalive, data
        for i in 0..6 {
            read_frame(&mut server, MAX_CHUNK_BYTES).await.unwrap();
            if i % 3 == 2 {
                write_frame(&mut server, &[1, 2, 3, 4]).await.unwrap();
            } else {
                write_end_of_stream(&mut server).await.unwrap();
            }
        }
        assert!(read_frame(&mut server, MAX_CHUNK_BYTES)
            .await
            .unwrap()
            .is_end_of_stream());
        write_end_of_stream(&mut server).await.unwrap();

        let stats = producer.await.unwrap().unwrap();
        assert_eq!(stats.keepalives, 4);
        assert_eq!(stats.chunks_out, 2);
    }

    #[tokio::test]
    async fn test_clean_close_after_outstanding_replies_ends_run() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let cfg = ProducerConfig {
            initial_burst: 4,
            chunk_size: 8,
            ..ProducerConfig::default()
        };

        let producer = tokio::spawn(async move {
            let mut source = Cursor::new(vec![5u8; 8 * 2]);
            let mut sink = Vec::new();
            ProducerSession::new(client, cfg)
                .stream(&mut source, &mut sink)
                .await
        });

        read_handshake(&mut server).await.unwrap();
        read_frame(&mut server, MAX_CHUNK_BYTES).await.unwrap();
        read_frame(&mut server, MAX_CHUNK_BYTES).await.unwrap();
        assert!(read_frame(&mut server, MAX_CHUNK_BYTES)
            .await
            .unwrap()
            .is_end_of_stream());
        write_frame(&mut server, &[1u8; 8]).await.unwrap();
        write_frame(&mut server, &[2u8; 8]).await.unwrap();
        drop(server);

        let stats = producer.await.unwrap().unwrap();
        assert_eq!(stats.chunks_in, 2);
        assert_eq!(stats.bytes_out, 16);
    }

    #[tokio::test]
    async fn test_file_mode_forwards_until_sentinel() {
        let (client, mut server) = tokio::io::duplex(1 << 16);

        let producer = tokio::spawn(async move {
            let mut sink = Vec::new();
            let stats = ProducerSession::new(client, ProducerConfig::default())
                .file(Path::new("/media/movie.thd"), &mut sink)
                .await
                .unwrap();
            (stats, sink)
        });

        let hs = read_handshake(&mut server).await.unwrap();
        assert!(hs.is_file_mode());
        assert_eq!(read_path_directive(&mut server).await.unwrap(), "/media/movie.thd");

        write_frame(&mut server, b"abc").await.unwrap();
        write_frame(&mut server, b"defg").await.unwrap();
        write_end_of_stream(&mut server).await.unwrap();

        let (stats, sink) = producer.await.unwrap();
        assert_eq!(sink, b"abcdefg");
        assert_eq!(stats.chunks_out, 2);
    }

    #[tokio::test]
    async fn test_file_mode_premature_close_is_error() {
        let (client, mut server) = tokio::io::duplex(1 << 16);

        let producer = tokio::spawn(async move {
            let mut sink = Vec::new();
            ProducerSession::new(client, ProducerConfig::default())
                .file(Path::new("/media/movie.thd"), &mut sink)
                .await
        });

        read_handshake(&mut server).await.unwrap();
        read_path_directive(&mut server).await.unwrap();
        write_frame(&mut server, b"abc").await.unwrap();
        drop(server);

        let err = producer.await.unwrap().unwrap_err();
        assert!(matches!(err.error, BridgeError::ConnectionClosed));
        assert_eq!(err.stats.bytes_out, 3);
    }

    #[tokio::test]
    async fn test_file_mode_invalid_length_is_error() {
        let (client, mut server) = tokio::io::duplex(1 << 16);

        let producer = tokio::spawn(async move {
            let mut sink = Vec::new();
            ProducerSession::new(client, ProducerConfig::default())
                .file(Path::new("/media/movie.thd"), &mut sink)
                .await
        });

        read_handshake(&mut server).await.unwrap();
        read_path_directive(&mut server).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut server, &(-5i32).to_le_bytes())
            .await
            .unwrap();

        let err = producer.await.unwrap().unwrap_err();
        assert!(matches!(err.error, BridgeError::InvalidFrameLength(-5)));
    }

    #[tokio::test]
    async fn test_unencodable_block_size_fails_before_sending() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let cfg = ProducerConfig {
            block_size: 1 << 31,
            ..config()
        };

        let mut sink = Vec::new();
        let err = ProducerSession::new(client, cfg)
            .stream(&mut Cursor::new(vec![0u8; 4096]), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err.error, BridgeError::ProtocolSync(_)));
        assert_eq!(err.stats, RunStats::default());

        // Nothing reached the wire.
        let mut buf = [0u8; 1];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_run_without_endpoint_is_not_found() {
        let cfg = ProducerConfig {
            endpoint: Some("/nonexistent/renderwire.sock".to_string()),
            ..ProducerConfig::default()
        };
        let mut sink = Vec::new();
        let err = run(
            cfg,
            ProducerInput::Stream(Cursor::new(Vec::<u8>::new())),
            &mut sink,
        )
        .await
        .unwrap_err();
        assert!(matches!(err.error, BridgeError::EndpointNotFound(_)));
    }
}
