//! Endpoints on the local machine.
//!
//! A Unix domain socket on Unix, a named pipe on Windows. Either way one
//! listener hands out one connected stream per `accept`.
//!
//! # Example
//!
//! ```ignore
//! use renderwire::transport::{default_endpoint_path, PipeListener, PipeStream};
//!
//! let mut listener = PipeListener::bind(&default_endpoint_path()).await?;
//! let stream = listener.accept().await?;
//! ```

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{BridgeError, Result};

/// Prefix shared by every endpoint name this crate creates.
pub const ENDPOINT_PREFIX: &str = "renderwire";

/// Well-known endpoint the server binds by default.
///
/// - Unix: `$TMPDIR/renderwire.sock`
/// - Windows: `\\.\pipe\renderwire`
pub fn default_endpoint_path() -> String {
    #[cfg(unix)]
    {
        std::env::temp_dir()
            .join(format!("{}.sock", ENDPOINT_PREFIX))
            .to_string_lossy()
            .into_owned()
    }

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\{}", ENDPOINT_PREFIX)
    }
}

/// Generate a unique endpoint path for this process.
///
/// Format:
/// - Unix: `$TMPDIR/renderwire-{pid}-{random}.sock`
/// - Windows: `\\.\pipe\renderwire-{pid}-{random}`
pub fn generate_endpoint_path() -> String {
    let pid = std::process::id();
    let rand: u64 = rand_u64();

    #[cfg(unix)]
    {
        std::env::temp_dir()
            .join(format!("{}-{}-{:x}.sock", ENDPOINT_PREFIX, pid, rand))
            .to_string_lossy()
            .into_owned()
    }

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\{}-{}-{:x}", ENDPOINT_PREFIX, pid, rand)
    }
}

/// Simple random u64 using system time, a process-wide counter and the PID.
fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);

    let pid = std::process::id() as u64;
    (nanos ^ seq.rotate_left(32)).wrapping_mul(0x517cc1b727220a95) ^ pid
}

/// Resolve the endpoint a producer should connect to.
///
/// Order: explicit endpoint, well-known endpoint, newest per-process endpoint
/// in the temp directory (Unix only).
pub fn discover_endpoint(explicit: Option<&str>) -> Result<String> {
    if let Some(path) = explicit {
        if endpoint_exists(path) {
            return Ok(path.to_string());
        }
        return Err(BridgeError::EndpointNotFound(path.to_string()));
    }

    let default = default_endpoint_path();
    if endpoint_exists(&default) {
        return Ok(default);
    }

    #[cfg(unix)]
    if let Some(found) = newest_generated_endpoint(&std::env::temp_dir()) {
        return Ok(found);
    }

    Err(BridgeError::EndpointNotFound(default))
}

#[cfg(unix)]
fn endpoint_exists(path: &str) -> bool {
    std::path::Path::new(path).exists()
}

// Named pipes are not visible on the filesystem; existence is settled by
// the connect attempt itself.
#[cfg(windows)]
fn endpoint_exists(_path: &str) -> bool {
    true
}

#[cfg(unix)]
fn newest_generated_endpoint(dir: &std::path::Path) -> Option<String> {
    let prefix = format!("{}-", ENDPOINT_PREFIX);
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(&prefix) && name.ends_with(".sock")
        })
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, entry.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path.to_string_lossy().into_owned())
}

// Unix: domain sockets.

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::io::IoSlice;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    /// Socket listener. Owns the socket file and removes it on drop.
    pub struct PipeListener {
        listener: UnixListener,
        path: String,
    }

    /// A connected socket.
    pub struct PipeStream {
        stream: UnixStream,
    }

    impl PipeListener {
        /// Bind `path`, replacing a stale socket file left by a dead server.
        pub async fn bind(path: &str) -> Result<Self> {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path, "Removed stale socket file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            Ok(Self {
                listener: UnixListener::bind(path)?,
                path: path.to_string(),
            })
        }

        pub async fn accept(&mut self) -> Result<PipeStream> {
            let (stream, _) = self.listener.accept().await?;
            Ok(PipeStream { stream })
        }

        pub fn path(&self) -> &str {
            &self.path
        }

        /// Whether the endpoint can still take connections.
        ///
        /// False once someone removed the socket file.
        pub fn is_alive(&self) -> bool {
            Path::new(&self.path).exists()
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    impl PipeStream {
        /// Connect to a listening endpoint.
        pub async fn connect(path: &str) -> Result<Self> {
            match UnixStream::connect(path).await {
                Ok(stream) => Ok(Self { stream }),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(BridgeError::EndpointNotFound(path.to_string()))
                }
                Err(e) => Err(BridgeError::Io(e)),
            }
        }
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.stream).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.stream).poll_write(cx, buf)
        }

        fn poll_write_vectored(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            bufs: &[IoSlice<'_>],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
        }

        fn is_write_vectored(&self) -> bool {
            self.stream.is_write_vectored()
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.stream).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.stream).poll_shutdown(cx)
        }
    }
}

// Windows: named pipes.

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    /// Win32 `ERROR_PIPE_BUSY`: every instance is taken.
    const ERROR_PIPE_BUSY: i32 = 231;

    /// Interval between connect attempts while the pipe is busy.
    const BUSY_RETRY: Duration = Duration::from_millis(50);

    /// Pipe listener.
    ///
    /// Holds the next unconnected pipe instance so the name stays reserved.
    pub struct PipeListener {
        path: String,
        next: Option<NamedPipeServer>,
    }

    enum Inner {
        Server(NamedPipeServer),
        Client(NamedPipeClient),
    }

    /// A connected pipe, from either end.
    pub struct PipeStream {
        pipe: Inner,
    }

    impl PipeListener {
        /// Create the first instance, failing if another server owns the name.
        pub async fn bind(path: &str) -> Result<Self> {
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .create(path)
                .map_err(BridgeError::Io)?;

            Ok(Self {
                path: path.to_string(),
                next: Some(first),
            })
        }

        pub async fn accept(&mut self) -> Result<PipeStream> {
            let server = match self.next.take() {
                Some(server) => server,
                None => ServerOptions::new()
                    .create(&self.path)
                    .map_err(BridgeError::Io)?,
            };

            server.connect().await?;

            // Queue the next instance now so later clients wait instead of
            // failing with "not found".
            self.next = ServerOptions::new().create(&self.path).ok();

            Ok(PipeStream {
                pipe: Inner::Server(server),
            })
        }

        pub fn path(&self) -> &str {
            &self.path
        }

        /// Whether the endpoint can still take connections.
        pub fn is_alive(&self) -> bool {
            self.next.is_some()
        }
    }

    impl PipeStream {
        /// Connect to a listening pipe, retrying while every instance is busy.
        ///
        /// Retries forever; bound it with [`connect_endpoint`](super::connect_endpoint).
        pub async fn connect(path: &str) -> Result<Self> {
            loop {
                match ClientOptions::new().open(path) {
                    Ok(client) => {
                        return Ok(Self {
                            pipe: Inner::Client(client),
                        })
                    }
                    Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(BridgeError::EndpointNotFound(path.to_string()))
                    }
                    Err(e) => return Err(BridgeError::Io(e)),
                }
                tokio::time::sleep(BUSY_RETRY).await;
            }
        }
    }

    macro_rules! delegate {
        ($self:ident, $pipe:ident => $call:expr) => {
            match &mut $self.pipe {
                Inner::Server($pipe) => $call,
                Inner::Client($pipe) => $call,
            }
        };
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            delegate!(self, p => Pin::new(p).poll_read(cx, buf))
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            delegate!(self, p => Pin::new(p).poll_write(cx, buf))
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            delegate!(self, p => Pin::new(p).poll_flush(cx))
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            delegate!(self, p => Pin::new(p).poll_shutdown(cx))
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{PipeListener, PipeStream};

#[cfg(windows)]
pub use windows_impl::{PipeListener, PipeStream};

/// Connect to `path`, failing with `ConnectTimeout` after `timeout`.
pub async fn connect_endpoint(path: &str, timeout: Duration) -> Result<PipeStream> {
    match tokio::time::timeout(timeout, PipeStream::connect(path)).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::ConnectTimeout(timeout)),
    }
}
