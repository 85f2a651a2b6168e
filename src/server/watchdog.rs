//! Connection watchdog: owns the endpoint and serves one producer at a time.
//!
//! The [`WatchdogBuilder`] provides a fluent API for configuring the server
//! side. The running watchdog manages the lifecycle:
//! 1. (Re)create the endpoint, retrying inside the launch window
//! 2. Accept exactly one connection
//! 3. Decode the handshake and run the mode-specific handler
//! 4. Publish the outcome and loop
//!
//! Per-connection failures never stop the loop. Only `LaunchTimeout` or
//! [`WatchdogHandle::stop`] do.
//!
//! # Example
//!
//! ```ignore
//! use renderwire::server::Watchdog;
//! use renderwire::render::PassthroughRenderer;
//!
//! let handle = Watchdog::builder()
//!     .endpoint("/tmp/renderwire.sock")
//!     .renderer(PassthroughRenderer::default())
//!     .start()
//!     .await?;
//!
//! handle.wait().await?;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionConfig, ConnectionHandler, ConnectionReport};
use super::pump::PumpConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::Handshake;
use crate::render::{PassthroughRenderer, Renderer};
use crate::transport::{default_endpoint_path, PipeListener, PipeStream};

/// Default time allowed for (re)creating the endpoint.
pub const DEFAULT_LAUNCH_WINDOW: Duration = Duration::from_secs(10);

/// Default pause between endpoint creation attempts.
pub const DEFAULT_LAUNCH_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// How often an idle watchdog checks that its endpoint still exists.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Events buffered per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

/// Watchdog configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Endpoint path (socket path or pipe name).
    pub endpoint: String,
    pub launch_window: Duration,
    pub launch_retry_interval: Duration,
    pub connection: ConnectionConfig,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint_path(),
            launch_window: DEFAULT_LAUNCH_WINDOW,
            launch_retry_interval: DEFAULT_LAUNCH_RETRY_INTERVAL,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Lifecycle notifications published by the watchdog.
#[derive(Debug, Clone)]
pub enum WatchdogEvent {
    /// The endpoint was (re)created and accepts connections.
    EndpointReady { endpoint: String },
    Connected { connection: u64 },
    HandshakeAccepted { connection: u64, handshake: Handshake },
    /// The connection ended. Errors are carried as their display text.
    Disconnected {
        connection: u64,
        result: std::result::Result<ConnectionReport, String>,
    },
    /// The watchdog loop exited. `reason` is set when it failed.
    Stopped { reason: Option<String> },
}

/// Shared flags and counters.
#[derive(Debug, Default)]
pub struct WatchdogStatus {
    running: AtomicBool,
    connected: AtomicBool,
    connections: AtomicU64,
    failures: AtomicU64,
}

impl WatchdogStatus {
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Connections accepted so far.
    #[inline]
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }

    /// Connections that ended with an error.
    #[inline]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }
}

/// The watchdog's endpoint, recreated whenever it disappears.
struct Endpoint {
    path: String,
    listener: Option<PipeListener>,
    window: Duration,
    retry_interval: Duration,
}

impl Endpoint {
    fn new(config: &WatchdogConfig) -> Self {
        Self {
            path: config.endpoint.clone(),
            listener: None,
            window: config.launch_window,
            retry_interval: config.launch_retry_interval,
        }
    }

    fn is_alive(&self) -> bool {
        self.listener.as_ref().is_some_and(PipeListener::is_alive)
    }

    /// Make sure a listener exists. Returns `true` when it had to be created.
    async fn ensure(&mut self) -> Result<bool> {
        if self.is_alive() {
            return Ok(false);
        }
        self.listener = None;

        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match PipeListener::bind(&self.path).await {
                Ok(listener) => {
                    tracing::debug!(path = %self.path, attempts, "Endpoint created");
                    self.listener = Some(listener);
                    return Ok(true);
                }
                Err(e) => {
                    if started.elapsed() >= self.window {
                        tracing::error!(path = %self.path, attempts, error = %e, "Endpoint launch failed");
                        return Err(BridgeError::LaunchTimeout(self.window));
                    }
                    tracing::warn!(path = %self.path, error = %e, "Endpoint creation failed, retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }

    /// Wait for a connection. Resolves to `None` when the endpoint vanished
    /// while waiting.
    async fn accept(&mut self) -> Result<Option<PipeStream>> {
        let Some(listener) = self.listener.as_mut() else {
            return Ok(None);
        };

        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        liveness.tick().await;
        loop {
            tokio::select! {
                accepted = listener.accept() => return accepted.map(Some),
                _ = liveness.tick() => {
                    if !listener.is_alive() {
                        tracing::warn!(path = %self.path, "Endpoint disappeared");
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Builder for configuring and starting a watchdog.
pub struct WatchdogBuilder {
    config: WatchdogConfig,
    renderer: Option<Arc<dyn Renderer>>,
    events: broadcast::Sender<WatchdogEvent>,
}

impl WatchdogBuilder {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config: WatchdogConfig::default(),
            renderer: None,
            events,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WatchdogConfig) -> Self {
        self.config = config;
        self
    }

    /// Endpoint path. Default: [`default_endpoint_path`].
    pub fn endpoint(mut self, path: impl Into<String>) -> Self {
        self.config.endpoint = path.into();
        self
    }

    /// Default: 10 seconds.
    pub fn launch_window(mut self, window: Duration) -> Self {
        self.config.launch_window = window;
        self
    }

    /// Default: 250 ms.
    pub fn launch_retry_interval(mut self, interval: Duration) -> Self {
        self.config.launch_retry_interval = interval;
        self
    }

    /// Default: 10 seconds.
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.stall_timeout = timeout;
        self
    }

    /// Default: 50 ms.
    pub fn keepalive_grace(mut self, grace: Duration) -> Self {
        self.config.connection.keepalive_grace = grace;
        self
    }

    /// Default: 48 kHz.
    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.config.connection.sample_rate = rate;
        self
    }

    pub fn pump(mut self, pump: PumpConfig) -> Self {
        self.config.connection.pump = pump;
        self
    }

    /// Renderer used for every connection. Default: [`PassthroughRenderer`].
    pub fn renderer(mut self, renderer: impl Renderer) -> Self {
        self.renderer = Some(Arc::new(renderer));
        self
    }

    pub fn shared_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Subscribe before starting so no event is missed.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.events.subscribe()
    }

    /// Create the endpoint and start serving.
    ///
    /// Fails with `LaunchTimeout` if the endpoint cannot be created within
    /// the launch window.
    pub async fn start(self) -> Result<WatchdogHandle> {
        let renderer = self
            .renderer
            .unwrap_or_else(|| Arc::new(PassthroughRenderer::default()));
        let status = Arc::new(WatchdogStatus::default());
        let cancel = CancellationToken::new();

        let mut watchdog = Watchdog {
            endpoint: Endpoint::new(&self.config),
            handler: ConnectionHandler::new(renderer, self.config.connection),
            status: status.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
        };

        watchdog.prepare_endpoint().await?;
        status.running.store(true, Ordering::Release);

        let task = tokio::spawn(watchdog.run());

        Ok(WatchdogHandle {
            endpoint: self.config.endpoint,
            cancel,
            status,
            events: self.events,
            task,
        })
    }
}

impl Default for WatchdogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The server-side accept loop.
pub struct Watchdog {
    endpoint: Endpoint,
    handler: ConnectionHandler,
    status: Arc<WatchdogStatus>,
    events: broadcast::Sender<WatchdogEvent>,
    cancel: CancellationToken,
}

impl Watchdog {
    pub fn builder() -> WatchdogBuilder {
        WatchdogBuilder::new()
    }

    fn publish(&self, event: WatchdogEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn prepare_endpoint(&mut self) -> Result<()> {
        if self.endpoint.ensure().await? {
            tracing::info!(endpoint = %self.endpoint.path, "Endpoint ready");
            self.publish(WatchdogEvent::EndpointReady {
                endpoint: self.endpoint.path.clone(),
            });
        }
        Ok(())
    }

    async fn run(mut self) -> Result<()> {
        let result = self.serve_loop().await;

        self.status.running.store(false, Ordering::Release);
        self.status.connected.store(false, Ordering::Release);
        let reason = result.as_ref().err().map(ToString::to_string);
        match &reason {
            Some(reason) => tracing::error!(reason = %reason, "Watchdog stopped"),
            None => tracing::info!("Watchdog stopped"),
        }
        self.publish(WatchdogEvent::Stopped { reason });
        result
    }

    async fn serve_loop(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                prepared = self.prepare_endpoint() => prepared?,
            }

            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = self.endpoint.accept() => accepted,
            };

            let stream = match accepted {
                Ok(Some(stream)) => stream,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed, recreating endpoint");
                    self.endpoint.listener = None;
                    continue;
                }
            };

            let id = self.status.connections.fetch_add(1, Ordering::AcqRel) + 1;
            self.status.connected.store(true, Ordering::Release);
            tracing::info!(connection = id, "Producer connected");
            self.publish(WatchdogEvent::Connected { connection: id });

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    Err(BridgeError::Io(std::io::Error::new(
                        std::io::ErrorKind::Interrupted,
                        "watchdog stopped",
                    )))
                }
                outcome = self.serve_connection(id, stream) => outcome,
            };

            self.status.connected.store(false, Ordering::Release);
            self.finish_connection(id, outcome);
        }
    }

    async fn serve_connection(&self, id: u64, mut stream: PipeStream) -> Result<ConnectionReport> {
        let handshake = self.handler.handshake(&mut stream).await?;
        self.publish(WatchdogEvent::HandshakeAccepted {
            connection: id,
            handshake,
        });
        self.handler.serve(stream, handshake).await
    }

    fn finish_connection(&self, id: u64, outcome: Result<ConnectionReport>) {
        let result = match outcome {
            Ok(report) => {
                tracing::info!(
                    connection = id,
                    frames_in = report.frames_in,
                    frames_out = report.frames_out,
                    bytes_out = report.bytes_out,
                    keepalives = report.keepalives,
                    "Producer disconnected"
                );
                Ok(report)
            }
            Err(e) => {
                self.status.failures.fetch_add(1, Ordering::AcqRel);
                if e.is_disconnect() {
                    tracing::warn!(connection = id, error = %e, "Producer went away");
                } else {
                    tracing::error!(connection = id, error = %e, "Connection failed");
                }
                Err(e.to_string())
            }
        };
        self.publish(WatchdogEvent::Disconnected {
            connection: id,
            result,
        });
    }
}

/// Handle to a running watchdog.
pub struct WatchdogHandle {
    endpoint: String,
    cancel: CancellationToken,
    status: Arc<WatchdogStatus>,
    events: broadcast::Sender<WatchdogEvent>,
    task: JoinHandle<Result<()>>,
}

impl WatchdogHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop recreating the endpoint and close the current connection.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> &WatchdogStatus {
        &self.status
    }

    /// Wait for the watchdog loop to exit.
    pub async fn wait(self) -> Result<()> {
        self.task.await.map_err(|e| {
            BridgeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?
    }
}
