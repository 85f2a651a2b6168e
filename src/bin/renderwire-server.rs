//! Render server: owns the endpoint and renders one producer at a time.
//!
//! Each endpoint (re)creation is announced on stdout as a `$ready` JSON line;
//! logs go to stderr.
//!
//! ```text
//! renderwire-server --endpoint /tmp/renderwire.sock --sample-rate 48000
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;

use renderwire::control::announce_ready;
use renderwire::logging::init_tracing;
use renderwire::render::{PassthroughRenderer, DEFAULT_SAMPLE_RATE};
use renderwire::server::{Watchdog, WatchdogEvent};
use renderwire::transport::default_endpoint_path;

#[derive(Parser, Debug)]
#[command(
    name = "renderwire-server",
    version,
    about = "Serve render sessions to renderwire producers"
)]
struct Args {
    /// Endpoint to listen on (socket path or pipe name)
    #[arg(long, env = "RENDERWIRE_ENDPOINT", default_value_t = default_endpoint_path())]
    endpoint: String,

    /// Sample rate reported to the renderer
    #[arg(long, env = "RENDERWIRE_SAMPLE_RATE", default_value_t = DEFAULT_SAMPLE_RATE)]
    sample_rate: u32,

    /// Channel count of streamed input (defaults to the output channel count)
    #[arg(long, env = "RENDERWIRE_INPUT_CHANNELS")]
    input_channels: Option<u16>,

    /// Milliseconds without payable output before a keepalive is forced
    #[arg(long, env = "RENDERWIRE_STALL_TIMEOUT_MS", default_value_t = 10_000)]
    stall_timeout_ms: u64,

    /// Milliseconds a starved renderer waits for input before a keepalive
    #[arg(long, env = "RENDERWIRE_KEEPALIVE_GRACE_MS", default_value_t = 50)]
    keepalive_grace_ms: u64,

    /// Milliseconds allowed for (re)creating the endpoint
    #[arg(long, env = "RENDERWIRE_LAUNCH_WINDOW_MS", default_value_t = 10_000)]
    launch_window_ms: u64,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, env = "RENDERWIRE_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log);

    let renderer = match args.input_channels {
        Some(channels) => PassthroughRenderer::with_input_channels(channels),
        None => PassthroughRenderer::default(),
    };

    let builder = Watchdog::builder()
        .endpoint(args.endpoint)
        .sample_rate(args.sample_rate)
        .stall_timeout(Duration::from_millis(args.stall_timeout_ms))
        .keepalive_grace(Duration::from_millis(args.keepalive_grace_ms))
        .launch_window(Duration::from_millis(args.launch_window_ms))
        .renderer(renderer);
    let mut announcer = tokio::spawn(announce_events(builder.subscribe()));

    let handle = match builder.start().await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start render server");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping");
            handle.stop();
        }
        _ = &mut announcer => {}
    }

    match handle.wait().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Render server failed");
            ExitCode::FAILURE
        }
    }
}

/// Announce every endpoint launch until the watchdog stops.
async fn announce_events(mut events: broadcast::Receiver<WatchdogEvent>) {
    loop {
        match events.recv().await {
            Ok(WatchdogEvent::EndpointReady { endpoint }) => {
                if let Err(e) = announce_ready(&endpoint) {
                    tracing::warn!(error = %e, "Failed to announce endpoint");
                }
            }
            Ok(WatchdogEvent::Stopped { .. }) => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Event receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
