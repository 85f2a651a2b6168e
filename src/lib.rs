//! # renderwire
//!
//! Lockstep IPC bridge between a streaming audio producer and an
//! out-of-process spatial renderer.
//!
//! ## Architecture
//!
//! - **Producer** (client role): streams encoded audio in length-prefixed
//!   frames and forwards the rendered PCM it gets back.
//! - **Server** (render side): a watchdog that owns the endpoint, one
//!   connection at a time, and a render session around the engine.
//! - **Data plane**: Unix socket or Windows named pipe, 8-byte handshake,
//!   then `[u32 LE length][payload]` frames. A zero-length frame ends a
//!   stream, or acts as a keepalive in the streaming reply direction.
//! - **Control plane** (stdout): one JSON `$ready` line per endpoint launch.
//!
//! ## Example
//!
//! ```ignore
//! use renderwire::server::Watchdog;
//! use renderwire::render::PassthroughRenderer;
//!
//! #[tokio::main]
//! async fn main() -> renderwire::Result<()> {
//!     let handle = Watchdog::builder()
//!         .renderer(PassthroughRenderer::default())
//!         .start()
//!         .await?;
//!     handle.wait().await
//! }
//! ```

pub mod control;
pub mod error;
pub mod logging;
pub mod producer;
pub mod protocol;
pub mod render;
pub mod server;
pub mod transport;

pub use error::{BridgeError, Result};
pub use producer::{ProducerConfig, ProducerInput, ProducerSession, RunError, RunStats};
pub use protocol::{BitDepth, Frame, Handshake, Mode};
pub use render::{PassthroughRenderer, RenderJob, RenderReport, Renderer};
pub use server::{Watchdog, WatchdogBuilder, WatchdogEvent, WatchdogHandle};
