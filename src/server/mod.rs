//! Server role - watchdog, per-connection handler, and output pump.
//!
//! # Example
//!
//! ```ignore
//! use renderwire::server::Watchdog;
//!
//! let handle = Watchdog::builder().start().await?;
//! let mut events = handle.subscribe();
//! while let Ok(event) = events.recv().await {
//!     tracing::info!(?event, "watchdog");
//! }
//! ```

mod connection;
mod pump;
mod watchdog;

pub use connection::{
    ConnectionConfig, ConnectionHandler, ConnectionReport, DEFAULT_KEEPALIVE_GRACE,
    DEFAULT_STALL_TIMEOUT,
};
pub use pump::{OutputPump, PumpConfig, PumpReport, DEFAULT_MAX_SLICE, DEFAULT_YIELD_INTERVAL};
pub use watchdog::{
    Watchdog, WatchdogBuilder, WatchdogConfig, WatchdogEvent, WatchdogHandle, WatchdogStatus,
    DEFAULT_LAUNCH_RETRY_INTERVAL, DEFAULT_LAUNCH_WINDOW,
};
