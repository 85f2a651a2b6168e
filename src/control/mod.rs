//! Control plane module - `$ready` announcement over stdout.
//!
//! The server binary reports each endpoint (re)creation as one JSON line on
//! stdout so a supervising process knows where producers can connect. All
//! audio traffic happens on the data plane (pipe).
//!
//! # Example
//!
//! ```ignore
//! use renderwire::control::announce_ready;
//!
//! announce_ready("/tmp/renderwire.sock")?;
//! ```

mod announce;
mod stdio;

pub use announce::{build_ready_message, ReadyMessage, ReadyParams, PROTOCOL_VERSION};
pub use stdio::{write_json_line, write_line, write_stdout_json};

/// Build and write the `$ready` line for `endpoint`.
pub fn announce_ready(endpoint: &str) -> crate::error::Result<()> {
    write_stdout_json(&ReadyMessage::new(endpoint))
}
