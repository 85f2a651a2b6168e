//! `$ready` message builder.
//!
//! The `$ready` message is sent via stdout whenever the server has (re)created
//! its endpoint, to tell a supervising process:
//! - The endpoint path producers should connect to
//! - The protocol version
//! - The frame size ceiling
//!
//! # Example
//!
//! ```
//! use renderwire::control::build_ready_message;
//!
//! let json = build_ready_message("/tmp/renderwire.sock").unwrap();
//! assert!(json.contains("$ready"));
//! ```

use serde::Serialize;

use crate::error::Result;
use crate::protocol::MAX_CHUNK_BYTES;

/// Protocol version string.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// The `$ready` JSON-RPC notification.
#[derive(Debug, Serialize)]
pub struct ReadyMessage<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: ReadyParams<'a>,
}

/// Parameters for the `$ready` message.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyParams<'a> {
    /// Unix socket path or named pipe name.
    pub endpoint: &'a str,
    pub version: &'static str,
    pub max_chunk_bytes: usize,
    pub pid: u32,
}

impl<'a> ReadyMessage<'a> {
    pub fn new(endpoint: &'a str) -> Self {
        Self {
            jsonrpc: "2.0",
            method: "$ready",
            params: ReadyParams {
                endpoint,
                version: PROTOCOL_VERSION,
                max_chunk_bytes: MAX_CHUNK_BYTES,
                pid: std::process::id(),
            },
        }
    }
}

/// Build the `$ready` message as a single JSON line (without newline).
pub fn build_ready_message(endpoint: &str) -> Result<String> {
    Ok(serde_json::to_string(&ReadyMessage::new(endpoint))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_message_shape() {
        let json = build_ready_message("/tmp/renderwire.sock").unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "$ready");
        assert_eq!(value["params"]["endpoint"], "/tmp/renderwire.sock");
        assert_eq!(value["params"]["version"], PROTOCOL_VERSION);
        assert_eq!(value["params"]["maxChunkBytes"], MAX_CHUNK_BYTES as u64);
        assert_eq!(value["params"]["pid"], std::process::id());
    }

    #[test]
    fn test_ready_message_is_single_line() {
        let json = build_ready_message(r"\\.\pipe\renderwire").unwrap();
        assert!(!json.contains('\n'));
    }
}
