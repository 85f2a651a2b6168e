//! Error types for renderwire.
//!
//! Every variant maps onto one failure class of the bridge. All of them are
//! fatal to the connection they occur on; only [`BridgeError::LaunchTimeout`]
//! is fatal to the server as a whole.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all renderwire operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// I/O error during pipe/socket or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (control plane only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Handshake could not be interpreted (zero update rate, unknown bit depth, ...).
    #[error("Protocol sync error: {0}")]
    ProtocolSync(String),

    /// Frame length prefix outside `0..=MAX_CHUNK_BYTES`.
    #[error("Invalid frame length: {0}")]
    InvalidFrameLength(i64),

    /// File path directive length outside `1..=65535`.
    #[error("Invalid path length: {0}")]
    InvalidPathLength(i64),

    /// File path directive is not valid UTF-8.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Peer closed the transport before a frame prefix was complete.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Peer closed the transport in the middle of a frame payload.
    #[error("Short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    /// No render server endpoint could be located.
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    /// Connecting to the endpoint took too long.
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// The server could not (re)create its endpoint.
    #[error("Endpoint launch timeout after {0:?}")]
    LaunchTimeout(Duration),

    /// Too many consecutive keepalive replies without audio.
    #[error("Renderer stalled after {replies} consecutive empty replies")]
    RenderStalled { replies: u32 },

    /// The external renderer failed.
    #[error("Render fault: {0}")]
    RenderFault(String),
}

impl BridgeError {
    /// Whether the error only ends the current connection.
    ///
    /// `LaunchTimeout` is the one error that requires an operator restart.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, BridgeError::LaunchTimeout(_))
    }

    /// Whether the error means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            BridgeError::ConnectionClosed | BridgeError::ShortRead { .. } => true,
            BridgeError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_launch_timeout_is_server_fatal() {
        assert!(!BridgeError::LaunchTimeout(Duration::from_secs(1)).is_connection_fatal());
        assert!(BridgeError::ConnectionClosed.is_connection_fatal());
        assert!(BridgeError::RenderFault("boom".into()).is_connection_fatal());
        assert!(BridgeError::RenderStalled { replies: 201 }.is_connection_fatal());
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(BridgeError::ConnectionClosed.is_disconnect());
        assert!(BridgeError::ShortRead {
            expected: 10,
            received: 3
        }
        .is_disconnect());
        let pipe = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert!(BridgeError::Io(pipe).is_disconnect());
        assert!(!BridgeError::InvalidFrameLength(-1).is_disconnect());
    }

    #[test]
    fn test_messages() {
        let err = BridgeError::ShortRead {
            expected: 4096,
            received: 12,
        };
        assert_eq!(
            err.to_string(),
            "Short read: expected 4096 bytes, received 12"
        );
        assert!(BridgeError::InvalidPathLength(65536)
            .to_string()
            .contains("65536"));
    }
}
