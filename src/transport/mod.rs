//! Transport module - platform-specific pipe/socket handling.
//!
//! Provides abstraction over:
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)
//!
//! plus endpoint naming and discovery for the producer side.

mod pipe;

pub use pipe::{
    connect_endpoint, default_endpoint_path, discover_endpoint, generate_endpoint_path,
    PipeListener, PipeStream, ENDPOINT_PREFIX,
};
