//! Producer role - connects to a render server, sends audio and forwards
//! the rendered output.
//!
//! # Example
//!
//! ```ignore
//! use renderwire::producer::{run, ProducerConfig, ProducerInput};
//!
//! let mut stdout = tokio::io::stdout();
//! let stats = run(
//!     ProducerConfig::default(),
//!     ProducerInput::Stream(tokio::io::stdin()),
//!     &mut stdout,
//! )
//! .await?;
//! ```

mod config;
mod session;
mod source;

pub use config::{
    ProducerConfig, DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_INITIAL_BURST, DEFAULT_MANDATORY_FRAMES, DEFAULT_MAX_IDLE_REPLIES,
    DEFAULT_OUTPUT_CHANNELS,
};
pub use session::{run, ProducerInput, ProducerSession, ProducerState, RunError, RunStats};
pub use source::{
    plan_source, CodecProbe, CommandConverter, ExtensionProbe, FormatConverter, SourcePlan,
    CODEC_NATIVE, CODEC_PCM, CODEC_TRUEHD, CODEC_UNKNOWN,
};
