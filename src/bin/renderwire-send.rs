//! Producer: sends audio to a render server and writes the rendered PCM out.
//!
//! ```text
//! decoder | renderwire-send --channels 2 > rendered.pcm
//! renderwire-send --input movie.thd --converter thd2adm --output out.pcm
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncRead, AsyncWrite};

use renderwire::logging::init_tracing;
use renderwire::producer::{
    plan_source, run, CommandConverter, ExtensionProbe, FormatConverter, ProducerConfig,
    ProducerInput, DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_INITIAL_BURST,
    DEFAULT_MANDATORY_FRAMES, DEFAULT_MAX_IDLE_REPLIES, DEFAULT_OUTPUT_CHANNELS,
};
use renderwire::protocol::BitDepth;
use renderwire::{BridgeError, Result};

#[derive(Parser, Debug)]
#[command(
    name = "renderwire-send",
    version,
    about = "Send audio to a renderwire server and write the rendered output"
)]
struct Args {
    /// Server endpoint (discovered when omitted)
    #[arg(long, env = "RENDERWIRE_ENDPOINT")]
    endpoint: Option<String>,

    /// Source file (stdin when omitted)
    #[arg(long, short = 'i', env = "RENDERWIRE_INPUT", value_name = "PATH")]
    input: Option<PathBuf>,

    /// Destination file (stdout when omitted)
    #[arg(long, short = 'o', env = "RENDERWIRE_OUTPUT", value_name = "PATH")]
    output: Option<PathBuf>,

    /// Program run as `<program> <input> <output>` to convert TrueHD sources
    #[arg(long, env = "RENDERWIRE_CONVERTER", value_name = "PROGRAM")]
    converter: Option<PathBuf>,

    /// Extension of converted files
    #[arg(long, env = "RENDERWIRE_CONVERTED_EXTENSION", default_value = "adm")]
    converted_extension: String,

    /// Output bit depth (8, 16, 24 or 32)
    #[arg(long, env = "RENDERWIRE_BIT_DEPTH", default_value_t = 16)]
    bit_depth: u8,

    /// Output channel count
    #[arg(long, env = "RENDERWIRE_CHANNELS", default_value_t = DEFAULT_OUTPUT_CHANNELS)]
    channels: u16,

    /// Render blocks per reply
    #[arg(long, env = "RENDERWIRE_MANDATORY_FRAMES", default_value_t = DEFAULT_MANDATORY_FRAMES)]
    mandatory_frames: u8,

    /// Samples per render block
    #[arg(long, env = "RENDERWIRE_BLOCK_SIZE", default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// Bytes per streamed chunk
    #[arg(long, env = "RENDERWIRE_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Chunks sent before the first reply is awaited
    #[arg(long, env = "RENDERWIRE_INITIAL_BURST", default_value_t = DEFAULT_INITIAL_BURST)]
    initial_burst: u32,

    /// Consecutive keepalives tolerated before giving up
    #[arg(long, env = "RENDERWIRE_MAX_IDLE_REPLIES", default_value_t = DEFAULT_MAX_IDLE_REPLIES)]
    max_idle_replies: u32,

    /// Connect timeout in milliseconds
    #[arg(long, env = "RENDERWIRE_CONNECT_TIMEOUT_MS", default_value_t = 5_000)]
    connect_timeout_ms: u64,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, env = "RENDERWIRE_LOG", default_value = "warn")]
    log: String,
}

type Source = Box<dyn AsyncRead + Unpin + Send>;
type Sink = Box<dyn AsyncWrite + Unpin + Send>;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log);

    match send(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Send failed");
            ExitCode::FAILURE
        }
    }
}

async fn send(args: Args) -> Result<()> {
    let bit_depth = BitDepth::from_bits(args.bit_depth).ok_or_else(|| {
        BridgeError::ProtocolSync(format!("unsupported bit depth {}", args.bit_depth))
    })?;

    let config = ProducerConfig {
        endpoint: args.endpoint.clone(),
        connect_timeout: Duration::from_millis(args.connect_timeout_ms),
        initial_burst: args.initial_burst,
        max_idle_replies: args.max_idle_replies,
        chunk_size: args.chunk_size,
        bit_depth,
        mandatory_frames: args.mandatory_frames,
        output_channels: args.channels,
        block_size: args.block_size,
    };

    let input = open_input(&args).await?;
    let mut sink: Sink = match &args.output {
        Some(path) => Box::new(tokio::fs::File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };

    let stats = run(config, input, &mut sink).await.map_err(|e| {
        tracing::warn!(
            chunks_in = e.stats.chunks_in,
            bytes_in = e.stats.bytes_in,
            chunks_out = e.stats.chunks_out,
            bytes_out = e.stats.bytes_out,
            keepalives = e.stats.keepalives,
            "Run aborted"
        );
        e.error
    })?;
    tracing::info!(
        chunks_in = stats.chunks_in,
        bytes_out = stats.bytes_out,
        keepalives = stats.keepalives,
        "Done"
    );
    Ok(())
}

async fn open_input(args: &Args) -> Result<ProducerInput<Source>> {
    let Some(path) = &args.input else {
        return Ok(ProducerInput::Stream(Box::new(tokio::io::stdin())));
    };

    let converter = args
        .converter
        .as_ref()
        .map(|program| CommandConverter::new(program, args.converted_extension.as_str()));
    let plan = plan_source(
        path,
        &ExtensionProbe,
        converter.as_ref().map(|c| c as &dyn FormatConverter),
    )?;

    Ok(match plan.open().await? {
        ProducerInput::Stream(file) => ProducerInput::Stream(Box::new(file)),
        ProducerInput::File(path) => ProducerInput::File(path),
    })
}
