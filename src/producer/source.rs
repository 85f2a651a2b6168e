//! Input planning: decide whether a source is streamed or handed to the
//! renderer as a file.
//!
//! Renderer-native containers are opened by the renderer itself. TrueHD is
//! converted first when a converter is available; without one it is streamed
//! as-is and the renderer has to cope.

use std::path::{Path, PathBuf};
use std::process::Command;

use super::session::ProducerInput;
use crate::error::{BridgeError, Result};

/// Codec tag for Dolby TrueHD sources.
pub const CODEC_TRUEHD: &str = "truehd";

/// Codec tag for containers the renderer opens natively.
pub const CODEC_NATIVE: &str = "native";

/// Codec tag for plain PCM.
pub const CODEC_PCM: &str = "pcm";

/// Codec tag when nothing is known.
pub const CODEC_UNKNOWN: &str = "unknown";

/// Tells which codec a source file carries.
pub trait CodecProbe {
    fn probe(&self, path: &Path) -> Result<String>;
}

/// Turns a source into something the renderer can open directly.
pub trait FormatConverter {
    /// Convert `path` and return the converted file.
    fn convert(&self, path: &Path) -> Result<PathBuf>;
}

/// Probe by file extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionProbe;

impl CodecProbe for ExtensionProbe {
    fn probe(&self, path: &Path) -> Result<String> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let codec = match ext.as_str() {
            "thd" | "truehd" | "mlp" => CODEC_TRUEHD,
            "adm" | "bw64" | "iab" => CODEC_NATIVE,
            "wav" | "pcm" | "raw" => CODEC_PCM,
            _ => CODEC_UNKNOWN,
        };
        Ok(codec.to_string())
    }
}

/// Convert by running an external program as `<program> <input> <output>`.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    pub program: PathBuf,
    /// Extension given to the converted file, next to the input.
    pub output_extension: String,
}

impl CommandConverter {
    pub fn new(program: impl Into<PathBuf>, output_extension: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            output_extension: output_extension.into(),
        }
    }
}

impl FormatConverter for CommandConverter {
    fn convert(&self, path: &Path) -> Result<PathBuf> {
        let output = path.with_extension(&self.output_extension);
        tracing::info!(
            program = %self.program.display(),
            input = %path.display(),
            output = %output.display(),
            "Converting source"
        );

        let status = Command::new(&self.program)
            .arg(path)
            .arg(&output)
            .status()?;
        if !status.success() {
            return Err(BridgeError::Io(std::io::Error::other(format!(
                "converter {} exited with {}",
                self.program.display(),
                status
            ))));
        }
        Ok(output)
    }
}

/// How a source will be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePlan {
    /// Read the file and stream its bytes.
    Stream(PathBuf),
    /// Send the path; the renderer opens it.
    File(PathBuf),
}

impl SourcePlan {
    /// Open the plan as producer input.
    pub async fn open(self) -> Result<ProducerInput<tokio::fs::File>> {
        match self {
            SourcePlan::Stream(path) => Ok(ProducerInput::Stream(tokio::fs::File::open(path).await?)),
            SourcePlan::File(path) => Ok(ProducerInput::File(path)),
        }
    }
}

/// Decide how to send `path`.
pub fn plan_source(
    path: &Path,
    probe: &dyn CodecProbe,
    converter: Option<&dyn FormatConverter>,
) -> Result<SourcePlan> {
    let codec = probe.probe(path)?;
    tracing::debug!(path = %path.display(), codec = %codec, "Probed source");

    let plan = match codec.as_str() {
        CODEC_TRUEHD => match converter {
            Some(converter) => SourcePlan::File(converter.convert(path)?),
            None => {
                tracing::warn!(
                    path = %path.display(),
                    "No converter for TrueHD source, streaming it unconverted"
                );
                SourcePlan::Stream(path.to_path_buf())
            }
        },
        CODEC_NATIVE => SourcePlan::File(path.to_path_buf()),
        _ => SourcePlan::Stream(path.to_path_buf()),
    };
    Ok(plan)
}
