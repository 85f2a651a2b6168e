//! Built-in renderer that forwards PCM unchanged apart from channel layout.
//!
//! Input is interleaved PCM at the negotiated bit depth with
//! `input_channels` channels (the output channel count when unset). Each
//! sample frame is remapped to the output layout: shared channels are copied,
//! surplus input channels are dropped, missing ones are filled with silence.
//! Output is emitted one render block at a time; a trailing partial block is
//! padded with silence.

use std::io::{self, Read, Write};

use super::{RenderJob, RenderReport, RenderSource, Renderer};

#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRenderer {
    /// Channel count of the incoming PCM. `None` means same as output.
    pub input_channels: Option<u16>,
}

impl PassthroughRenderer {
    pub fn with_input_channels(channels: u16) -> Self {
        Self {
            input_channels: Some(channels),
        }
    }
}

/// Fill `buf` as far as the source allows. Returns the bytes read.
fn read_block<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Renderer for PassthroughRenderer {
    fn render(&self, job: RenderJob) -> io::Result<RenderReport> {
        let RenderJob {
            format,
            source,
            mut output,
        } = job;

        let sample_bytes = format.bit_depth.bytes_per_sample();
        let out_channels = format.output_channels as usize;
        let in_channels = self.input_channels.unwrap_or(format.output_channels) as usize;
        if in_channels == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "input channel count must be non-zero",
            ));
        }

        let in_frame = in_channels * sample_bytes;
        let out_frame = out_channels * sample_bytes;
        let block = (format.block_size as usize).max(1);
        let silence = format.bit_depth.silence_byte();

        let mut reader: Box<dyn Read + Send> = match source {
            RenderSource::Stream(reader) => Box::new(reader),
            RenderSource::File(file) => Box::new(io::BufReader::new(file)),
        };

        let mut in_buf = vec![0u8; in_frame * block];
        let mut out_buf = vec![silence; out_frame * block];
        let shared = in_channels.min(out_channels) * sample_bytes;

        let mut input_frames = 0u64;
        let mut samples_rendered = 0u64;
        let mut carry = 0usize;

        loop {
            let n = read_block(&mut reader, &mut in_buf[carry..])?;
            let available = carry + n;
            let frames = available / in_frame;

            if n > 0 && frames < block {
                // Keep filling the block until the source ends.
                carry = available;
                continue;
            }

            if frames == 0 {
                if available > 0 {
                    tracing::warn!(
                        bytes = available,
                        "Dropping trailing partial sample frame"
                    );
                }
                break;
            }

            out_buf.fill(silence);
            for f in 0..frames {
                let src = &in_buf[f * in_frame..f * in_frame + shared];
                out_buf[f * out_frame..f * out_frame + shared].copy_from_slice(src);
            }
            output.write_all(&out_buf)?;

            input_frames += frames as u64;
            samples_rendered += block as u64;

            let leftover = available - frames * in_frame;
            in_buf.copy_within(frames * in_frame..available, 0);
            carry = leftover;

            if frames < block {
                // Padded final block.
                if carry > 0 {
                    tracing::warn!(bytes = carry, "Dropping trailing partial sample frame");
                }
                break;
            }
        }

        output.flush()?;
        Ok(RenderReport {
            samples_rendered,
            total_samples: Some(input_frames),
        })
    }
}
