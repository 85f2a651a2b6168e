//! Frame type and the async read/write primitives shared by both peers.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use renderwire::protocol::{build_frame, Frame};
//!
//! let bytes = build_frame(b"pcm");
//! assert_eq!(bytes.len(), 4 + 3);
//! assert!(Frame::EndOfStream.is_end_of_stream());
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire_format::{
    decode_length, encode_length, validate_frame_length, validate_path_length, LENGTH_PREFIX_SIZE,
    MAX_CHUNK_BYTES, MAX_PATH_BYTES,
};
use crate::error::{BridgeError, Result};

/// A complete frame read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A non-empty payload.
    Data(Bytes),
    /// The zero-length sentinel.
    EndOfStream,
}

impl Frame {
    /// Check if this is the zero-length sentinel.
    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Frame::EndOfStream)
    }

    /// Get a reference to the payload bytes (empty for the sentinel).
    #[inline]
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Data(bytes) => bytes,
            Frame::EndOfStream => &[],
        }
    }

    /// Get the payload length.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a complete frame as a single byte vector.
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&encode_length(payload.len()));
    buf.extend_from_slice(payload);
    buf
}

/// Read until `buf` is full or the source reaches EOF.
///
/// Returns the number of bytes read; less than `buf.len()` only at EOF.
pub(crate) async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read one frame, treating a clean close on a frame boundary as `None`.
///
/// A close after a partial length prefix is `ConnectionClosed`; a close
/// inside the payload is `ShortRead`.
pub async fn read_frame_or_eof<R>(reader: &mut R, max_len: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    match read_full(reader, &mut prefix).await? {
        0 => return Ok(None),
        LENGTH_PREFIX_SIZE => {}
        _ => return Err(BridgeError::ConnectionClosed),
    }

    let length = validate_frame_length(decode_length(prefix), max_len)?;
    if length == 0 {
        return Ok(Some(Frame::EndOfStream));
    }

    let mut payload = vec![0u8; length];
    let received = read_full(reader, &mut payload).await?;
    if received < length {
        return Err(BridgeError::ShortRead {
            expected: length,
            received,
        });
    }
    Ok(Some(Frame::Data(Bytes::from(payload))))
}

/// Read exactly one frame.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    read_frame_or_eof(reader, max_len)
        .await?
        .ok_or(BridgeError::ConnectionClosed)
}

/// Write one frame and flush.
///
/// Prefix and payload go out in a single vectored write where the transport
/// allows it. The flush is unconditional: a downstream OS pipe only sees the
/// data once flushed.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_CHUNK_BYTES {
        return Err(BridgeError::InvalidFrameLength(payload.len() as i64));
    }
    let prefix = encode_length(payload.len());
    write_prefixed(writer, &prefix, payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write the zero-length end-of-stream sentinel and flush.
pub async fn write_end_of_stream<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &[]).await
}

/// Write the file-mode path directive and flush.
pub async fn write_path_directive<W>(writer: &mut W, path: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = path.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_PATH_BYTES {
        return Err(BridgeError::InvalidPathLength(bytes.len() as i64));
    }
    write_prefixed(writer, &encode_length(bytes.len()), bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the file-mode path directive.
pub async fn read_path_directive<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    if read_full(reader, &mut prefix).await? < LENGTH_PREFIX_SIZE {
        return Err(BridgeError::ConnectionClosed);
    }
    let length = validate_path_length(decode_length(prefix))?;

    let mut raw = vec![0u8; length];
    let received = read_full(reader, &mut raw).await?;
    if received < length {
        return Err(BridgeError::ShortRead {
            expected: length,
            received,
        });
    }
    String::from_utf8(raw).map_err(|e| BridgeError::InvalidPath(e.to_string()))
}

/// Write prefix + payload with `write_vectored`, continuing after partial writes.
async fn write_prefixed<W>(writer: &mut W, prefix: &[u8], payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total = prefix.len() + payload.len();
    let mut written = 0;

    while written < total {
        let n = if written < prefix.len() {
            let slices = [IoSlice::new(&prefix[written..]), IoSlice::new(payload)];
            writer.write_vectored(&slices).await?
        } else {
            writer.write(&payload[written - prefix.len()..]).await?
        };

        if n == 0 {
            return Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "transport accepted zero bytes",
            )));
        }
        written += n;
    }
    Ok(())
}
