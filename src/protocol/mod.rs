//! Protocol module - handshake, wire format, and framing.
//!
//! This module implements the binary protocol spoken on the transport:
//! - 8-byte handshake that fixes sample format and mode
//! - 4-byte little-endian length-prefixed frames
//! - File path directive for file mode
//! - Frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod handshake;
mod wire_format;

pub use frame::{
    build_frame, read_frame, read_frame_or_eof, read_path_directive, write_end_of_stream,
    write_frame, write_path_directive, Frame,
};
pub(crate) use frame::read_full;
pub use frame_buffer::FrameBuffer;
pub use handshake::{read_handshake, write_handshake, BitDepth, Handshake, Mode};
pub use wire_format::{
    decode_length, encode_length, validate_frame_length, validate_path_length, HANDSHAKE_SIZE,
    LENGTH_PREFIX_SIZE, MAX_CHUNK_BYTES, MAX_PATH_BYTES,
};
