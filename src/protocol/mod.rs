//! Protocol module - wire format, framing, and body primitives.
//!
//! This module implements the binary frame layer:
//! - 8/9-byte header encoding/decoding per protocol version
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - Bounded body reader and body writer for protocol primitives

mod body;
mod frame;
mod frame_buffer;
mod wire_format;

pub use body::{uuid_from_wire, uuid_to_wire, BodyReader, BodyWriter, BytesMap, UUID_SIZE};
pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    flags, EncodedHeader, Header, Opcode, ProtocolVersion,
    DEFAULT_MAX_FRAME_LENGTH, EVENT_STREAM_ID, HEADER_SIZE, LEGACY_HEADER_SIZE,
};
