//! Frame struct with typed accessors.
//!
//! Represents one complete protocol frame: header plus body.
//! Uses `bytes::Bytes` so the body can be handed from the read buffer to the
//! response parser without copying.
//!
//! # Example
//!
//! ```
//! use cqlwire_client::protocol::{Frame, Header, Opcode, ProtocolVersion};
//! use bytes::Bytes;
//!
//! let header = Header::response(ProtocolVersion::V4, 0, 7, Opcode::Ready, 0);
//! let frame = Frame::new(header, Bytes::new());
//!
//! assert_eq!(frame.stream_id(), 7);
//! assert!(frame.body().is_empty());
//! ```

use bytes::Bytes;

use super::wire_format::{flags, Header, Opcode};
use crate::error::{Result, WireError};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Body bytes exactly as received (still compressed if the flag is set).
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame from header and body.
    pub fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Get the stream id.
    #[inline]
    pub fn stream_id(&self) -> i16 {
        self.header.stream_id
    }

    /// Get the typed opcode, if known.
    #[inline]
    pub fn opcode(&self) -> Option<Opcode> {
        self.header.opcode()
    }

    /// Get the flags byte.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    /// Check if the body is compressed.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        flags::has_flag(self.header.flags, flags::COMPRESSION)
    }

    /// Check if this is a server-pushed event.
    #[inline]
    pub fn is_event(&self) -> bool {
        self.header.is_event()
    }

    /// Check that the declared body length fits in the body buffer.
    ///
    /// Skipped for compressed frames: compression changes the relation between
    /// the declared and the physical length.
    pub fn validate_body(&self) -> Result<()> {
        let declared = self.header.body_length as usize;
        if !self.is_compressed() && declared > self.body.len() {
            return Err(WireError::truncated(declared, self.body.len()));
        }
        Ok(())
    }
}

/// Build a complete frame as a single byte vector.
///
/// Encodes header and appends body into a contiguous buffer; the writer
/// task sends header and body as separate slices instead.
///
/// # Example
///
/// ```
/// use cqlwire_client::protocol::{build_frame, Header, Opcode, ProtocolVersion};
///
/// let header = Header::request(ProtocolVersion::V4, 0, 1, Opcode::Options, 0);
/// let bytes = build_frame(&header, b"");
/// assert_eq!(bytes.len(), 9);
/// ```
pub fn build_frame(header: &Header, body: &[u8]) -> Vec<u8> {
    let encoded = header.encode();
    let mut buf = Vec::with_capacity(encoded.len() + body.len());
    buf.extend_from_slice(encoded.as_bytes());
    buf.extend_from_slice(body);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolVersion, HEADER_SIZE};

    #[test]
    fn test_frame_creation() {
        let header = Header::response(ProtocolVersion::V4, flags::TRACING, 42, Opcode::Result, 5);
        let frame = Frame::new(header, Bytes::from_static(b"hello"));

        assert_eq!(frame.stream_id(), 42);
        assert_eq!(frame.opcode(), Some(Opcode::Result));
        assert_eq!(frame.flags(), flags::TRACING);
        assert_eq!(frame.body(), b"hello");
        assert!(!frame.is_compressed());
    }

    #[test]
    fn test_validate_body_detects_short_body() {
        let header = Header::response(ProtocolVersion::V4, 0, 1, Opcode::Result, 10);
        let frame = Frame::new(header, Bytes::from_static(b"abc"));
        match frame.validate_body() {
            Err(WireError::TruncatedFrame { needed, remaining }) => {
                assert_eq!(needed, 10);
                assert_eq!(remaining, 3);
            }
            other => panic!("expected TruncatedFrame, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_body_skipped_when_compressed() {
        let header = Header::response(ProtocolVersion::V4, flags::COMPRESSION, 1, Opcode::Result, 10);
        let frame = Frame::new(header, Bytes::from_static(b"abc"));
        assert!(frame.validate_body().is_ok());
    }

    #[test]
    fn test_build_frame() {
        let header = Header::request(ProtocolVersion::V4, 0, 42, Opcode::Query, 5);
        let bytes = build_frame(&header, b"hello");

        assert_eq!(bytes.len(), HEADER_SIZE + 5);
        let parsed = Header::decode(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&bytes[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_build_frame_roundtrip() {
        use super::super::FrameBuffer;

        let header = Header::response(ProtocolVersion::V4, 0, 456, Opcode::Result, 10);
        let bytes = build_frame(&header, b"0123456789");

        let mut buffer = FrameBuffer::new(ProtocolVersion::V4);
        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id(), 456);
        assert_eq!(frames[0].body(), b"0123456789");
    }
}
