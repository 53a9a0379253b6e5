//! Wire format encoding and decoding.
//!
//! Implements the frame header of native protocol versions 1 through 4:
//! ```text
//! V3/V4 (9 bytes)
//! ┌─────────┬───────┬───────────┬────────┬────────────┐
//! │ Version │ Flags │ Stream    │ Opcode │ Length     │
//! │ 1 byte  │ 1 byte│ int16 BE  │ 1 byte │ uint32 BE  │
//! └─────────┴───────┴───────────┴────────┴────────────┘
//!
//! V1/V2 (8 bytes): same layout with a single-byte signed stream id.
//! ```
//!
//! The high bit of the version byte is the direction: 0 = request, 1 = response.
//! All multi-byte integers are Big Endian.

use crate::error::{Result, WireError};

/// Header size for protocol versions 3 and up.
pub const HEADER_SIZE: usize = 9;

/// Header size for protocol versions 1 and 2.
pub const LEGACY_HEADER_SIZE: usize = 8;

/// Default maximum body length (256 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: u32 = 256 * 1024 * 1024;

/// Stream id used by the server for pushed events.
pub const EVENT_STREAM_ID: i16 = -1;

/// Direction bit in the version byte.
const RESPONSE_BIT: u8 = 0x80;

/// Flag constants for the protocol.
pub mod flags {
    /// Body is compressed with the negotiated algorithm.
    pub const COMPRESSION: u8 = 0b0000_0001;
    /// Request tracing; on responses the body starts with the trace id.
    pub const TRACING: u8 = 0b0000_0010;
    /// A custom payload map precedes the body.
    pub const CUSTOM_PAYLOAD: u8 = 0b0000_0100;
    /// Server warnings precede the body.
    pub const WARNING: u8 = 0b0000_1000;
    /// Request uses a beta protocol version.
    pub const USE_BETA: u8 = 0b0001_0000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Native protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    /// Version 1.
    V1 = 1,
    /// Version 2.
    V2 = 2,
    /// Version 3.
    V3 = 3,
    /// Version 4.
    V4 = 4,
}

impl ProtocolVersion {
    /// Highest version this crate speaks.
    pub const LATEST: ProtocolVersion = ProtocolVersion::V4;

    /// Parse a version number (direction bit already stripped).
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            4 => Some(Self::V4),
            _ => None,
        }
    }

    /// Numeric version.
    #[inline]
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Header length in bytes for this version.
    #[inline]
    pub fn header_size(self) -> usize {
        if self.uses_short_stream_ids() {
            HEADER_SIZE
        } else {
            LEGACY_HEADER_SIZE
        }
    }

    /// Number of non-negative stream ids usable by requests.
    #[inline]
    pub fn max_stream_ids(self) -> usize {
        if self.uses_short_stream_ids() {
            32_768
        } else {
            128
        }
    }

    /// V3+ widened the stream id from one to two bytes.
    #[inline]
    pub fn uses_short_stream_ids(self) -> bool {
        self >= Self::V3
    }

    /// Next version down, used when the server rejects this one.
    pub fn downgrade(self) -> Option<Self> {
        Self::from_number(self.number() - 1)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.number())
    }
}

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Server error.
    Error = 0x00,
    /// Connection initialization.
    Startup = 0x01,
    /// Server is ready for queries.
    Ready = 0x02,
    /// Server requires authentication.
    Authenticate = 0x03,
    /// Ask for supported options.
    Options = 0x05,
    /// Supported options.
    Supported = 0x06,
    /// Execute a query string.
    Query = 0x07,
    /// Result of a query, prepare or execute.
    Result = 0x08,
    /// Prepare a statement.
    Prepare = 0x09,
    /// Execute a prepared statement.
    Execute = 0x0A,
    /// Subscribe to server events.
    Register = 0x0B,
    /// Server-pushed event.
    Event = 0x0C,
    /// Batch of statements.
    Batch = 0x0D,
    /// SASL challenge from the server.
    AuthChallenge = 0x0E,
    /// SASL response from the client.
    AuthResponse = 0x0F,
    /// Authentication completed.
    AuthSuccess = 0x10,
}

impl Opcode {
    /// Look up an opcode by its wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        let op = match b {
            0x00 => Self::Error,
            0x01 => Self::Startup,
            0x02 => Self::Ready,
            0x03 => Self::Authenticate,
            0x05 => Self::Options,
            0x06 => Self::Supported,
            0x07 => Self::Query,
            0x08 => Self::Result,
            0x09 => Self::Prepare,
            0x0A => Self::Execute,
            0x0B => Self::Register,
            0x0C => Self::Event,
            0x0D => Self::Batch,
            0x0E => Self::AuthChallenge,
            0x0F => Self::AuthResponse,
            0x10 => Self::AuthSuccess,
            _ => return None,
        };
        Some(op)
    }

    /// Wire byte.
    #[inline]
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Encoded header bytes; 8 or 9 of them are meaningful depending on version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedHeader {
    buf: [u8; HEADER_SIZE],
    len: u8,
}

impl EncodedHeader {
    /// The meaningful header bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    /// Number of meaningful bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Always false; a header is never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for EncodedHeader {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version.
    pub version: ProtocolVersion,
    /// Direction bit: true for server-to-client frames.
    pub is_response: bool,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Stream id correlating request and response.
    pub stream_id: i16,
    /// Raw opcode byte; see [`Opcode::from_byte`].
    pub opcode: u8,
    /// Body length in bytes (before decompression).
    pub body_length: u32,
}

impl Header {
    /// Create a request header.
    pub fn request(
        version: ProtocolVersion,
        flags: u8,
        stream_id: i16,
        opcode: Opcode,
        body_length: u32,
    ) -> Self {
        Self {
            version,
            is_response: false,
            flags,
            stream_id,
            opcode: opcode.byte(),
            body_length,
        }
    }

    /// Create a response header.
    pub fn response(
        version: ProtocolVersion,
        flags: u8,
        stream_id: i16,
        opcode: Opcode,
        body_length: u32,
    ) -> Self {
        Self {
            is_response: true,
            ..Self::request(version, flags, stream_id, opcode, body_length)
        }
    }

    /// Size of this header on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.version.header_size()
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use cqlwire_client::protocol::{Header, Opcode, ProtocolVersion};
    ///
    /// let header = Header::request(ProtocolVersion::V4, 0, 42, Opcode::Query, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 9);
    /// assert_eq!(bytes.as_bytes()[0], 0x04);
    /// ```
    pub fn encode(&self) -> EncodedHeader {
        let mut buf = [0u8; HEADER_SIZE];
        let len = self.encode_into(&mut buf);
        EncodedHeader {
            buf,
            len: len as u8,
        }
    }

    /// Encode header into an existing buffer, returning the bytes written.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than the version's header size.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        debug_assert!(buf.len() >= self.size());
        let direction = if self.is_response { RESPONSE_BIT } else { 0 };
        buf[0] = direction | self.version.number();
        buf[1] = self.flags;
        let mut pos = 2;
        if self.version.uses_short_stream_ids() {
            buf[pos..pos + 2].copy_from_slice(&self.stream_id.to_be_bytes());
            pos += 2;
        } else {
            debug_assert!(i8::try_from(self.stream_id).is_ok());
            buf[pos] = self.stream_id as i8 as u8;
            pos += 1;
        }
        buf[pos] = self.opcode;
        pos += 1;
        buf[pos..pos + 4].copy_from_slice(&self.body_length.to_be_bytes());
        pos + 4
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use cqlwire_client::protocol::{Header, Opcode};
    ///
    /// let bytes = [0x84, 0x00, 0x00, 0x2a, 0x08, 0, 0, 0, 4];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert!(header.is_response);
    /// assert_eq!(header.stream_id, 42);
    /// assert_eq!(header.opcode(), Some(Opcode::Result));
    /// assert_eq!(header.body_length, 4);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let first = *buf.first().ok_or(WireError::truncated(1, 0))?;
        let version = ProtocolVersion::from_number(first & !RESPONSE_BIT)
            .ok_or(WireError::MalformedHeader(first))?;
        let size = version.header_size();
        if buf.len() < size {
            return Err(WireError::truncated(size, buf.len()));
        }

        let (stream_id, pos) = if version.uses_short_stream_ids() {
            (i16::from_be_bytes([buf[2], buf[3]]), 4)
        } else {
            (i16::from(buf[2] as i8), 3)
        };

        Ok(Self {
            version,
            is_response: first & RESPONSE_BIT != 0,
            flags: buf[1],
            stream_id,
            opcode: buf[pos],
            body_length: u32::from_be_bytes([
                buf[pos + 1],
                buf[pos + 2],
                buf[pos + 3],
                buf[pos + 4],
            ]),
        })
    }

    /// Typed opcode, if known.
    #[inline]
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_byte(self.opcode)
    }

    /// Check if a flag is set.
    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        flags::has_flag(self.flags, flag)
    }

    /// Check if the body is compressed.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.has_flag(flags::COMPRESSION)
    }

    /// Check if this is a server-pushed event.
    #[inline]
    pub fn is_event(&self) -> bool {
        self.stream_id == EVENT_STREAM_ID && self.opcode == Opcode::Event.byte()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        for version in [
            ProtocolVersion::V1,
            ProtocolVersion::V2,
            ProtocolVersion::V3,
            ProtocolVersion::V4,
        ] {
            for stream_id in [0i16, 1, 100, 127, -1] {
                let original = Header::response(
                    version,
                    flags::TRACING | flags::WARNING,
                    stream_id,
                    Opcode::Result,
                    1234,
                );
                let encoded = original.encode();
                assert_eq!(encoded.len(), version.header_size());
                let decoded = Header::decode(encoded.as_bytes()).unwrap();
                assert_eq!(original, decoded);
            }
        }
    }

    #[test]
    fn test_wide_stream_ids_roundtrip_on_v4() {
        for stream_id in [128i16, 255, 1000, 32_767] {
            let original = Header::request(ProtocolVersion::V4, 0, stream_id, Opcode::Query, 0);
            let decoded = Header::decode(original.encode().as_bytes()).unwrap();
            assert_eq!(decoded.stream_id, stream_id);
        }
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::request(
            ProtocolVersion::V4,
            flags::COMPRESSION,
            0x0102,
            Opcode::Query,
            0x0A0B_0C0D,
        );
        let bytes = header.encode();
        assert_eq!(
            bytes.as_bytes(),
            &[0x04, 0x01, 0x01, 0x02, 0x07, 0x0A, 0x0B, 0x0C, 0x0D]
        );
    }

    #[test]
    fn test_legacy_header_layout() {
        let header = Header::response(ProtocolVersion::V2, 0, -1, Opcode::Event, 3);
        let bytes = header.encode();
        assert_eq!(bytes.as_bytes(), &[0x82, 0x00, 0xFF, 0x0C, 0, 0, 0, 3]);
    }

    #[test]
    fn test_unknown_version_is_malformed() {
        let bytes = [0x85, 0, 0, 1, 0x08, 0, 0, 0, 0];
        match Header::decode(&bytes) {
            Err(WireError::MalformedHeader(b)) => assert_eq!(b, 0x85),
            other => panic!("expected MalformedHeader, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0x84u8, 0, 0, 1, 0x08, 0, 0, 0];
        assert!(matches!(
            Header::decode(&buf),
            Err(WireError::TruncatedFrame { needed: 9, remaining: 8 })
        ));
    }

    #[test]
    fn test_flag_values() {
        assert_eq!(flags::COMPRESSION, 0x01);
        assert_eq!(flags::TRACING, 0x02);
        assert_eq!(flags::CUSTOM_PAYLOAD, 0x04);
        assert_eq!(flags::WARNING, 0x08);
        assert_eq!(flags::USE_BETA, 0x10);
        assert!(flags::has_flag(0x0A, flags::WARNING));
        assert!(!flags::has_flag(0x0A, flags::CUSTOM_PAYLOAD));
    }

    #[test]
    fn test_opcode_lookup() {
        for b in 0u8..=0x10 {
            match Opcode::from_byte(b) {
                Some(op) => assert_eq!(op.byte(), b),
                None => assert_eq!(b, 0x04),
            }
        }
        assert!(Opcode::from_byte(0x11).is_none());
    }

    #[test]
    fn test_version_properties() {
        assert_eq!(ProtocolVersion::V2.max_stream_ids(), 128);
        assert_eq!(ProtocolVersion::V3.max_stream_ids(), 32_768);
        assert_eq!(ProtocolVersion::V4.downgrade(), Some(ProtocolVersion::V3));
        assert_eq!(ProtocolVersion::V1.downgrade(), None);
        assert_eq!(ProtocolVersion::V4.to_string(), "v4");
    }

    #[test]
    fn test_event_detection() {
        let event = Header::response(ProtocolVersion::V4, 0, EVENT_STREAM_ID, Opcode::Event, 0);
        assert!(event.is_event());
        let result = Header::response(ProtocolVersion::V4, 0, EVENT_STREAM_ID, Opcode::Result, 0);
        assert!(!result.is_event());
    }
}
