//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need a full header (8 or 9 bytes by version)
//! - `WaitingForBody`: Header parsed, need N more body bytes
//!
//! Frames carry no delimiter besides their declared lengths, so a frame is
//! only emitted once its whole body has arrived.
//!
//! # Example
//!
//! ```ignore
//! use cqlwire_client::protocol::{FrameBuffer, ProtocolVersion};
//!
//! let mut buffer = FrameBuffer::new(ProtocolVersion::V4);
//!
//! // Data arrives in chunks from socket
//! let frames = buffer.push(&chunk)?;
//!
//! for frame in frames {
//!     println!("stream {} opcode {:?}", frame.stream_id(), frame.opcode());
//! }
//! ```

use bytes::BytesMut;

use super::wire_format::{Header, ProtocolVersion, DEFAULT_MAX_FRAME_LENGTH};
use super::Frame;
use crate::error::{Result, WireError};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header.
    WaitingForHeader,
    /// Header parsed, waiting for body bytes.
    WaitingForBody { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// All data is stored in a single `BytesMut` buffer to minimize allocations.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Version whose header layout is expected.
    version: ProtocolVersion,
    /// Maximum allowed body length.
    max_frame_length: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max body: 256MB.
    pub fn new(version: ProtocolVersion) -> Self {
        Self::with_max_frame_length(version, DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Create a new frame buffer with custom max body length.
    pub fn with_max_frame_length(version: ProtocolVersion, max_frame_length: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            version,
            max_frame_length,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns the complete frames in arrival order (may be empty if still
    /// waiting for data). Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Fails on an unknown version byte (`MalformedHeader`), a header whose
    /// version differs from the negotiated one (`UnsupportedProtocolVersion`),
    /// or a body longer than `max_frame_length`. All of these leave the
    /// stream unrecoverable.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match &self.state {
            State::WaitingForHeader => {
                let size = self.version.header_size();
                if self.buffer.len() < size {
                    return Ok(None);
                }

                let header = Header::decode(&self.buffer[..size])?;
                if header.version != self.version {
                    // Servers answer a version they do not speak with their own.
                    return Err(WireError::UnsupportedProtocolVersion(self.version.number()));
                }
                if header.body_length > self.max_frame_length {
                    return Err(WireError::FrameTooLarge {
                        length: header.body_length,
                        max: self.max_frame_length,
                    });
                }

                let _ = self.buffer.split_to(size);
                self.state = State::WaitingForBody { header };
                self.try_extract_one()
            }

            State::WaitingForBody { header } => {
                let remaining = header.body_length as usize;
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let body = self.buffer.split_to(remaining).freeze();
                let header = *header;
                self.state = State::WaitingForHeader;
                Ok(Some(Frame::new(header, body)))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}
