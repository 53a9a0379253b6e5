//! Error types for cqlwire-client.
//!
//! Every fallible operation returns [`WireError`]. Errors are grouped by
//! [`ErrorScope`] so that the connection owner can tell a condition that
//! poisons the socket apart from one that only concerns a single caller.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::response::ServerError;

/// Who is affected by an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// The byte stream can no longer be trusted; the connection must close
    /// and every pending caller is aborted.
    ConnectionFatal,
    /// Only the caller that triggered it is affected; the connection stays usable.
    CallerLocal,
    /// The peer broke the protocol in a way that is reported but tolerated.
    ProtocolViolation,
    /// Establishing this connection failed; other connections are unaffected.
    Establishment,
}

/// Main error type for all wire and connection operations.
#[derive(Debug, Clone, Error)]
pub enum WireError {
    /// I/O error on the socket.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Header version byte is not a known protocol version.
    #[error("malformed header: unrecognized version byte 0x{0:02x}")]
    MalformedHeader(u8),

    /// A structured field claims more bytes than the body has left.
    #[error("truncated frame: needed {needed} bytes but only {remaining} remain")]
    TruncatedFrame {
        /// Bytes the field required.
        needed: usize,
        /// Bytes left in the declared body.
        remaining: usize,
    },

    /// Opcode is unknown or not valid for an inbound frame.
    #[error("unsupported operation: opcode 0x{0:02x}")]
    UnsupportedOperation(u8),

    /// Body could not be decompressed; the stream cannot be resynchronized.
    #[error("decompression failed: {0}")]
    DecompressionError(String),

    /// Frame body is structurally invalid (unknown enum value, bad UTF-8, ...).
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Declared body length is above the configured limit.
    #[error("frame body of {length} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared body length.
        length: u32,
        /// Configured maximum.
        max: u32,
    },

    /// A local invariant was violated. Indicates a defect, not a network condition.
    #[error("driver internal error: {0}")]
    DriverInternal(String),

    /// Response received for a stream id that was never handed out.
    #[error("orphaned response for stream id {0}")]
    OrphanedResponse(i16),

    /// Every stream id on this connection is in use.
    #[error("no stream id available: {0} requests already in flight")]
    ExhaustedStreamIds(usize),

    /// Connection is draining and refuses new requests.
    #[error("connection is draining")]
    ConnectionDraining,

    /// Connection is closed (or was never ready).
    #[error("connection closed")]
    ConnectionClosed,

    /// Request was in flight when the connection failed.
    #[error("connection aborted: {0}")]
    ConnectionAborted(Arc<str>),

    /// No response arrived before the request deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Writer queue stayed full for longer than the backpressure timeout.
    #[error("backpressure timeout")]
    BackpressureTimeout,

    /// Server answered with an ERROR frame.
    #[error("server error: {0}")]
    Server(ServerError),

    /// Startup exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Authentication exchange failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Server does not speak the requested protocol version.
    #[error("protocol version {0} not supported by server")]
    UnsupportedProtocolVersion(u8),
}

impl WireError {
    /// Classify the error by who it affects.
    pub fn scope(&self) -> ErrorScope {
        match self {
            WireError::Io(_)
            | WireError::MalformedHeader(_)
            | WireError::TruncatedFrame { .. }
            | WireError::UnsupportedOperation(_)
            | WireError::DecompressionError(_)
            | WireError::InvalidFrame(_)
            | WireError::FrameTooLarge { .. }
            | WireError::DriverInternal(_)
            | WireError::ConnectionClosed
            | WireError::ConnectionAborted(_) => ErrorScope::ConnectionFatal,
            WireError::OrphanedResponse(_) => ErrorScope::ProtocolViolation,
            WireError::Config(_)
            | WireError::Handshake(_)
            | WireError::Authentication(_)
            | WireError::UnsupportedProtocolVersion(_) => ErrorScope::Establishment,
            WireError::ExhaustedStreamIds(_)
            | WireError::ConnectionDraining
            | WireError::Timeout(_)
            | WireError::BackpressureTimeout
            | WireError::Server(_) => ErrorScope::CallerLocal,
        }
    }

    /// True when the connection must be closed.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.scope() == ErrorScope::ConnectionFatal
    }

    /// Shorthand for a truncated-field error.
    #[inline]
    pub(crate) fn truncated(needed: usize, remaining: usize) -> Self {
        WireError::TruncatedFrame { needed, remaining }
    }
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        WireError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for WireError {
    fn from(err: serde_json::Error) -> Self {
        WireError::Config(err.to_string())
    }
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;
