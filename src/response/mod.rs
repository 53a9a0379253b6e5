//! Typed responses and the parser that builds them from frames.
//!
//! [`parse_response`] turns one inbound [`Frame`] into one [`Response`]:
//!
//! 1. the declared body length is checked against the buffer,
//! 2. the body is decompressed when the frame says so,
//! 3. trailer fields are consumed, each gated by its flag, always in the
//!    order tracing id, warnings, custom payload,
//! 4. the rest is decoded according to the opcode.
//!
//! Nothing partially decoded is ever returned: any failure yields an error.

mod error;
mod event;
mod result;

use bytes::Bytes;
use uuid::Uuid;

use crate::compression::Compressor;
use crate::error::{Result, WireError};
use crate::protocol::{flags, BodyReader, BytesMap, Frame, Opcode};

pub use error::{codes, ErrorDetails, ServerError};
pub use event::{
    event_types, Event, SchemaChange, SchemaChangeTarget, SchemaChangeType, StatusChange,
    TopologyChange,
};
pub use result::{
    ColumnSpec, ColumnType, Prepared, PreparedMetadata, QueryResult, Rows, RowsMetadata,
};

/// Options advertised in a SUPPORTED response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Supported {
    /// Option name to accepted values, in wire order.
    pub options: Vec<(String, Vec<String>)>,
}

impl Supported {
    /// Values advertised for `key`.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Compression algorithms the server accepts.
    pub fn compression(&self) -> &[String] {
        self.get("COMPRESSION").unwrap_or(&[])
    }

    /// CQL versions the server accepts.
    pub fn cql_versions(&self) -> &[String] {
        self.get("CQL_VERSION").unwrap_or(&[])
    }
}

/// Opcode-specific part of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Server accepted STARTUP.
    Ready,
    /// Server requires authentication with the named authenticator class.
    Authenticate {
        /// Authenticator class name.
        authenticator: String,
    },
    /// Answer to OPTIONS.
    Supported(Supported),
    /// Request failed.
    Error(ServerError),
    /// Answer to QUERY, PREPARE or EXECUTE.
    Result(QueryResult),
    /// Server-pushed event.
    Event(Event),
    /// SASL challenge.
    AuthChallenge {
        /// Challenge token.
        token: Option<Bytes>,
    },
    /// Authentication finished.
    AuthSuccess {
        /// Final token, if the mechanism sends one.
        token: Option<Bytes>,
    },
}

impl ResponseBody {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseBody::Ready => "READY",
            ResponseBody::Authenticate { .. } => "AUTHENTICATE",
            ResponseBody::Supported(_) => "SUPPORTED",
            ResponseBody::Error(_) => "ERROR",
            ResponseBody::Result(_) => "RESULT",
            ResponseBody::Event(_) => "EVENT",
            ResponseBody::AuthChallenge { .. } => "AUTH_CHALLENGE",
            ResponseBody::AuthSuccess { .. } => "AUTH_SUCCESS",
        }
    }
}

/// A decoded response with its trailer fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Stream id the response arrived on.
    pub stream_id: i16,
    /// Tracing session id, when tracing was requested.
    pub trace_id: Option<Uuid>,
    /// Server warnings, in the order sent.
    pub warnings: Option<Vec<String>>,
    /// Custom payload, in the order sent.
    pub custom_payload: Option<BytesMap>,
    /// Opcode-specific payload.
    pub body: ResponseBody,
}

impl Response {
    /// Turn an ERROR body into `Err(WireError::Server)`.
    pub fn into_result(self) -> Result<Self> {
        match self.body {
            ResponseBody::Error(err) => Err(WireError::Server(err)),
            _ => Ok(self),
        }
    }
}

/// Decode one inbound frame.
///
/// `compressor` is the connection's negotiated compressor, if any.
/// `max_len` bounds the decompressed body size.
///
/// # Errors
///
/// - `TruncatedFrame` when an uncompressed body is shorter than declared, or
///   a field runs past the end of the body
/// - `DecompressionError` when the body cannot be decompressed
/// - `UnsupportedOperation` for unknown or request-only opcodes
/// - `InvalidFrame` for malformed field contents
pub fn parse_response(
    frame: &Frame,
    compressor: Option<&dyn Compressor>,
    max_len: usize,
) -> Result<Response> {
    frame.validate_body()?;
    let header = &frame.header;

    let body = if header.is_compressed() {
        let compressor = compressor.ok_or_else(|| {
            WireError::DecompressionError("compressed frame without negotiated compression".into())
        })?;
        compressor.decompress(&frame.body, max_len)?
    } else {
        frame.body.slice(..header.body_length as usize)
    };
    let mut reader = BodyReader::new(body);

    let trace_id = if header.has_flag(flags::TRACING) {
        Some(reader.read_uuid()?)
    } else {
        None
    };
    let warnings = if header.has_flag(flags::WARNING) {
        Some(reader.read_string_list()?)
    } else {
        None
    };
    let custom_payload = if header.has_flag(flags::CUSTOM_PAYLOAD) {
        Some(reader.read_bytes_map()?)
    } else {
        None
    };

    let version = header.version;
    let body = match header.opcode() {
        Some(Opcode::Ready) => ResponseBody::Ready,
        Some(Opcode::Authenticate) => ResponseBody::Authenticate {
            authenticator: reader.read_string()?,
        },
        Some(Opcode::Supported) => ResponseBody::Supported(Supported {
            options: reader.read_string_multimap()?,
        }),
        Some(Opcode::Error) => ResponseBody::Error(ServerError::decode(&mut reader)?),
        Some(Opcode::Result) => ResponseBody::Result(QueryResult::decode(&mut reader, version)?),
        Some(Opcode::Event) => ResponseBody::Event(Event::decode(&mut reader, version)?),
        Some(Opcode::AuthChallenge) => ResponseBody::AuthChallenge {
            token: reader.read_bytes()?,
        },
        Some(Opcode::AuthSuccess) => ResponseBody::AuthSuccess {
            token: reader.read_bytes()?,
        },
        _ => return Err(WireError::UnsupportedOperation(header.opcode)),
    };

    if !reader.is_exhausted() {
        tracing::trace!(
            stream_id = header.stream_id,
            kind = body.kind(),
            trailing = reader.remaining(),
            "ignoring trailing bytes in response body"
        );
    }

    Ok(Response {
        stream_id: header.stream_id,
        trace_id,
        warnings,
        custom_payload,
        body,
    })
}
