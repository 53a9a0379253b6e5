//! ERROR response bodies.
//!
//! An error body is `[int] code`, `[string] message`, then extra fields whose
//! layout depends on the code.

use std::fmt;

use bytes::Bytes;

use crate::consistency::Consistency;
use crate::error::Result;
use crate::protocol::BodyReader;

/// Server error codes.
pub mod codes {
    /// Server-side failure; likely a server bug.
    pub const SERVER_ERROR: i32 = 0x0000;
    /// Protocol violation by the client.
    pub const PROTOCOL_ERROR: i32 = 0x000A;
    /// Authentication failed.
    pub const BAD_CREDENTIALS: i32 = 0x0100;
    /// Not enough live replicas.
    pub const UNAVAILABLE: i32 = 0x1000;
    /// Coordinator is overloaded.
    pub const OVERLOADED: i32 = 0x1001;
    /// Coordinator is bootstrapping.
    pub const IS_BOOTSTRAPPING: i32 = 0x1002;
    /// Truncate failed.
    pub const TRUNCATE_ERROR: i32 = 0x1003;
    /// Replica write timeout.
    pub const WRITE_TIMEOUT: i32 = 0x1100;
    /// Replica read timeout.
    pub const READ_TIMEOUT: i32 = 0x1200;
    /// Non-timeout replica read failure.
    pub const READ_FAILURE: i32 = 0x1300;
    /// User function failure.
    pub const FUNCTION_FAILURE: i32 = 0x1400;
    /// Non-timeout replica write failure.
    pub const WRITE_FAILURE: i32 = 0x1500;
    /// Query syntax error.
    pub const SYNTAX_ERROR: i32 = 0x2000;
    /// Missing permissions.
    pub const UNAUTHORIZED: i32 = 0x2100;
    /// Invalid query.
    pub const INVALID: i32 = 0x2200;
    /// Invalid configuration in a schema query.
    pub const CONFIG_ERROR: i32 = 0x2300;
    /// Keyspace or table already exists.
    pub const ALREADY_EXISTS: i32 = 0x2400;
    /// Prepared statement unknown to this node.
    pub const UNPREPARED: i32 = 0x2500;
}

/// Code-specific fields of a server error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDetails {
    /// The code carries no extra fields.
    None,
    /// Not enough replicas alive.
    Unavailable {
        /// Consistency of the query.
        consistency: Consistency,
        /// Replicas required.
        required: i32,
        /// Replicas known alive.
        alive: i32,
    },
    /// Write timed out on replicas.
    WriteTimeout {
        /// Consistency of the query.
        consistency: Consistency,
        /// Acknowledgements received.
        received: i32,
        /// Acknowledgements required.
        block_for: i32,
        /// Kind of write (SIMPLE, BATCH, ...).
        write_type: String,
    },
    /// Read timed out on replicas.
    ReadTimeout {
        /// Consistency of the query.
        consistency: Consistency,
        /// Responses received.
        received: i32,
        /// Responses required.
        block_for: i32,
        /// Whether the data replica answered.
        data_present: bool,
    },
    /// Read failed on replicas.
    ReadFailure {
        /// Consistency of the query.
        consistency: Consistency,
        /// Responses received.
        received: i32,
        /// Responses required.
        block_for: i32,
        /// Replicas that failed.
        failures: i32,
        /// Whether the data replica answered.
        data_present: bool,
    },
    /// User-defined function threw.
    FunctionFailure {
        /// Function keyspace.
        keyspace: String,
        /// Function name.
        function: String,
        /// Argument types.
        arg_types: Vec<String>,
    },
    /// Write failed on replicas.
    WriteFailure {
        /// Consistency of the query.
        consistency: Consistency,
        /// Acknowledgements received.
        received: i32,
        /// Acknowledgements required.
        block_for: i32,
        /// Replicas that failed.
        failures: i32,
        /// Kind of write.
        write_type: String,
    },
    /// Schema element already exists. `table` is empty for a keyspace.
    AlreadyExists {
        /// Keyspace.
        keyspace: String,
        /// Table.
        table: String,
    },
    /// Statement must be prepared again.
    Unprepared {
        /// Unknown prepared id.
        id: Bytes,
    },
}

/// An ERROR response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Error code (see [`codes`]).
    pub code: i32,
    /// Server message.
    pub message: String,
    /// Code-specific fields.
    pub details: ErrorDetails,
}

impl ServerError {
    /// Decode an ERROR body.
    pub fn decode(reader: &mut BodyReader) -> Result<Self> {
        let code = reader.read_i32()?;
        let message = reader.read_string()?;
        let details = match code {
            codes::UNAVAILABLE => ErrorDetails::Unavailable {
                consistency: Consistency::decode(reader)?,
                required: reader.read_i32()?,
                alive: reader.read_i32()?,
            },
            codes::WRITE_TIMEOUT => ErrorDetails::WriteTimeout {
                consistency: Consistency::decode(reader)?,
                received: reader.read_i32()?,
                block_for: reader.read_i32()?,
                write_type: reader.read_string()?,
            },
            codes::READ_TIMEOUT => ErrorDetails::ReadTimeout {
                consistency: Consistency::decode(reader)?,
                received: reader.read_i32()?,
                block_for: reader.read_i32()?,
                data_present: reader.read_u8()? != 0,
            },
            codes::READ_FAILURE => ErrorDetails::ReadFailure {
                consistency: Consistency::decode(reader)?,
                received: reader.read_i32()?,
                block_for: reader.read_i32()?,
                failures: reader.read_i32()?,
                data_present: reader.read_u8()? != 0,
            },
            codes::FUNCTION_FAILURE => ErrorDetails::FunctionFailure {
                keyspace: reader.read_string()?,
                function: reader.read_string()?,
                arg_types: reader.read_string_list()?,
            },
            codes::WRITE_FAILURE => ErrorDetails::WriteFailure {
                consistency: Consistency::decode(reader)?,
                received: reader.read_i32()?,
                block_for: reader.read_i32()?,
                failures: reader.read_i32()?,
                write_type: reader.read_string()?,
            },
            codes::ALREADY_EXISTS => ErrorDetails::AlreadyExists {
                keyspace: reader.read_string()?,
                table: reader.read_string()?,
            },
            codes::UNPREPARED => ErrorDetails::Unprepared {
                id: reader.read_short_bytes()?,
            },
            _ => ErrorDetails::None,
        };
        Ok(Self {
            code,
            message,
            details,
        })
    }

    /// True for a protocol error complaining about the requested version.
    pub fn is_unsupported_version(&self) -> bool {
        self.code == codes::PROTOCOL_ERROR
            && self.message.to_ascii_lowercase().contains("version")
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:04x}] {}", self.code, self.message)
    }
}
