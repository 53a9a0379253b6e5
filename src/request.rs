//! Outbound request bodies.
//!
//! Statement construction (bound values, batches) belongs to higher layers;
//! [`Request::Raw`] carries any body encoded elsewhere.

use bytes::Bytes;

use crate::consistency::Consistency;
use crate::protocol::{BodyWriter, Opcode, ProtocolVersion};

/// STARTUP option keys.
pub mod startup_keys {
    /// CQL version the client speaks.
    pub const CQL_VERSION: &str = "CQL_VERSION";
    /// Negotiated compression algorithm.
    pub const COMPRESSION: &str = "COMPRESSION";
}

mod query_flags {
    pub const SKIP_METADATA: u8 = 0x02;
    pub const PAGE_SIZE: u8 = 0x04;
    pub const PAGING_STATE: u8 = 0x08;
    pub const SERIAL_CONSISTENCY: u8 = 0x10;
    pub const DEFAULT_TIMESTAMP: u8 = 0x20;
}

/// Parameters shared by QUERY and EXECUTE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParameters {
    /// Consistency level.
    pub consistency: Consistency,
    /// Ask the server to omit result metadata.
    pub skip_metadata: bool,
    /// Page size in rows.
    pub page_size: Option<i32>,
    /// Paging state returned by a previous page.
    pub paging_state: Option<Bytes>,
    /// Consistency for the Paxos phase of conditional updates.
    pub serial_consistency: Option<Consistency>,
    /// Client-side timestamp in microseconds (V3+).
    pub default_timestamp: Option<i64>,
}

impl QueryParameters {
    fn encode(&self, w: &mut BodyWriter, version: ProtocolVersion) {
        self.consistency.encode(w);
        if version == ProtocolVersion::V1 {
            return;
        }

        let timestamp = self
            .default_timestamp
            .filter(|_| version >= ProtocolVersion::V3);
        let mut flags = 0u8;
        if self.skip_metadata {
            flags |= query_flags::SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= query_flags::PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= query_flags::PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= query_flags::SERIAL_CONSISTENCY;
        }
        if timestamp.is_some() {
            flags |= query_flags::DEFAULT_TIMESTAMP;
        }
        w.put_u8(flags);

        if let Some(size) = self.page_size {
            w.put_i32(size);
        }
        if let Some(state) = &self.paging_state {
            w.put_bytes(Some(&state[..]));
        }
        if let Some(serial) = self.serial_consistency {
            serial.encode(w);
        }
        if let Some(ts) = timestamp {
            w.put_i64(ts);
        }
    }
}

/// A request the connection can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Open the session. Options are sent in the given order.
    Startup {
        /// STARTUP options (see [`startup_keys`]).
        options: Vec<(String, String)>,
    },
    /// Ask which options the server supports. Also used as heartbeat.
    Options,
    /// Answer an authentication challenge.
    AuthResponse {
        /// SASL token.
        token: Option<Bytes>,
    },
    /// Subscribe to event types (see [`crate::response::event_types`]).
    Register {
        /// Event type names.
        events: Vec<String>,
    },
    /// Run an unbound query string.
    Query {
        /// Query text.
        query: String,
        /// Query parameters.
        parameters: QueryParameters,
    },
    /// Prepare a statement.
    Prepare {
        /// Query text.
        query: String,
    },
    /// Execute a prepared statement without bound values.
    Execute {
        /// Prepared statement id.
        id: Bytes,
        /// Query parameters.
        parameters: QueryParameters,
    },
    /// Pre-encoded body.
    Raw {
        /// Opcode to send.
        opcode: Opcode,
        /// Body bytes.
        body: Bytes,
    },
}

impl Request {
    /// Shorthand for a query with default parameters.
    pub fn query(query: impl Into<String>) -> Self {
        Request::Query {
            query: query.into(),
            parameters: QueryParameters::default(),
        }
    }

    /// Opcode this request is sent with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Startup { .. } => Opcode::Startup,
            Request::Options => Opcode::Options,
            Request::AuthResponse { .. } => Opcode::AuthResponse,
            Request::Register { .. } => Opcode::Register,
            Request::Query { .. } => Opcode::Query,
            Request::Prepare { .. } => Opcode::Prepare,
            Request::Execute { .. } => Opcode::Execute,
            Request::Raw { opcode, .. } => *opcode,
        }
    }

    /// Encode the body for `version`.
    pub fn encode(&self, version: ProtocolVersion) -> Bytes {
        let mut w = BodyWriter::new();
        match self {
            Request::Startup { options } => {
                w.put_string_map(options);
            }
            Request::Options => {}
            Request::AuthResponse { token } => {
                w.put_bytes(token.as_deref());
            }
            Request::Register { events } => {
                w.put_string_list(events);
            }
            Request::Query { query, parameters } => {
                w.put_long_string(query);
                parameters.encode(&mut w, version);
            }
            Request::Prepare { query } => {
                w.put_long_string(query);
            }
            Request::Execute { id, parameters } => {
                w.put_short_bytes(id);
                if version == ProtocolVersion::V1 {
                    // V1: values come before the consistency.
                    w.put_u16(0);
                }
                parameters.encode(&mut w, version);
            }
            Request::Raw { body, .. } => return body.clone(),
        }
        w.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BodyReader;

    #[test]
    fn test_startup_body() {
        let req = Request::Startup {
            options: vec![(startup_keys::CQL_VERSION.into(), "3.0.0".into())],
        };
        assert_eq!(req.opcode(), Opcode::Startup);
        let mut r = BodyReader::new(req.encode(ProtocolVersion::V4));
        assert_eq!(
            r.read_string_map().unwrap(),
            vec![("CQL_VERSION".to_string(), "3.0.0".to_string())]
        );
        assert!(r.is_exhausted());
    }

    #[test]
    fn test_options_is_empty() {
        assert!(Request::Options.encode(ProtocolVersion::V4).is_empty());
    }

    #[test]
    fn test_query_v4_layout() {
        let req = Request::Query {
            query: "SELECT * FROM t".into(),
            parameters: QueryParameters {
                consistency: Consistency::Quorum,
                page_size: Some(100),
                default_timestamp: Some(7),
                ..Default::default()
            },
        };
        let mut r = BodyReader::new(req.encode(ProtocolVersion::V4));
        assert_eq!(r.read_long_string().unwrap(), "SELECT * FROM t");
        assert_eq!(r.read_u16().unwrap(), Consistency::Quorum as u16);
        assert_eq!(
            r.read_u8().unwrap(),
            query_flags::PAGE_SIZE | query_flags::DEFAULT_TIMESTAMP
        );
        assert_eq!(r.read_i32().unwrap(), 100);
        assert_eq!(r.read_i64().unwrap(), 7);
        assert!(r.is_exhausted());
    }

    #[test]
    fn test_query_v2_drops_timestamp() {
        let req = Request::Query {
            query: "x".into(),
            parameters: QueryParameters {
                default_timestamp: Some(7),
                ..Default::default()
            },
        };
        let mut r = BodyReader::new(req.encode(ProtocolVersion::V2));
        r.read_long_string().unwrap();
        r.read_u16().unwrap();
        assert_eq!(r.read_u8().unwrap(), 0);
        assert!(r.is_exhausted());
    }

    #[test]
    fn test_query_v1_has_no_flags() {
        let mut r = BodyReader::new(Request::query("x").encode(ProtocolVersion::V1));
        r.read_long_string().unwrap();
        assert_eq!(r.read_u16().unwrap(), Consistency::One as u16);
        assert!(r.is_exhausted());
    }

    #[test]
    fn test_execute_layouts() {
        let req = Request::Execute {
            id: Bytes::from_static(&[1, 2]),
            parameters: QueryParameters::default(),
        };
        let mut r = BodyReader::new(req.encode(ProtocolVersion::V1));
        assert_eq!(r.read_short_bytes().unwrap().as_ref(), &[1, 2]);
        assert_eq!(r.read_u16().unwrap(), 0);
        assert_eq!(r.read_u16().unwrap(), Consistency::One as u16);
        assert!(r.is_exhausted());

        let mut r = BodyReader::new(req.encode(ProtocolVersion::V3));
        r.read_short_bytes().unwrap();
        assert_eq!(r.read_u16().unwrap(), Consistency::One as u16);
        assert_eq!(r.read_u8().unwrap(), 0);
        assert!(r.is_exhausted());
    }

    #[test]
    fn test_register_and_auth_response() {
        let req = Request::Register {
            events: vec!["STATUS_CHANGE".into()],
        };
        let mut r = BodyReader::new(req.encode(ProtocolVersion::V4));
        assert_eq!(r.read_string_list().unwrap(), vec!["STATUS_CHANGE"]);

        let req = Request::AuthResponse {
            token: Some(Bytes::from_static(b"\0u\0p")),
        };
        let mut r = BodyReader::new(req.encode(ProtocolVersion::V4));
        assert_eq!(r.read_bytes().unwrap().unwrap().as_ref(), b"\0u\0p");
    }

    #[test]
    fn test_raw_passthrough() {
        let req = Request::Raw {
            opcode: Opcode::Batch,
            body: Bytes::from_static(b"opaque"),
        };
        assert_eq!(req.opcode(), Opcode::Batch);
        assert_eq!(req.encode(ProtocolVersion::V4).as_ref(), b"opaque");
    }
}
