//! # cqlwire-client
//!
//! Native binary protocol (v1 to v4) codec and multiplexed connection layer
//! for wide-column database clients.
//!
//! ## Layers
//!
//! - **Codec** ([`protocol`], [`request`], [`response`]): frame headers,
//!   body primitives, typed requests and responses
//! - **Multiplexer** ([`multiplexer`]): stream id allocation and response
//!   correlation across concurrent requests
//! - **Connection** ([`connection`]): socket ownership, startup exchange,
//!   authentication, heartbeat, server events and draining
//!
//! Load balancing, retries and connection pools belong to the caller.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cqlwire_client::{Connection, ConnectionConfig, PlainTextAuthProvider, Request};
//!
//! # async fn run() -> cqlwire_client::Result<()> {
//! let conn = Connection::builder(ConnectionConfig::default())
//!     .auth_provider(Arc::new(PlainTextAuthProvider::new("cassandra", "cassandra")))
//!     .connect("127.0.0.1:9042".parse().unwrap())
//!     .await?;
//!
//! let response = conn
//!     .send_request(&Request::query("SELECT release_version FROM system.local"))
//!     .await?;
//! println!("{:?}", response.body);
//! # Ok(())
//! # }
//! ```

pub mod compression;
pub mod config;
pub mod connection;
pub mod error;
pub mod multiplexer;
pub mod protocol;
pub mod request;
pub mod response;
pub mod writer;

mod consistency;

pub use config::ConnectionConfig;
pub use connection::{
    AuthProvider, Authenticator, Connection, ConnectionBuilder, ConnectionState,
    PlainTextAuthProvider,
};
pub use consistency::Consistency;
pub use error::{ErrorScope, Result, WireError};
pub use protocol::{Opcode, ProtocolVersion};
pub use request::{QueryParameters, Request};
pub use response::{parse_response, Event, QueryResult, Response, ResponseBody, ServerError};
