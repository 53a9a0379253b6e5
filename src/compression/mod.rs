//! Body compression - pluggable compressors negotiated at startup.
//!
//! The algorithm itself lives outside this crate: callers hand a
//! [`Compressor`] to the connection, the handshake advertises its
//! [`name`](Compressor::name) in STARTUP when the server supports it, and from
//! then on every non-startup frame in both directions goes through it.
//!
//! A connection's compressor is decided once and never changes.
//!
//! # Example
//!
//! ```
//! use cqlwire_client::compression::{Compressor, NoCompression};
//!
//! let codec = NoCompression;
//! let packed = codec.compress(b"body").unwrap();
//! assert_eq!(codec.decompress(&packed, 1024).unwrap().as_ref(), b"body");
//! ```

mod none;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;

pub use none::NoCompression;

/// A body compression algorithm.
///
/// Implementations must be stateless across frames: each body is compressed
/// and decompressed independently.
pub trait Compressor: Send + Sync + fmt::Debug {
    /// Algorithm name as advertised in the server's `COMPRESSION` option
    /// (e.g. `"lz4"`, `"snappy"`). `None` means no compression.
    fn name(&self) -> Option<&str>;

    /// Compress an outbound body.
    fn compress(&self, body: &[u8]) -> Result<Bytes>;

    /// Decompress an inbound body whose decompressed size may not exceed
    /// `max_len`.
    ///
    /// Any failure (corrupt input, length mismatch) must be reported as
    /// `DecompressionError`; it is fatal to the connection.
    fn decompress(&self, body: &[u8], max_len: usize) -> Result<Bytes>;
}

/// Shared handle to a compressor.
pub type SharedCompressor = Arc<dyn Compressor>;

/// Pick the compressor to use given what the server advertised.
///
/// Returns `None` (no compression) when the requested algorithm is absent from
/// `supported`, or when the requested compressor is the no-op one.
pub fn negotiate(requested: &SharedCompressor, supported: &[String]) -> Option<SharedCompressor> {
    let name = requested.name()?;
    if supported.iter().any(|s| s.eq_ignore_ascii_case(name)) {
        Some(requested.clone())
    } else {
        tracing::warn!(
            compression = name,
            ?supported,
            "server does not support requested compression, continuing uncompressed"
        );
        None
    }
}
