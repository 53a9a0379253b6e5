//! Pass-through compressor.

use bytes::Bytes;

use super::Compressor;
use crate::error::{Result, WireError};

/// Compressor that leaves bodies untouched. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn name(&self) -> Option<&str> {
        None
    }

    #[inline]
    fn compress(&self, body: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(body))
    }

    #[inline]
    fn decompress(&self, body: &[u8], max_len: usize) -> Result<Bytes> {
        if body.len() > max_len {
            return Err(WireError::DecompressionError(format!(
                "body of {} bytes exceeds limit {}",
                body.len(),
                max_len
            )));
        }
        Ok(Bytes::copy_from_slice(body))
    }
}
