//! Body primitives: a bounded read cursor and a growable writer.
//!
//! Notation follows the native protocol:
//!
//! | Type            | Encoding                                          |
//! |-----------------|---------------------------------------------------|
//! | `[short]`       | u16 BE                                            |
//! | `[int]`         | i32 BE                                            |
//! | `[string]`      | `[short]` n, then n bytes of UTF-8                |
//! | `[long string]` | `[int]` n, then n bytes of UTF-8                  |
//! | `[string list]` | `[short]` n, then n `[string]`                    |
//! | `[bytes]`       | `[int]` n, then n bytes; n < 0 means null         |
//! | `[short bytes]` | `[short]` n, then n bytes                         |
//! | `[bytes map]`   | `[short]` n, then n (`[string]`, `[bytes]`) pairs |
//! | `[uuid]`        | 16 bytes, RFC 4122 network order                  |
//! | `[inet]`        | 1 byte size (4/16), address bytes, `[int]` port   |

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{Result, WireError};

/// Size of a `[uuid]` on the wire.
pub const UUID_SIZE: usize = 16;

/// Ordered `[bytes map]`. Entries keep the order they had on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytesMap {
    entries: Vec<(String, Bytes)>,
}

impl BytesMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. With duplicate keys, `get` returns the first.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Value for `key`.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Entries in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decode a wire `[uuid]`.
///
/// The wire carries the RFC 4122 byte sequence: `time_low`, `time_mid` and
/// `time_hi_and_version` are big-endian. Those three fields must not be read
/// in the little-endian "GUID" layout, or the id prints with its first eight
/// bytes swapped and no longer matches the id the server logs.
#[inline]
pub fn uuid_from_wire(bytes: [u8; UUID_SIZE]) -> Uuid {
    Uuid::from_bytes(bytes)
}

/// Encode a `[uuid]`; inverse of [`uuid_from_wire`].
#[inline]
pub fn uuid_to_wire(uuid: &Uuid) -> [u8; UUID_SIZE] {
    *uuid.as_bytes()
}

/// Position-tracked read cursor over a frame body.
///
/// Never reads past the end of the body it was created with; any field that
/// claims more bytes than remain fails with `TruncatedFrame`.
#[derive(Debug, Clone)]
pub struct BodyReader {
    body: Bytes,
    pos: usize,
}

impl BodyReader {
    /// Create a reader positioned at byte 0.
    pub fn new(body: Bytes) -> Self {
        Self { body, pos: 0 }
    }

    /// Current position.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.body.len() - self.pos
    }

    /// True when every byte was consumed.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    #[inline]
    fn ensure(&self, needed: usize) -> Result<()> {
        if needed > self.remaining() {
            return Err(WireError::truncated(needed, self.remaining()));
        }
        Ok(())
    }

    /// Take `n` bytes (zero-copy slice of the body).
    pub fn read_raw(&mut self, n: usize) -> Result<Bytes> {
        self.ensure(n)?;
        let out = self.body.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.body[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Read a `[byte]`.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Read a `[short]`.
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    /// Read an `[int]`.
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    /// Read a `[long]`.
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    fn utf8(bytes: Bytes) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| WireError::InvalidFrame(format!("invalid UTF-8 string: {}", e)))
    }

    /// Read a `[string]`.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        Self::utf8(self.read_raw(len)?)
    }

    /// Read a `[long string]`.
    pub fn read_long_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        let len = usize::try_from(len)
            .map_err(|_| WireError::InvalidFrame(format!("negative string length {}", len)))?;
        Self::utf8(self.read_raw(len)?)
    }

    /// Read a `[string list]`.
    pub fn read_string_list(&mut self) -> Result<Vec<String>> {
        let n = self.read_u16()? as usize;
        // Each entry needs at least its 2-byte length.
        self.ensure(n * 2)?;
        (0..n).map(|_| self.read_string()).collect()
    }

    /// Read a `[bytes]`; `None` for a negative length.
    pub fn read_bytes(&mut self) -> Result<Option<Bytes>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        self.read_raw(len as usize).map(Some)
    }

    /// Read a `[short bytes]`.
    pub fn read_short_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_u16()? as usize;
        self.read_raw(len)
    }

    /// Read a `[bytes map]`, keeping wire order. Null values become empty.
    pub fn read_bytes_map(&mut self) -> Result<BytesMap> {
        let n = self.read_u16()? as usize;
        // key length (2) + value length (4) per entry at minimum
        self.ensure(n * 6)?;
        let mut map = BytesMap {
            entries: Vec::with_capacity(n),
        };
        for _ in 0..n {
            let key = self.read_string()?;
            let value = self.read_bytes()?.unwrap_or_default();
            map.entries.push((key, value));
        }
        Ok(map)
    }

    /// Read a `[string map]`.
    pub fn read_string_map(&mut self) -> Result<Vec<(String, String)>> {
        let n = self.read_u16()? as usize;
        self.ensure(n * 4)?;
        (0..n)
            .map(|_| Ok((self.read_string()?, self.read_string()?)))
            .collect()
    }

    /// Read a `[string multimap]`.
    pub fn read_string_multimap(&mut self) -> Result<Vec<(String, Vec<String>)>> {
        let n = self.read_u16()? as usize;
        self.ensure(n * 4)?;
        (0..n)
            .map(|_| Ok((self.read_string()?, self.read_string_list()?)))
            .collect()
    }

    /// Read a `[uuid]`.
    pub fn read_uuid(&mut self) -> Result<Uuid> {
        Ok(uuid_from_wire(self.read_array()?))
    }

    /// Read an `[inet]`.
    pub fn read_inet(&mut self) -> Result<SocketAddr> {
        let size = self.read_u8()?;
        let ip = match size {
            4 => IpAddr::V4(Ipv4Addr::from(self.read_array::<4>()?)),
            16 => IpAddr::V6(Ipv6Addr::from(self.read_array::<16>()?)),
            other => {
                return Err(WireError::InvalidFrame(format!(
                    "invalid inet address size {}",
                    other
                )))
            }
        };
        let port = self.read_i32()?;
        let port = u16::try_from(port)
            .map_err(|_| WireError::InvalidFrame(format!("invalid inet port {}", port)))?;
        Ok(SocketAddr::new(ip, port))
    }
}

/// Growable body writer using the same notation as [`BodyReader`].
#[derive(Debug, Default)]
pub struct BodyWriter {
    buf: BytesMut,
}

impl BodyWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and return the body.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Write raw bytes with no length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Write a `[byte]`.
    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    /// Write a `[short]`.
    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    /// Write an `[int]`.
    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    /// Write a `[long]`.
    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64(v);
        self
    }

    /// Write a `[string]`. Callers keep it under 65536 bytes.
    pub fn put_string(&mut self, s: &str) -> &mut Self {
        debug_assert!(s.len() <= u16::MAX as usize, "[string] too long");
        self.buf.put_u16(s.len() as u16);
        self.buf.put_slice(s.as_bytes());
        self
    }

    /// Write a `[long string]`.
    pub fn put_long_string(&mut self, s: &str) -> &mut Self {
        self.buf.put_i32(s.len() as i32);
        self.buf.put_slice(s.as_bytes());
        self
    }

    /// Write a `[string list]`.
    pub fn put_string_list<S: AsRef<str>>(&mut self, list: &[S]) -> &mut Self {
        self.buf.put_u16(list.len() as u16);
        for s in list {
            self.put_string(s.as_ref());
        }
        self
    }

    /// Write a `[string map]`.
    pub fn put_string_map<K: AsRef<str>, V: AsRef<str>>(&mut self, map: &[(K, V)]) -> &mut Self {
        self.buf.put_u16(map.len() as u16);
        for (k, v) in map {
            self.put_string(k.as_ref());
            self.put_string(v.as_ref());
        }
        self
    }

    /// Write a `[bytes]`; `None` writes a null.
    pub fn put_bytes(&mut self, bytes: Option<&[u8]>) -> &mut Self {
        match bytes {
            Some(b) => {
                self.buf.put_i32(b.len() as i32);
                self.buf.put_slice(b);
            }
            None => self.buf.put_i32(-1),
        }
        self
    }

    /// Write a `[short bytes]`.
    pub fn put_short_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_u16(bytes.len() as u16);
        self.buf.put_slice(bytes);
        self
    }

    /// Write a `[bytes map]`.
    pub fn put_bytes_map(&mut self, map: &BytesMap) -> &mut Self {
        self.buf.put_u16(map.len() as u16);
        for (k, v) in map.iter() {
            self.put_string(k);
            self.put_bytes(Some(&v[..]));
        }
        self
    }

    /// Write a `[uuid]`.
    pub fn put_uuid(&mut self, uuid: &Uuid) -> &mut Self {
        self.buf.put_slice(&uuid_to_wire(uuid));
        self
    }

    /// Write an `[inet]`.
    pub fn put_inet(&mut self, addr: &SocketAddr) -> &mut Self {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.buf.put_u8(4);
                self.buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                self.buf.put_u8(16);
                self.buf.put_slice(&ip.octets());
            }
        }
        self.buf.put_i32(i32::from(addr.port()));
        self
    }
}
