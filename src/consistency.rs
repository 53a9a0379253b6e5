//! Consistency levels as carried in request and error bodies.

use crate::error::{Result, WireError};
use crate::protocol::{BodyReader, BodyWriter};

/// Consistency level (`[consistency]`, a `[short]` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum Consistency {
    /// ANY
    Any = 0x0000,
    /// ONE
    #[default]
    One = 0x0001,
    /// TWO
    Two = 0x0002,
    /// THREE
    Three = 0x0003,
    /// QUORUM
    Quorum = 0x0004,
    /// ALL
    All = 0x0005,
    /// LOCAL_QUORUM
    LocalQuorum = 0x0006,
    /// EACH_QUORUM
    EachQuorum = 0x0007,
    /// SERIAL
    Serial = 0x0008,
    /// LOCAL_SERIAL
    LocalSerial = 0x0009,
    /// LOCAL_ONE
    LocalOne = 0x000A,
}

impl Consistency {
    /// Look up a level by wire value.
    pub fn from_u16(v: u16) -> Option<Self> {
        let c = match v {
            0x0000 => Self::Any,
            0x0001 => Self::One,
            0x0002 => Self::Two,
            0x0003 => Self::Three,
            0x0004 => Self::Quorum,
            0x0005 => Self::All,
            0x0006 => Self::LocalQuorum,
            0x0007 => Self::EachQuorum,
            0x0008 => Self::Serial,
            0x0009 => Self::LocalSerial,
            0x000A => Self::LocalOne,
            _ => return None,
        };
        Some(c)
    }

    pub(crate) fn decode(reader: &mut BodyReader) -> Result<Self> {
        let v = reader.read_u16()?;
        Self::from_u16(v)
            .ok_or_else(|| WireError::InvalidFrame(format!("unknown consistency 0x{:04x}", v)))
    }

    pub(crate) fn encode(self, writer: &mut BodyWriter) {
        writer.put_u16(self as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        for v in 0u16..=0x0A {
            assert_eq!(Consistency::from_u16(v).unwrap() as u16, v);
        }
        assert!(Consistency::from_u16(0x0B).is_none());
    }

    #[test]
    fn test_unknown_on_wire() {
        let mut r = BodyReader::new(bytes::Bytes::from_static(&[0x00, 0x42]));
        assert!(matches!(
            Consistency::decode(&mut r),
            Err(WireError::InvalidFrame(_))
        ));
    }
}
