//! RESULT bodies.
//!
//! A RESULT starts with an `[int]` kind followed by the kind's layout:
//!
//! | Kind | Name          | Layout                                          |
//! |------|---------------|-------------------------------------------------|
//! | 1    | Void          | nothing                                         |
//! | 2    | Rows          | metadata, `[int]` row count, row cells          |
//! | 3    | Set_keyspace  | `[string]` keyspace                             |
//! | 4    | Prepared      | `[short bytes]` id, metadata, result metadata   |
//! | 5    | Schema_change | see [`SchemaChange`]                            |

use bytes::Bytes;

use super::event::SchemaChange;
use crate::error::{Result, WireError};
use crate::protocol::{BodyReader, ProtocolVersion};

const KIND_VOID: i32 = 0x0001;
const KIND_ROWS: i32 = 0x0002;
const KIND_SET_KEYSPACE: i32 = 0x0003;
const KIND_PREPARED: i32 = 0x0004;
const KIND_SCHEMA_CHANGE: i32 = 0x0005;

const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

/// Nesting limit for collection/UDT/tuple column types.
const MAX_TYPE_DEPTH: usize = 32;

/// Column type as described in result metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    /// Server-side class name of a custom type.
    Custom(String),
    /// ascii
    Ascii,
    /// bigint
    Bigint,
    /// blob
    Blob,
    /// boolean
    Boolean,
    /// counter
    Counter,
    /// decimal
    Decimal,
    /// double
    Double,
    /// float
    Float,
    /// int
    Int,
    /// timestamp
    Timestamp,
    /// uuid
    Uuid,
    /// varchar / text
    Varchar,
    /// varint
    Varint,
    /// timeuuid
    Timeuuid,
    /// inet
    Inet,
    /// date
    Date,
    /// time
    Time,
    /// smallint
    Smallint,
    /// tinyint
    Tinyint,
    /// duration
    Duration,
    /// list<T>
    List(Box<ColumnType>),
    /// map<K, V>
    Map(Box<ColumnType>, Box<ColumnType>),
    /// set<T>
    Set(Box<ColumnType>),
    /// User-defined type.
    Udt {
        /// Keyspace of the type.
        keyspace: String,
        /// Type name.
        name: String,
        /// Fields in declaration order.
        fields: Vec<(String, ColumnType)>,
    },
    /// tuple<...>
    Tuple(Vec<ColumnType>),
}

impl ColumnType {
    /// Decode an `[option]` describing a type.
    pub fn decode(reader: &mut BodyReader) -> Result<Self> {
        Self::decode_nested(reader, 0)
    }

    fn decode_nested(reader: &mut BodyReader, depth: usize) -> Result<Self> {
        if depth > MAX_TYPE_DEPTH {
            return Err(WireError::InvalidFrame(
                "column type nesting too deep".to_string(),
            ));
        }
        let id = reader.read_u16()?;
        let ty = match id {
            0x0000 => ColumnType::Custom(reader.read_string()?),
            0x0001 => ColumnType::Ascii,
            0x0002 => ColumnType::Bigint,
            0x0003 => ColumnType::Blob,
            0x0004 => ColumnType::Boolean,
            0x0005 => ColumnType::Counter,
            0x0006 => ColumnType::Decimal,
            0x0007 => ColumnType::Double,
            0x0008 => ColumnType::Float,
            0x0009 => ColumnType::Int,
            // 0x000A was "text" in V1, an alias of varchar.
            0x000A | 0x000D => ColumnType::Varchar,
            0x000B => ColumnType::Timestamp,
            0x000C => ColumnType::Uuid,
            0x000E => ColumnType::Varint,
            0x000F => ColumnType::Timeuuid,
            0x0010 => ColumnType::Inet,
            0x0011 => ColumnType::Date,
            0x0012 => ColumnType::Time,
            0x0013 => ColumnType::Smallint,
            0x0014 => ColumnType::Tinyint,
            0x0015 => ColumnType::Duration,
            0x0020 => ColumnType::List(Box::new(Self::decode_nested(reader, depth + 1)?)),
            0x0021 => {
                let key = Self::decode_nested(reader, depth + 1)?;
                let value = Self::decode_nested(reader, depth + 1)?;
                ColumnType::Map(Box::new(key), Box::new(value))
            }
            0x0022 => ColumnType::Set(Box::new(Self::decode_nested(reader, depth + 1)?)),
            0x0030 => {
                let keyspace = reader.read_string()?;
                let name = reader.read_string()?;
                let n = reader.read_u16()? as usize;
                let mut fields = Vec::with_capacity(n.min(reader.remaining()));
                for _ in 0..n {
                    let field = reader.read_string()?;
                    fields.push((field, Self::decode_nested(reader, depth + 1)?));
                }
                ColumnType::Udt {
                    keyspace,
                    name,
                    fields,
                }
            }
            0x0031 => {
                let n = reader.read_u16()? as usize;
                let mut types = Vec::with_capacity(n.min(reader.remaining()));
                for _ in 0..n {
                    types.push(Self::decode_nested(reader, depth + 1)?);
                }
                ColumnType::Tuple(types)
            }
            other => {
                return Err(WireError::InvalidFrame(format!(
                    "unknown column type 0x{:04x}",
                    other
                )))
            }
        };
        Ok(ty)
    }
}

/// One column of result metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Keyspace.
    pub keyspace: String,
    /// Table.
    pub table: String,
    /// Column name.
    pub name: String,
    /// Column type.
    pub column_type: ColumnType,
}

fn decode_column_specs(
    reader: &mut BodyReader,
    flags: i32,
    count: usize,
) -> Result<Vec<ColumnSpec>> {
    let global = if flags & FLAG_GLOBAL_TABLES_SPEC != 0 {
        Some((reader.read_string()?, reader.read_string()?))
    } else {
        None
    };

    let mut columns = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        let (keyspace, table) = match &global {
            Some((ks, t)) => (ks.clone(), t.clone()),
            None => (reader.read_string()?, reader.read_string()?),
        };
        columns.push(ColumnSpec {
            keyspace,
            table,
            name: reader.read_string()?,
            column_type: ColumnType::decode(reader)?,
        });
    }
    Ok(columns)
}

fn read_count(reader: &mut BodyReader, what: &str) -> Result<usize> {
    let n = reader.read_i32()?;
    usize::try_from(n).map_err(|_| WireError::InvalidFrame(format!("negative {} {}", what, n)))
}

/// Metadata heading a Rows result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowsMetadata {
    /// Number of columns per row.
    pub column_count: usize,
    /// Paging state for the next page, if any.
    pub paging_state: Option<Bytes>,
    /// Column descriptions; empty when the server skipped metadata.
    pub columns: Vec<ColumnSpec>,
}

impl RowsMetadata {
    /// Decode rows metadata.
    pub fn decode(reader: &mut BodyReader) -> Result<Self> {
        let flags = reader.read_i32()?;
        let column_count = read_count(reader, "column count")?;
        let paging_state = if flags & FLAG_HAS_MORE_PAGES != 0 {
            reader.read_bytes()?
        } else {
            None
        };
        let columns = if flags & FLAG_NO_METADATA != 0 {
            Vec::new()
        } else {
            decode_column_specs(reader, flags, column_count)?
        };
        Ok(Self {
            column_count,
            paging_state,
            columns,
        })
    }
}

/// A page of rows. Cells are raw serialized values; `None` is null.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rows {
    /// Result metadata.
    pub metadata: RowsMetadata,
    /// Row cells.
    pub rows: Vec<Vec<Option<Bytes>>>,
}

impl Rows {
    fn decode(reader: &mut BodyReader) -> Result<Self> {
        let metadata = RowsMetadata::decode(reader)?;
        let row_count = read_count(reader, "row count")?;
        let width = metadata.column_count;
        // Zero-width rows take no bytes, so nothing else bounds the count.
        if width == 0 && row_count > 0 {
            return Err(WireError::InvalidFrame(format!(
                "{} rows without columns",
                row_count
            )));
        }
        // Every cell costs at least its 4-byte length.
        let min_len = row_count.saturating_mul(width).saturating_mul(4);
        if min_len > reader.remaining() {
            return Err(WireError::truncated(min_len, reader.remaining()));
        }
        let mut rows = Vec::with_capacity(row_count.min(reader.remaining()));
        for _ in 0..row_count {
            let mut row = Vec::with_capacity(width);
            for _ in 0..width {
                row.push(reader.read_bytes()?);
            }
            rows.push(row);
        }
        Ok(Self { metadata, rows })
    }
}

/// Metadata describing a prepared statement's bind markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedMetadata {
    /// Indexes of partition-key columns among the bind markers (V4+).
    pub pk_indexes: Vec<u16>,
    /// Bind marker descriptions.
    pub columns: Vec<ColumnSpec>,
}

impl PreparedMetadata {
    fn decode(reader: &mut BodyReader, version: ProtocolVersion) -> Result<Self> {
        let flags = reader.read_i32()?;
        let column_count = read_count(reader, "column count")?;
        let mut pk_indexes = Vec::new();
        if version >= ProtocolVersion::V4 {
            let pk_count = read_count(reader, "partition key count")?;
            for _ in 0..pk_count {
                pk_indexes.push(reader.read_u16()?);
            }
        }
        let columns = decode_column_specs(reader, flags, column_count)?;
        Ok(Self {
            pk_indexes,
            columns,
        })
    }
}

/// A Prepared result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    /// Statement id for EXECUTE.
    pub id: Bytes,
    /// Bind marker metadata.
    pub metadata: PreparedMetadata,
    /// Metadata of the rows EXECUTE will return (V2+).
    pub result_metadata: Option<RowsMetadata>,
}

/// A RESULT response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    /// No result.
    Void,
    /// Rows.
    Rows(Rows),
    /// Answer to a USE statement.
    SetKeyspace(String),
    /// Prepared statement.
    Prepared(Prepared),
    /// Schema altered.
    SchemaChange(SchemaChange),
}

impl QueryResult {
    /// Decode a RESULT body.
    pub fn decode(reader: &mut BodyReader, version: ProtocolVersion) -> Result<Self> {
        let kind = reader.read_i32()?;
        match kind {
            KIND_VOID => Ok(QueryResult::Void),
            KIND_ROWS => Rows::decode(reader).map(QueryResult::Rows),
            KIND_SET_KEYSPACE => reader.read_string().map(QueryResult::SetKeyspace),
            KIND_PREPARED => {
                let id = reader.read_short_bytes()?;
                let metadata = PreparedMetadata::decode(reader, version)?;
                let result_metadata = if version >= ProtocolVersion::V2 {
                    Some(RowsMetadata::decode(reader)?)
                } else {
                    None
                };
                Ok(QueryResult::Prepared(Prepared {
                    id,
                    metadata,
                    result_metadata,
                }))
            }
            KIND_SCHEMA_CHANGE => {
                SchemaChange::decode(reader, version).map(QueryResult::SchemaChange)
            }
            other => Err(WireError::InvalidFrame(format!(
                "unknown result kind {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BodyWriter;
    use crate::response::event::SchemaChangeTarget;

    fn decode(w: BodyWriter, version: ProtocolVersion) -> Result<QueryResult> {
        QueryResult::decode(&mut BodyReader::new(w.freeze()), version)
    }

    #[test]
    fn test_void() {
        let mut w = BodyWriter::new();
        w.put_i32(KIND_VOID);
        assert_eq!(decode(w, ProtocolVersion::V4).unwrap(), QueryResult::Void);
    }

    #[test]
    fn test_set_keyspace() {
        let mut w = BodyWriter::new();
        w.put_i32(KIND_SET_KEYSPACE).put_string("metrics");
        assert_eq!(
            decode(w, ProtocolVersion::V4).unwrap(),
            QueryResult::SetKeyspace("metrics".into())
        );
    }

    #[test]
    fn test_rows_with_global_spec_and_nulls() {
        let mut w = BodyWriter::new();
        w.put_i32(KIND_ROWS)
            .put_i32(FLAG_GLOBAL_TABLES_SPEC)
            .put_i32(2)
            .put_string("ks")
            .put_string("users")
            .put_string("id")
            .put_u16(0x0009)
            .put_string("tags")
            .put_u16(0x0022)
            .put_u16(0x000D);
        w.put_i32(2);
        w.put_bytes(Some(&1i32.to_be_bytes())).put_bytes(None);
        w.put_bytes(Some(&2i32.to_be_bytes())).put_bytes(Some(b""));

        let rows = match decode(w, ProtocolVersion::V4).unwrap() {
            QueryResult::Rows(rows) => rows,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(rows.metadata.column_count, 2);
        assert_eq!(rows.metadata.columns[0].table, "users");
        assert_eq!(rows.metadata.columns[0].column_type, ColumnType::Int);
        assert_eq!(
            rows.metadata.columns[1].column_type,
            ColumnType::Set(Box::new(ColumnType::Varchar))
        );
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(rows.rows[0][1], None);
        assert_eq!(rows.rows[1][1].as_deref(), Some(&b""[..]));
    }

    #[test]
    fn test_rows_paging_and_no_metadata() {
        let mut w = BodyWriter::new();
        w.put_i32(KIND_ROWS)
            .put_i32(FLAG_HAS_MORE_PAGES | FLAG_NO_METADATA)
            .put_i32(1)
            .put_bytes(Some(b"page-2"))
            .put_i32(1)
            .put_bytes(Some(b"v"));
        match decode(w, ProtocolVersion::V4).unwrap() {
            QueryResult::Rows(rows) => {
                assert!(rows.metadata.columns.is_empty());
                assert_eq!(rows.metadata.paging_state.as_deref(), Some(&b"page-2"[..]));
                assert_eq!(rows.rows, vec![vec![Some(Bytes::from_static(b"v"))]]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rows_count_larger_than_body() {
        let mut w = BodyWriter::new();
        w.put_i32(KIND_ROWS)
            .put_i32(FLAG_NO_METADATA)
            .put_i32(3)
            .put_i32(1_000_000);
        assert!(matches!(
            decode(w, ProtocolVersion::V4),
            Err(WireError::TruncatedFrame { .. })
        ));
    }

    #[test]
    fn test_rows_without_columns() {
        let mut w = BodyWriter::new();
        w.put_i32(KIND_ROWS).put_i32(0).put_i32(0).put_i32(i32::MAX);
        assert!(matches!(
            decode(w, ProtocolVersion::V4),
            Err(WireError::InvalidFrame(_))
        ));

        // An empty page without columns is still fine.
        let mut w = BodyWriter::new();
        w.put_i32(KIND_ROWS).put_i32(0).put_i32(0).put_i32(0);
        match decode(w, ProtocolVersion::V4).unwrap() {
            QueryResult::Rows(rows) => assert!(rows.rows.is_empty()),
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_types() {
        let mut w = BodyWriter::new();
        // map<text, frozen<tuple<int, list<uuid>>>>
        w.put_u16(0x0021)
            .put_u16(0x000D)
            .put_u16(0x0031)
            .put_u16(2)
            .put_u16(0x0009)
            .put_u16(0x0020)
            .put_u16(0x000C);
        let ty = ColumnType::decode(&mut BodyReader::new(w.freeze())).unwrap();
        assert_eq!(
            ty,
            ColumnType::Map(
                Box::new(ColumnType::Varchar),
                Box::new(ColumnType::Tuple(vec![
                    ColumnType::Int,
                    ColumnType::List(Box::new(ColumnType::Uuid))
                ]))
            )
        );
    }

    #[test]
    fn test_udt_type() {
        let mut w = BodyWriter::new();
        w.put_u16(0x0030)
            .put_string("ks")
            .put_string("address")
            .put_u16(2)
            .put_string("street")
            .put_u16(0x000D)
            .put_string("zip")
            .put_u16(0x0009);
        match ColumnType::decode(&mut BodyReader::new(w.freeze())).unwrap() {
            ColumnType::Udt { name, fields, .. } => {
                assert_eq!(name, "address");
                assert_eq!(fields[1], ("zip".to_string(), ColumnType::Int));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_type_nesting_limit() {
        let mut w = BodyWriter::new();
        for _ in 0..40 {
            w.put_u16(0x0020);
        }
        w.put_u16(0x0009);
        assert!(matches!(
            ColumnType::decode(&mut BodyReader::new(w.freeze())),
            Err(WireError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_prepared_v4() {
        let mut w = BodyWriter::new();
        w.put_i32(KIND_PREPARED).put_short_bytes(&[0xAB, 0xCD]);
        // bind metadata: global spec, 1 column, 1 pk index
        w.put_i32(FLAG_GLOBAL_TABLES_SPEC)
            .put_i32(1)
            .put_i32(1)
            .put_u16(0)
            .put_string("ks")
            .put_string("t")
            .put_string("id")
            .put_u16(0x000C);
        // result metadata: no metadata
        w.put_i32(FLAG_NO_METADATA).put_i32(3);

        match decode(w, ProtocolVersion::V4).unwrap() {
            QueryResult::Prepared(p) => {
                assert_eq!(p.id.as_ref(), &[0xAB, 0xCD]);
                assert_eq!(p.metadata.pk_indexes, vec![0]);
                assert_eq!(p.metadata.columns[0].column_type, ColumnType::Uuid);
                assert_eq!(p.result_metadata.unwrap().column_count, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_prepared_v1_has_no_result_metadata() {
        let mut w = BodyWriter::new();
        w.put_i32(KIND_PREPARED).put_short_bytes(&[1]);
        w.put_i32(0).put_i32(0);
        match decode(w, ProtocolVersion::V1).unwrap() {
            QueryResult::Prepared(p) => {
                assert!(p.result_metadata.is_none());
                assert!(p.metadata.pk_indexes.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_schema_change_result() {
        let mut w = BodyWriter::new();
        w.put_i32(KIND_SCHEMA_CHANGE)
            .put_string("CREATED")
            .put_string("TABLE")
            .put_string("ks")
            .put_string("events");
        match decode(w, ProtocolVersion::V4).unwrap() {
            QueryResult::SchemaChange(sc) => {
                assert_eq!(sc.target, SchemaChangeTarget::Table);
                assert_eq!(sc.name.as_deref(), Some("events"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind() {
        let mut w = BodyWriter::new();
        w.put_i32(42);
        assert!(matches!(
            decode(w, ProtocolVersion::V4),
            Err(WireError::InvalidFrame(_))
        ));
    }
}
