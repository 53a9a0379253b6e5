//! EVENT bodies and the schema-change layout shared with RESULT.

use std::net::SocketAddr;

use crate::error::{Result, WireError};
use crate::protocol::{BodyReader, ProtocolVersion};

/// Event types a client can REGISTER for.
pub mod event_types {
    /// Node added, removed or moved.
    pub const TOPOLOGY_CHANGE: &str = "TOPOLOGY_CHANGE";
    /// Node up or down.
    pub const STATUS_CHANGE: &str = "STATUS_CHANGE";
    /// Schema altered.
    pub const SCHEMA_CHANGE: &str = "SCHEMA_CHANGE";
}

/// Kind of topology change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChange {
    /// NEW_NODE
    NewNode,
    /// REMOVED_NODE
    RemovedNode,
    /// MOVED_NODE
    MovedNode,
}

/// Kind of status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// UP
    Up,
    /// DOWN
    Down,
}

/// Kind of schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    /// CREATED
    Created,
    /// UPDATED
    Updated,
    /// DROPPED
    Dropped,
}

/// Element a schema change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeTarget {
    /// A keyspace.
    Keyspace,
    /// A table.
    Table,
    /// A user-defined type.
    Type,
    /// A function.
    Function,
    /// An aggregate.
    Aggregate,
}

/// A schema change, either as an EVENT or as a RESULT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    /// What happened.
    pub change_type: SchemaChangeType,
    /// What it happened to.
    pub target: SchemaChangeTarget,
    /// Keyspace name.
    pub keyspace: String,
    /// Table, type, function or aggregate name; `None` for keyspaces.
    pub name: Option<String>,
    /// Argument types for functions and aggregates.
    pub arguments: Vec<String>,
}

fn invalid(what: &str, value: &str) -> WireError {
    WireError::InvalidFrame(format!("unknown {} '{}'", what, value))
}

impl SchemaChange {
    /// Decode a schema change in the layout of `version`.
    pub fn decode(reader: &mut BodyReader, version: ProtocolVersion) -> Result<Self> {
        let change = reader.read_string()?;
        let change_type = match change.as_str() {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            other => return Err(invalid("schema change type", other)),
        };

        if !version.uses_short_stream_ids() {
            // V1/V2: keyspace, then table ("" for a keyspace change).
            let keyspace = reader.read_string()?;
            let table = reader.read_string()?;
            let (target, name) = if table.is_empty() {
                (SchemaChangeTarget::Keyspace, None)
            } else {
                (SchemaChangeTarget::Table, Some(table))
            };
            return Ok(Self {
                change_type,
                target,
                keyspace,
                name,
                arguments: Vec::new(),
            });
        }

        let target = reader.read_string()?;
        let target = match target.as_str() {
            "KEYSPACE" => SchemaChangeTarget::Keyspace,
            "TABLE" => SchemaChangeTarget::Table,
            "TYPE" => SchemaChangeTarget::Type,
            "FUNCTION" => SchemaChangeTarget::Function,
            "AGGREGATE" => SchemaChangeTarget::Aggregate,
            other => return Err(invalid("schema change target", other)),
        };
        let keyspace = reader.read_string()?;
        let (name, arguments) = match target {
            SchemaChangeTarget::Keyspace => (None, Vec::new()),
            SchemaChangeTarget::Table | SchemaChangeTarget::Type => {
                (Some(reader.read_string()?), Vec::new())
            }
            SchemaChangeTarget::Function | SchemaChangeTarget::Aggregate => {
                (Some(reader.read_string()?), reader.read_string_list()?)
            }
        };
        Ok(Self {
            change_type,
            target,
            keyspace,
            name,
            arguments,
        })
    }
}

/// A server-pushed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Cluster membership changed.
    TopologyChange {
        /// What changed.
        change: TopologyChange,
        /// Node address.
        address: SocketAddr,
    },
    /// A node went up or down.
    StatusChange {
        /// What changed.
        change: StatusChange,
        /// Node address.
        address: SocketAddr,
    },
    /// Schema changed.
    SchemaChange(SchemaChange),
}

impl Event {
    /// Decode an EVENT body.
    pub fn decode(reader: &mut BodyReader, version: ProtocolVersion) -> Result<Self> {
        let kind = reader.read_string()?;
        match kind.as_str() {
            event_types::TOPOLOGY_CHANGE => {
                let change = reader.read_string()?;
                let change = match change.as_str() {
                    "NEW_NODE" => TopologyChange::NewNode,
                    "REMOVED_NODE" => TopologyChange::RemovedNode,
                    "MOVED_NODE" => TopologyChange::MovedNode,
                    other => return Err(invalid("topology change", other)),
                };
                Ok(Event::TopologyChange {
                    change,
                    address: reader.read_inet()?,
                })
            }
            event_types::STATUS_CHANGE => {
                let change = reader.read_string()?;
                let change = match change.as_str() {
                    "UP" => StatusChange::Up,
                    "DOWN" => StatusChange::Down,
                    other => return Err(invalid("status change", other)),
                };
                Ok(Event::StatusChange {
                    change,
                    address: reader.read_inet()?,
                })
            }
            event_types::SCHEMA_CHANGE => {
                SchemaChange::decode(reader, version).map(Event::SchemaChange)
            }
            other => Err(invalid("event type", other)),
        }
    }
}
