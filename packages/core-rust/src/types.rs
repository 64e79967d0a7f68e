//! Negotiated wire type information for a connection.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Postgres object identifier of a type.
pub type Oid = u32;

/// Wire format of a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Text,
    Binary,
}

impl Format {
    /// Format code as sent in `Bind` and `RowDescription` messages.
    #[must_use]
    pub fn code(self) -> i16 {
        match self {
            Self::Text => 0,
            Self::Binary => 1,
        }
    }
}

/// Encode/decode rule for one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub oid: Oid,
    pub name: String,
    /// Format the server prefers when the client leaves it open.
    pub format: Format,
}

impl TypeInfo {
    pub fn new(oid: Oid, name: impl Into<String>, format: Format) -> Self {
        Self {
            oid,
            name: name.into(),
            format,
        }
    }
}

/// Set of types negotiated for a connection, indexed by OID and by name.
///
/// Built once during the handshake and then shared read-only; adding a type
/// produces a new map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeMap {
    by_oid: BTreeMap<Oid, TypeInfo>,
    by_name: HashMap<String, Oid>,
}

/// Built-in scalar types with their catalog OIDs.
const POSTGRES_BUILTINS: &[(Oid, &str, Format)] = &[
    (16, "bool", Format::Binary),
    (17, "bytea", Format::Binary),
    (20, "int8", Format::Binary),
    (21, "int2", Format::Binary),
    (23, "int4", Format::Binary),
    (25, "text", Format::Text),
    (26, "oid", Format::Binary),
    (114, "json", Format::Text),
    (700, "float4", Format::Binary),
    (701, "float8", Format::Binary),
    (1043, "varchar", Format::Text),
    (1082, "date", Format::Text),
    (1114, "timestamp", Format::Text),
    (1184, "timestamptz", Format::Text),
    (1700, "numeric", Format::Text),
    (2950, "uuid", Format::Binary),
    (3802, "jsonb", Format::Text),
];

impl TypeMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map pre-populated with the Postgres built-in scalar types.
    #[must_use]
    pub fn postgres_defaults() -> Self {
        POSTGRES_BUILTINS
            .iter()
            .fold(Self::new(), |map, &(oid, name, format)| {
                map.with_type(TypeInfo::new(oid, name, format))
            })
    }

    /// Returns a map containing `info`, replacing any type with the same OID
    /// or name.
    #[must_use]
    pub fn with_type(mut self, info: TypeInfo) -> Self {
        if let Some(old_oid) = self.by_name.remove(&info.name) {
            self.by_oid.remove(&old_oid);
        }
        if let Some(old) = self.by_oid.remove(&info.oid) {
            self.by_name.remove(&old.name);
        }
        self.by_name.insert(info.name.clone(), info.oid);
        self.by_oid.insert(info.oid, info);
        self
    }

    #[must_use]
    pub fn by_oid(&self, oid: Oid) -> Option<&TypeInfo> {
        self.by_oid.get(&oid)
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&TypeInfo> {
        self.by_name.get(name).and_then(|oid| self.by_oid.get(oid))
    }

    /// Preferred format for `oid`; unknown types fall back to text.
    #[must_use]
    pub fn format_for(&self, oid: Oid) -> Format {
        self.by_oid(oid).map_or(Format::Text, |info| info.format)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_oid.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_oid.is_empty()
    }

    /// Iterates types in OID order.
    pub fn iter(&self) -> impl Iterator<Item = &TypeInfo> {
        self.by_oid.values()
    }
}
