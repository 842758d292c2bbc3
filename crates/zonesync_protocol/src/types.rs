//! Addressing types: timestamps, zones and record keys.

use crate::error::{ProtocolError, ProtocolResult};
use crate::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Logical timestamp ordering concurrent writes to one field.
///
/// Not wall-clock time. Higher values win a merge.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogicalTimestamp(pub u64);

impl LogicalTimestamp {
    /// The smallest timestamp.
    pub const ZERO: Self = Self(0);

    /// Creates a new timestamp.
    #[must_use]
    pub const fn new(ts: u64) -> Self {
        Self(ts)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next timestamp.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts:{}", self.0)
    }
}

/// The database scope a zone lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// The user's own data.
    Private,
    /// Data shared with the user by someone else.
    Shared,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Private => f.write_str("private"),
            Scope::Shared => f.write_str("shared"),
        }
    }
}

/// Identifies a zone: its scope plus a name unique within that scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId {
    /// Scope of the zone.
    pub scope: Scope,
    /// Zone name.
    pub name: String,
}

impl ZoneId {
    /// Creates a zone id.
    pub fn new(scope: Scope, name: impl Into<String>) -> Self {
        Self {
            scope,
            name: name.into(),
        }
    }

    /// A private-scope zone.
    pub fn private(name: impl Into<String>) -> Self {
        Self::new(Scope::Private, name)
    }

    /// A shared-scope zone.
    pub fn shared(name: impl Into<String>) -> Self {
        Self::new(Scope::Shared, name)
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

/// A zone known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// Zone identity.
    pub id: ZoneId,
}

impl Zone {
    /// Creates a zone.
    pub fn new(id: ZoneId) -> Self {
        Self { id }
    }

    /// Returns the zone's scope.
    pub fn scope(&self) -> Scope {
        self.id.scope
    }
}

/// A primary key value.
///
/// Narrower than [`FieldValue`]: only kinds that identify a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyValue {
    /// Integer key.
    Integer(i64),
    /// Text key.
    Text(String),
    /// UUID key.
    Uuid(Uuid),
}

impl KeyValue {
    /// Interprets a field value as a key.
    ///
    /// # Errors
    ///
    /// Fails for null, boolean, real and byte values.
    pub fn from_field(value: &FieldValue) -> ProtocolResult<Self> {
        match value {
            FieldValue::Integer(n) => Ok(Self::Integer(*n)),
            FieldValue::Text(s) => Ok(Self::Text(s.clone())),
            FieldValue::Uuid(u) => Ok(Self::Uuid(*u)),
            other => Err(ProtocolError::InvalidKeyValue { kind: other.kind() }),
        }
    }

    /// Converts back into a field value.
    pub fn to_field(&self) -> FieldValue {
        match self {
            Self::Integer(n) => FieldValue::Integer(*n),
            Self::Text(s) => FieldValue::Text(s.clone()),
            Self::Uuid(u) => FieldValue::Uuid(*u),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
            Self::Uuid(u) => write!(f, "{}", u.hyphenated()),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<i32> for KeyValue {
    fn from(n: i32) -> Self {
        Self::Integer(i64::from(n))
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Uuid> for KeyValue {
    fn from(u: Uuid) -> Self {
        Self::Uuid(u)
    }
}

/// Identifies a record: table plus primary key value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Table name.
    pub table: String,
    /// Primary key value.
    pub id: KeyValue,
}

impl RecordKey {
    /// Creates a record key.
    pub fn new(table: impl Into<String>, id: impl Into<KeyValue>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }

    /// The remote record name, `"<pk>:<table>"`.
    pub fn record_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.table)
    }
}
