//! Record changes exchanged between the local and remote stores.

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{LogicalTimestamp, RecordKey, ZoneId};
use crate::value::{Field, FieldMap, FieldValue};
use serde::{Deserialize, Serialize};

/// Kind of change carried by a [`RecordChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Insert or update.
    Save,
    /// Delete.
    Delete,
}

/// A single record mutation, destined for or received from one zone.
///
/// Parent references are ordinary entries of `fields`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordChange {
    /// Zone the record belongs to.
    pub zone: ZoneId,
    /// Table and primary key.
    pub key: RecordKey,
    /// Save or delete.
    pub operation: Operation,
    /// Timestamped fields. Empty for deletions.
    pub fields: FieldMap,
}

impl RecordChange {
    /// Creates a save.
    pub fn save(zone: ZoneId, key: RecordKey, fields: FieldMap) -> Self {
        Self {
            zone,
            key,
            operation: Operation::Save,
            fields,
        }
    }

    /// Creates a deletion.
    pub fn delete(zone: ZoneId, key: RecordKey) -> Self {
        Self {
            zone,
            key,
            operation: Operation::Delete,
            fields: FieldMap::new(),
        }
    }

    /// Adds a field, builder style.
    #[must_use]
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        value: impl Into<FieldValue>,
        timestamp: LogicalTimestamp,
    ) -> Self {
        self.fields.insert(name.into(), Field::new(value, timestamp));
        self
    }

    /// Returns true for deletions.
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// Returns the value of a field, if present.
    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).map(|f| &f.value)
    }

    /// The largest field timestamp, or zero when there are no fields.
    pub fn max_timestamp(&self) -> LogicalTimestamp {
        self.fields
            .values()
            .map(|f| f.timestamp)
            .max()
            .unwrap_or(LogicalTimestamp::ZERO)
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)
            .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
        Ok(out)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
    }
}
