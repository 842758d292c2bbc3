//! Messages exchanged with the remote store.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::RecordChange;
use crate::types::RecordKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque change token issued by the remote store for one zone.
///
/// The engine stores and returns it without interpreting the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeToken(pub Vec<u8>);

impl ChangeToken {
    /// Wraps raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Why the remote refused to store a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// A deletion was refused because another stored record still points at it.
    ReferenceViolation {
        /// The record holding the reference.
        referenced_by: RecordKey,
    },
    /// The zone does not exist remotely.
    ZoneNotFound,
    /// Any other refusal.
    Rejected(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReferenceViolation { referenced_by } => {
                write!(f, "still referenced by {referenced_by}")
            }
            Self::ZoneNotFound => f.write_str("zone not found"),
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
        }
    }
}

/// Per-record outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveResult {
    /// Stored (or deleted) remotely.
    Saved,
    /// Refused.
    Failed(FailureReason),
}

impl SaveResult {
    /// Returns true for [`SaveResult::Saved`].
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved)
    }
}

/// Changes fetched from the remote since a token.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FetchResult {
    /// Saved or updated records.
    pub modifications: Vec<RecordChange>,
    /// Deleted records, in remote deletion order.
    pub deletions: Vec<RecordKey>,
    /// Token to pass to the next fetch.
    pub new_token: Option<ChangeToken>,
    /// True if the remote has more changes past `new_token`.
    pub has_more: bool,
}

impl FetchResult {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty() && self.deletions.is_empty()
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
