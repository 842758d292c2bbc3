//! Error types for the sync engine.

use thiserror::Error;
use zonesync_protocol::{ProtocolError, RecordKey, ZoneId};
use zonesync_storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// A record whose parent has not arrived yet is not an error: it is staged.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid schema or engine setup. Raised at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A deletion would orphan a record that references the deleted one.
    #[error("cannot delete {key}: still referenced by {referenced_by}")]
    ReferenceViolation {
        /// Record that could not be deleted.
        key: RecordKey,
        /// Record holding the reference.
        referenced_by: RecordKey,
    },

    /// Network or transport error reported by the remote store.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A remote record that cannot be applied.
    #[error("malformed record {record}: {reason}")]
    MalformedRecord {
        /// Record name or key.
        record: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Uncommitted records reference each other in a loop.
    #[error("dependency cycle among pending records: {}", format_keys(.keys))]
    DependencyCycle {
        /// Records left unordered.
        keys: Vec<RecordKey>,
    },

    /// Local store failure, including foreign-key violations on commit.
    #[error("local store error: {0}")]
    Store(String),

    /// Durable log storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Durable log contents could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Durable log frame failed its checksum.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// Protocol value error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The zone is not known.
    #[error("unknown zone {0}")]
    UnknownZone(ZoneId),

    /// The logical clock reached `u64::MAX` and cannot issue a later stamp.
    #[error("logical clock exhausted")]
    ClockExhausted,

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

fn format_keys(keys: &[RecordKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl SyncError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a local store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Creates a malformed record error.
    pub fn malformed(record: impl ToString, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            record: record.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport {
                retryable: true,
                ..
            }
        )
    }
}
