//! # zonesync protocol
//!
//! Pure data types shared by the sync engine and its collaborators:
//!
//! - [`RecordKey`], [`KeyValue`] and [`ZoneId`] addressing
//! - [`FieldValue`] / [`Field`] typed field maps with logical timestamps
//! - [`RecordChange`] for local and remote mutations
//! - [`merge_fields`] field-level last-writer-wins resolution
//! - [`FetchResult`] / [`SaveResult`] remote exchange messages
//! - [`PendingChanges`] the per-zone outgoing queue
//!
//! This crate performs no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod messages;
mod pending;
mod record;
mod types;
mod value;

pub use conflict::{merge_fields, FieldConflict, MergeOutcome, Resolution};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{ChangeToken, FailureReason, FetchResult, SaveResult};
pub use pending::{PendingChanges, PendingEntry, PendingOp};
pub use record::{Operation, RecordChange};
pub use types::{KeyValue, LogicalTimestamp, RecordKey, Scope, Zone, ZoneId};
pub use value::{Field, FieldMap, FieldValue};
