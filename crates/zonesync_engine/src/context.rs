//! Shared collaborators handed to the batcher, applier and cascade.

use crate::clock::LogicalClock;
use crate::schema::SchemaGraph;
use crate::store::LocalStore;
use crate::unsynced::UnsyncedStore;
use zonesync_protocol::{FieldMap, LogicalTimestamp};

/// Borrowed engine state one zone pipeline step works against.
pub(crate) struct SyncContext<'a, L: LocalStore + ?Sized> {
    pub schema: &'a SchemaGraph,
    pub local: &'a L,
    pub unsynced: &'a UnsyncedStore,
    pub clock: &'a LogicalClock,
}

/// Largest timestamp in a field map.
pub(crate) fn max_timestamp(fields: &FieldMap) -> LogicalTimestamp {
    fields
        .values()
        .map(|f| f.timestamp)
        .max()
        .unwrap_or(LogicalTimestamp::ZERO)
}
