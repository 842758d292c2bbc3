//! Upload batching.
//!
//! A batch is cut from the pending queue of one zone. Saves are materialized
//! from the current local row and ordered parents-first; deletions are
//! ordered leaf-to-root and only follow once every pending save fits. Each
//! entry remembers the revision it was built from so that an
//! acknowledgement never clears a change made while the batch was in flight.

use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::order::topological_order;
use crate::store::LocalStore;
use std::collections::HashMap;
use tracing::{debug, warn};
use zonesync_protocol::{
    FailureReason, PendingChanges, PendingOp, RecordChange, RecordKey, SaveResult, ZoneId,
};

/// A batch of changes ready to upload.
#[derive(Debug, Clone)]
pub struct ZoneBatch {
    /// Target zone.
    pub zone: ZoneId,
    /// Changes in upload order.
    pub changes: Vec<RecordChange>,
    revisions: HashMap<RecordKey, u64>,
}

impl ZoneBatch {
    fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            changes: Vec::new(),
            revisions: HashMap::new(),
        }
    }

    fn push(&mut self, change: RecordChange, revision: u64) {
        self.revisions.insert(change.key.clone(), revision);
        self.changes.push(change);
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if there is nothing to upload.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Keys in upload order.
    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.changes.iter().map(|c| &c.key)
    }

    /// The pending revision the change for `key` was built from.
    pub fn revision(&self, key: &RecordKey) -> Option<u64> {
        self.revisions.get(key).copied()
    }
}

/// What happened to a pushed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Keys the remote accepted.
    pub saved: Vec<RecordKey>,
    /// Keys the remote refused. They stay pending.
    pub failed: Vec<(RecordKey, FailureReason)>,
}

/// Builds the next batch for `zone`, at most `max_size` changes long.
///
/// Pending saves whose row is gone or now belongs to another zone are
/// dropped from the queue.
///
/// # Errors
///
/// Returns [`crate::SyncError::DependencyCycle`] if pending saves reference
/// each other in a loop.
pub(crate) fn next_batch<L: LocalStore + ?Sized>(
    ctx: &SyncContext<'_, L>,
    zone: &ZoneId,
    pending: &mut PendingChanges,
    max_size: usize,
) -> SyncResult<ZoneBatch> {
    let mut saves: Vec<(RecordChange, u64)> = Vec::new();
    let mut deletions: Vec<(RecordKey, Vec<RecordKey>, u64)> = Vec::new();
    let mut stale: Vec<RecordKey> = Vec::new();

    for entry in pending.iter() {
        match &entry.op {
            PendingOp::Save => match ctx.local.get(&entry.key)? {
                Some(row) if row.zone == *zone => saves.push((
                    RecordChange::save(zone.clone(), entry.key.clone(), row.fields),
                    entry.revision,
                )),
                _ => stale.push(entry.key.clone()),
            },
            PendingOp::Delete { parents } => {
                deletions.push((entry.key.clone(), parents.clone(), entry.revision));
            }
        }
    }

    for key in stale {
        debug!(zone = %zone, key = %key, "dropping pending save for missing row");
        pending.remove(&key);
    }

    let mut batch = ZoneBatch::new(zone.clone());

    let save_keys: Vec<RecordKey> = saves.iter().map(|(c, _)| c.key.clone()).collect();
    let save_parents = saves
        .iter()
        .map(|(c, _)| ctx.schema.parent_keys(&c.key.table, &c.fields))
        .collect::<SyncResult<Vec<_>>>()?;
    let save_order = topological_order(&save_keys, &save_parents)?;
    let all_saves_fit = saves.len() <= max_size;

    let mut saves: Vec<Option<(RecordChange, u64)>> = saves.into_iter().map(Some).collect();
    for i in save_order.into_iter().take(max_size) {
        if let Some((change, revision)) = saves[i].take() {
            batch.push(change, revision);
        }
    }

    if all_saves_fit && !deletions.is_empty() {
        let keys: Vec<RecordKey> = deletions.iter().map(|(k, _, _)| k.clone()).collect();
        let parents: Vec<Vec<RecordKey>> = deletions.iter().map(|(_, p, _)| p.clone()).collect();
        let order = topological_order(&keys, &parents)?;
        let room = max_size - batch.len();
        for i in order.into_iter().rev().take(room) {
            let (key, _, revision) = &deletions[i];
            batch.push(RecordChange::delete(zone.clone(), key.clone()), *revision);
        }
    }

    if !batch.is_empty() {
        debug!(zone = %zone, changes = batch.len(), pending = pending.len(), "built batch");
    }
    Ok(batch)
}

/// Clears acknowledged entries from the pending queue.
///
/// An entry re-recorded after the batch was built keeps its newer revision
/// and stays pending.
pub(crate) fn record_push_results(
    pending: &mut PendingChanges,
    batch: &ZoneBatch,
    results: Vec<(RecordKey, SaveResult)>,
) -> PushOutcome {
    let mut outcome = PushOutcome::default();
    for (key, result) in results {
        match result {
            SaveResult::Saved => {
                if let Some(revision) = batch.revision(&key) {
                    pending.acknowledge(&key, revision);
                }
                outcome.saved.push(key);
            }
            SaveResult::Failed(reason) => {
                warn!(zone = %batch.zone, key = %key, reason = %reason, "remote refused change");
                outcome.failed.push((key, reason));
            }
        }
    }
    outcome
}
