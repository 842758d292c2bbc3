//! Applying fetched remote changes.
//!
//! Deletions are applied first, through the cascade. Each modification is
//! validated, merged per field with the local row, and committed if every
//! record it references is present. Otherwise it is staged in the unsynced
//! store under the first missing key. Committing a record releases the
//! staged records waiting on it, which join the same commit.

use crate::cascade::{cascade_delete, DeleteOrigin};
use crate::clock::LogicalClock;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::store::{LocalStore, Write};
use crate::unsynced::UnsyncedRecord;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};
use zonesync_protocol::{
    merge_fields, KeyValue, PendingChanges, RecordChange, RecordKey, ZoneId,
};

/// A remote record that was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    /// Record name as received.
    pub record: String,
    /// Why it was refused.
    pub reason: String,
}

/// Summary of one apply pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Keys whose local row now reflects the remote record, in commit order.
    pub committed: Vec<RecordKey>,
    /// Previously staged keys committed in this pass.
    pub replayed: Vec<RecordKey>,
    /// Keys staged in this pass, with the dependency they wait on.
    pub staged: Vec<(RecordKey, RecordKey)>,
    /// Keys deleted locally, including cascaded descendants.
    pub deleted: Vec<RecordKey>,
    /// Modifications refused as malformed.
    pub rejected: Vec<RejectedRecord>,
    /// Deletions refused because a local record still references the key.
    pub rejected_deletions: Vec<(RecordKey, RecordKey)>,
    /// Fields where both sides had changed.
    pub conflicts: usize,
    /// Records that matched the local row already.
    pub unchanged: usize,
}

impl ApplyReport {
    /// Folds another report into this one.
    pub fn absorb(&mut self, other: ApplyReport) {
        self.committed.extend(other.committed);
        self.replayed.extend(other.replayed);
        self.staged.extend(other.staged);
        self.deleted.extend(other.deleted);
        self.rejected.extend(other.rejected);
        self.rejected_deletions.extend(other.rejected_deletions);
        self.conflicts += other.conflicts;
        self.unchanged += other.unchanged;
    }

    /// Returns true if the pass changed nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Applies one page of remote changes to `zone`.
pub(crate) fn apply<L: LocalStore + ?Sized>(
    ctx: &SyncContext<'_, L>,
    zone: &ZoneId,
    pending: &mut PendingChanges,
    modifications: Vec<RecordChange>,
    deletions: Vec<RecordKey>,
) -> SyncResult<ApplyReport> {
    let mut report = ApplyReport::default();

    for key in deletions {
        match cascade_delete(ctx, zone, pending, &key, DeleteOrigin::Remote) {
            Ok(outcome) => report.deleted.extend(outcome.deleted),
            Err(SyncError::ReferenceViolation { key, referenced_by }) => {
                warn!(zone = %zone, key = %key, referenced_by = %referenced_by, "remote deletion refused");
                report.rejected_deletions.push((key, referenced_by));
            }
            Err(e) => return Err(e),
        }
    }

    for change in modifications {
        if let Err(e) = validate(ctx, zone, &change) {
            warn!(zone = %zone, record = %change.key.record_name(), error = %e, "skipping malformed record");
            report.rejected.push(rejection(&change, e));
            continue;
        }
        ctx.clock.observe(change.max_timestamp());

        let local = ctx.local.get(&change.key)?;
        if let Some(row) = &local {
            if row.zone != *zone {
                warn!(zone = %zone, key = %change.key, owner = %row.zone, "skipping record owned by another zone");
                report.rejected.push(RejectedRecord {
                    record: change.key.record_name(),
                    reason: format!("row is owned by zone {}", row.zone),
                });
                continue;
            }
        } else if pending
            .get(&change.key)
            .is_some_and(|entry| entry.op.is_delete())
        {
            debug!(zone = %zone, key = %change.key, "local deletion pending; ignoring remote save");
            continue;
        }

        // A record already staged absorbs the newer fields before it is
        // evaluated again.
        let (change, first_seen_ms) = match ctx.unsynced.get(zone, &change.key) {
            Some(staged) => {
                let merged = merge_fields(&staged.change.fields, &change.fields);
                (
                    RecordChange::save(zone.clone(), change.key, merged.fields),
                    Some(staged.first_seen_ms),
                )
            }
            None => (change, None),
        };

        // References are judged on the row as it would be committed.
        let parents = match &local {
            Some(row) => {
                let merged = merge_fields(&row.fields, &change.fields);
                ctx.schema.parent_keys(&change.key.table, &merged.fields)?
            }
            None => ctx.schema.parent_keys(&change.key.table, &change.fields)?,
        };
        match first_missing(ctx, zone, &parents, &HashSet::new())? {
            Some(missing) => {
                debug!(zone = %zone, key = %change.key, missing = %missing, "staging record");
                report.staged.push((change.key.clone(), missing.clone()));
                let mut record = UnsyncedRecord::new(change, missing);
                if let Some(ms) = first_seen_ms {
                    record.first_seen_ms = ms;
                }
                ctx.unsynced.stage(record)?;
            }
            None => commit_group(ctx, zone, change, &mut report)?,
        }
    }

    ctx.unsynced.set_clock_mark(ctx.clock.current().as_u64())?;
    Ok(report)
}

/// Commits staged records of `zone` whose dependencies are all present.
///
/// Runs at engine start so that records left staged by an interrupted pass,
/// or released by rows committed outside the engine, are not stuck.
pub(crate) fn reconcile<L: LocalStore + ?Sized>(
    ctx: &SyncContext<'_, L>,
    zone: &ZoneId,
) -> SyncResult<ApplyReport> {
    let mut report = ApplyReport::default();
    for record in ctx.unsynced.staged(zone) {
        // An earlier group in this pass may already have replayed it.
        if !ctx.unsynced.contains(zone, record.key()) {
            continue;
        }
        let parents = merged_parents(ctx, &record.change)?;
        match first_missing(ctx, zone, &parents, &HashSet::new())? {
            None => commit_group(ctx, zone, record.change, &mut report)?,
            Some(missing) if missing != record.missing => {
                ctx.unsynced.stage(UnsyncedRecord { missing, ..record })?;
            }
            Some(_) => {}
        }
    }
    Ok(report)
}

fn rejection(change: &RecordChange, error: SyncError) -> RejectedRecord {
    let reason = match error {
        SyncError::MalformedRecord { reason, .. } => reason,
        other => other.to_string(),
    };
    RejectedRecord {
        record: change.key.record_name(),
        reason,
    }
}

fn validate<L: LocalStore + ?Sized>(
    ctx: &SyncContext<'_, L>,
    zone: &ZoneId,
    change: &RecordChange,
) -> SyncResult<()> {
    let name = change.key.record_name();
    if change.zone != *zone {
        return Err(SyncError::malformed(
            name,
            format!("delivered to {zone} but belongs to {}", change.zone),
        ));
    }
    if change.is_delete() {
        return Err(SyncError::malformed(name, "deletion delivered as a modification"));
    }
    if !LogicalClock::leaves_room(change.max_timestamp()) {
        return Err(SyncError::malformed(
            name,
            "timestamp leaves no room for later writes",
        ));
    }

    let table = ctx.schema.require_table(&change.key.table)?;
    let Some(pk) = change.value(&table.primary_key) else {
        return Err(SyncError::malformed(
            name,
            format!("missing primary key column {}", table.primary_key),
        ));
    };
    let id = KeyValue::from_field(pk).map_err(|e| SyncError::malformed(&name, e.to_string()))?;
    if id != change.key.id {
        return Err(SyncError::malformed(
            name,
            format!("primary key {id} disagrees with record name"),
        ));
    }
    if let Some(column) = table
        .required
        .iter()
        .find(|c| change.value(c).map_or(true, |v| v.is_null()))
    {
        return Err(SyncError::malformed(
            name,
            format!("missing required column {column}"),
        ));
    }
    ctx.schema.parent_keys(&change.key.table, &change.fields)?;
    Ok(())
}

/// Keys `change` references once merged with its committed row, if any.
fn merged_parents<L: LocalStore + ?Sized>(
    ctx: &SyncContext<'_, L>,
    change: &RecordChange,
) -> SyncResult<Vec<RecordKey>> {
    match ctx.local.get(&change.key)? {
        Some(row) => {
            let merged = merge_fields(&row.fields, &change.fields);
            ctx.schema.parent_keys(&change.key.table, &merged.fields)
        }
        None => ctx.schema.parent_keys(&change.key.table, &change.fields),
    }
}

/// The first referenced key that is neither committed in `zone` nor in
/// `available`.
fn first_missing<L: LocalStore + ?Sized>(
    ctx: &SyncContext<'_, L>,
    zone: &ZoneId,
    parents: &[RecordKey],
    available: &HashSet<RecordKey>,
) -> SyncResult<Option<RecordKey>> {
    for parent in parents {
        if !available.contains(parent) && !ctx.local.exists(zone, parent)? {
            return Ok(Some(parent.clone()));
        }
    }
    Ok(None)
}

/// Commits `first` together with every staged record it releases.
///
/// Staged entries are removed, and records still short of a dependency are
/// re-staged under their new missing key, only after the commit succeeds.
fn commit_group<L: LocalStore + ?Sized>(
    ctx: &SyncContext<'_, L>,
    zone: &ZoneId,
    first: RecordChange,
    report: &mut ApplyReport,
) -> SyncResult<()> {
    let mut writes = Vec::new();
    let mut available: HashSet<RecordKey> = HashSet::new();
    let mut seen: HashSet<RecordKey> = HashSet::from([first.key.clone()]);
    let mut replayed: Vec<RecordKey> = Vec::new();
    let mut committed: Vec<RecordKey> = Vec::new();
    let mut conflicts = 0;
    let mut unchanged = 0;
    // missing key -> records re-evaluated in this group still waiting on it
    let mut deferred: HashMap<RecordKey, Vec<UnsyncedRecord>> = HashMap::new();
    let mut rejected: Vec<RejectedRecord> = Vec::new();

    let mut queue = VecDeque::from([first]);
    while let Some(change) = queue.pop_front() {
        let key = change.key.clone();
        if ctx.unsynced.contains(zone, &key) {
            replayed.push(key.clone());
        }

        match ctx.local.get(&key)? {
            Some(row) if row.zone != *zone => {
                rejected.push(RejectedRecord {
                    record: key.record_name(),
                    reason: format!("row is owned by zone {}", row.zone),
                });
                continue;
            }
            Some(row) => {
                let merged = merge_fields(&row.fields, &change.fields);
                conflicts += merged.conflicts.len();
                if merged.changed {
                    writes.push(Write::Upsert {
                        key: key.clone(),
                        zone: zone.clone(),
                        fields: merged.fields,
                    });
                } else {
                    unchanged += 1;
                }
            }
            None => writes.push(Write::Upsert {
                key: key.clone(),
                zone: zone.clone(),
                fields: change.fields,
            }),
        }
        available.insert(key.clone());
        committed.push(key.clone());

        let mut waiters: Vec<UnsyncedRecord> = ctx
            .unsynced
            .waiting_on(zone, &key)
            .into_iter()
            .filter(|w| seen.insert(w.key().clone()))
            .collect();
        waiters.extend(deferred.remove(&key).unwrap_or_default());
        for waiter in waiters {
            let parents = merged_parents(ctx, &waiter.change)?;
            match first_missing(ctx, zone, &parents, &available)? {
                Some(missing) => deferred
                    .entry(missing.clone())
                    .or_default()
                    .push(UnsyncedRecord { missing, ..waiter }),
                None => queue.push_back(waiter.change),
            }
        }
    }

    if !writes.is_empty() {
        ctx.local.commit(writes)?;
    }
    ctx.unsynced.remove_many(zone, &replayed)?;
    let restage: Vec<UnsyncedRecord> = deferred.into_values().flatten().collect();
    if !restage.is_empty() {
        ctx.unsynced.stage_many(restage)?;
    }

    debug!(
        zone = %zone,
        committed = committed.len(),
        replayed = replayed.len(),
        "committed group"
    );
    for r in &rejected {
        warn!(zone = %zone, record = %r.record, reason = %r.reason, "skipping staged record");
    }
    report.committed.extend(committed);
    report.replayed.extend(replayed);
    report.rejected.extend(rejected);
    report.conflicts += conflicts;
    report.unchanged += unchanged;
    Ok(())
}
