//! Cascading-delete propagation.
//!
//! A deletion is expanded breadth-first over the rows that reference it:
//! cascade children join the deletion set, set-null children get the column
//! nulled, and no-action children refuse the deletion unless they are being
//! deleted in the same pass. The set is removed leaf-to-root in a single
//! local commit, and staged records that can no longer resolve are dropped.

use crate::context::{max_timestamp, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::order::topological_order;
use crate::schema::DeleteAction;
use crate::store::{LocalStore, Write};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::debug;
use zonesync_protocol::{Field, FieldMap, FieldValue, PendingChanges, RecordKey, ZoneId};

/// Where a deletion came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOrigin {
    /// The user deleted the row locally. Every deleted key is uploaded.
    Local,
    /// The remote already dropped the root. Only descendants are uploaded.
    Remote,
}

/// What a cascade will do, computed before anything is written.
#[derive(Debug, Default)]
pub(crate) struct CascadePlan {
    /// Keys to delete, leaf-to-root, each with the keys its row references.
    pub deletions: Vec<(RecordKey, Vec<RecordKey>)>,
    /// Rows surviving with some reference columns nulled, with their new fields.
    pub nulled: Vec<(RecordKey, FieldMap)>,
}

/// Result of an executed cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeOutcome {
    /// Deleted keys in deletion order.
    pub deleted: Vec<RecordKey>,
    /// Rows whose references were nulled.
    pub nulled: Vec<RecordKey>,
    /// Staged records discarded because they or their dependency are gone.
    pub discarded: Vec<RecordKey>,
}

/// Computes the deletion set rooted at `root`.
///
/// An absent root, or one owned by another zone, yields an empty plan.
///
/// # Errors
///
/// Returns [`SyncError::ReferenceViolation`] if a no-action reference would
/// be left dangling.
pub(crate) fn plan<L: LocalStore + ?Sized>(
    ctx: &SyncContext<'_, L>,
    zone: &ZoneId,
    root: &RecordKey,
) -> SyncResult<CascadePlan> {
    let Some(root_row) = ctx.local.get(root)?.filter(|row| row.zone == *zone) else {
        return Ok(CascadePlan::default());
    };

    let mut set = vec![root.clone()];
    let mut rows: BTreeMap<RecordKey, FieldMap> = BTreeMap::from([(root.clone(), root_row.fields)]);
    let mut in_set: HashSet<RecordKey> = HashSet::from([root.clone()]);
    let mut set_null: Vec<(RecordKey, String)> = Vec::new();
    let mut no_action: Vec<(RecordKey, RecordKey)> = Vec::new();

    let mut queue = VecDeque::from([root.clone()]);
    while let Some(key) = queue.pop_front() {
        for dep in ctx.schema.dependents_of(&key.table) {
            for child in ctx
                .local
                .dependents_of(zone, &dep.table, &dep.column, &key.id)?
            {
                match dep.on_delete {
                    DeleteAction::Cascade => {
                        if in_set.insert(child.clone()) {
                            if let Some(row) = ctx.local.get(&child)? {
                                rows.insert(child.clone(), row.fields);
                            }
                            set.push(child.clone());
                            queue.push_back(child);
                        }
                    }
                    DeleteAction::SetNull => set_null.push((child, dep.column.clone())),
                    DeleteAction::NoAction => no_action.push((key.clone(), child)),
                }
            }
        }
    }

    if let Some((key, referenced_by)) = no_action
        .into_iter()
        .find(|(_, child)| !in_set.contains(child))
    {
        return Err(SyncError::ReferenceViolation { key, referenced_by });
    }

    let mut nulled: BTreeMap<RecordKey, FieldMap> = BTreeMap::new();
    for (child, column) in set_null {
        if in_set.contains(&child) {
            continue;
        }
        let fields = match nulled.remove(&child) {
            Some(fields) => fields,
            None => match ctx.local.get(&child)? {
                Some(row) => row.fields,
                None => continue,
            },
        };
        let ts = ctx.clock.tick_after(max_timestamp(&fields))?;
        let mut fields = fields;
        fields.insert(column, Field::new(FieldValue::Null, ts));
        nulled.insert(child, fields);
    }

    let parents = set
        .iter()
        .map(|key| match rows.get(key) {
            Some(fields) => ctx.schema.parent_keys(&key.table, fields),
            None => Ok(Vec::new()),
        })
        .collect::<SyncResult<Vec<_>>>()?;
    let order = topological_order(&set, &parents)?;

    Ok(CascadePlan {
        deletions: order
            .into_iter()
            .rev()
            .map(|i| (set[i].clone(), parents[i].clone()))
            .collect(),
        nulled: nulled.into_iter().collect(),
    })
}

/// Deletes `root` and everything that cascades from it, in one commit.
///
/// Pending uploads are updated according to `origin`. Staged records whose
/// key was deleted, or which wait on a deleted or discarded key, are removed
/// from the unsynced store.
pub(crate) fn cascade_delete<L: LocalStore + ?Sized>(
    ctx: &SyncContext<'_, L>,
    zone: &ZoneId,
    pending: &mut PendingChanges,
    root: &RecordKey,
    origin: DeleteOrigin,
) -> SyncResult<CascadeOutcome> {
    let plan = plan(ctx, zone, root)?;

    let mut writes: Vec<Write> = plan
        .nulled
        .iter()
        .map(|(key, fields)| Write::Upsert {
            key: key.clone(),
            zone: zone.clone(),
            fields: fields.clone(),
        })
        .collect();
    writes.extend(plan.deletions.iter().map(|(key, _)| Write::Delete(key.clone())));
    if !writes.is_empty() {
        ctx.local.commit(writes)?;
    }

    let mut outcome = CascadeOutcome {
        deleted: plan.deletions.iter().map(|(k, _)| k.clone()).collect(),
        nulled: plan.nulled.iter().map(|(k, _)| k.clone()).collect(),
        discarded: Vec::new(),
    };

    for (key, parents) in plan.deletions {
        if origin == DeleteOrigin::Remote && key == *root {
            pending.remove(&key);
        } else {
            pending.record_delete(key, parents);
        }
    }
    if origin == DeleteOrigin::Remote {
        // Nothing was committed for an absent root, but a pending save for it
        // must still not resurrect it remotely.
        pending.remove(root);
    }
    for key in &outcome.nulled {
        pending.record_save(key.clone());
    }

    outcome.discarded = discard_staged(ctx, zone, &outcome.deleted, root)?;

    debug!(
        zone = %zone,
        root = %root,
        deleted = outcome.deleted.len(),
        nulled = outcome.nulled.len(),
        discarded = outcome.discarded.len(),
        "cascade applied"
    );
    Ok(outcome)
}

/// Removes staged records made unresolvable by deleting `deleted` and `root`.
fn discard_staged<L: LocalStore + ?Sized>(
    ctx: &SyncContext<'_, L>,
    zone: &ZoneId,
    deleted: &[RecordKey],
    root: &RecordKey,
) -> SyncResult<Vec<RecordKey>> {
    let mut gone: HashSet<RecordKey> = deleted.iter().cloned().collect();
    gone.insert(root.clone());
    let mut queue: VecDeque<RecordKey> = gone.iter().cloned().collect();
    let mut discard = Vec::new();

    while let Some(key) = queue.pop_front() {
        if ctx.unsynced.contains(zone, &key) {
            discard.push(key.clone());
        }
        for waiter in ctx.unsynced.waiting_on(zone, &key) {
            if gone.insert(waiter.key().clone()) {
                queue.push_back(waiter.key().clone());
            }
        }
    }

    let removed = ctx.unsynced.remove_many(zone, &discard)?;
    Ok(removed.into_iter().map(|r| r.change.key).collect())
}
