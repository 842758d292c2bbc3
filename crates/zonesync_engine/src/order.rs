//! Dependency ordering over a candidate set of records.

use crate::error::{SyncError, SyncResult};
use std::collections::{BTreeSet, HashMap};
use zonesync_protocol::RecordKey;

/// Orders `keys` so that every key comes after the keys it depends on.
///
/// `parents[i]` lists the keys `keys[i]` depends on; parents outside the
/// candidate set are ignored. Among records that are ready at the same time
/// the one earlier in `keys` goes first. Returns indices into `keys`.
///
/// # Errors
///
/// Returns [`SyncError::DependencyCycle`] naming the records left over when
/// no further record is ready.
pub fn topological_order(keys: &[RecordKey], parents: &[Vec<RecordKey>]) -> SyncResult<Vec<usize>> {
    let index: HashMap<&RecordKey, usize> = keys.iter().enumerate().map(|(i, k)| (k, i)).collect();

    let mut blocked_by = vec![0usize; keys.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); keys.len()];
    for (child, deps) in parents.iter().enumerate() {
        let mut seen = BTreeSet::new();
        for parent in deps {
            if let Some(&p) = index.get(parent) {
                if p != child && seen.insert(p) {
                    blocked_by[child] += 1;
                    children[p].push(child);
                }
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..keys.len()).filter(|&i| blocked_by[i] == 0).collect();
    let mut order = Vec::with_capacity(keys.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &child in &children[next] {
            blocked_by[child] -= 1;
            if blocked_by[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if order.len() < keys.len() {
        let placed: BTreeSet<usize> = order.iter().copied().collect();
        return Err(SyncError::DependencyCycle {
            keys: (0..keys.len())
                .filter(|i| !placed.contains(i))
                .map(|i| keys[i].clone())
                .collect(),
        });
    }
    Ok(order)
}
