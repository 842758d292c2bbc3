//! Per-zone queue of local changes awaiting upload.

use crate::types::RecordKey;
use std::collections::{BTreeMap, HashMap};

/// What must be sent for a pending key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PendingOp {
    /// Upload the current local row.
    Save,
    /// Upload a deletion.
    Delete {
        /// Keys the row referenced when it was deleted. Used to send
        /// deletions leaf-to-root once the row itself is gone.
        parents: Vec<RecordKey>,
    },
}

impl PendingOp {
    /// Returns true for deletions.
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }
}

/// An entry in the pending queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Record key.
    pub key: RecordKey,
    /// Operation to send.
    pub op: PendingOp,
    /// Bumped on every re-record of the key.
    pub revision: u64,
    /// Queue position, fixed when the key was first recorded.
    pub position: u64,
}

/// Pending local changes for one zone.
///
/// # Invariants
///
/// - At most one entry per key
/// - Re-recording a key replaces its op in place and keeps its position
/// - Iteration follows first-recorded order
#[derive(Debug, Default)]
pub struct PendingChanges {
    by_key: HashMap<RecordKey, PendingEntry>,
    order: BTreeMap<u64, RecordKey>,
    next_position: u64,
    next_revision: u64,
}

impl PendingChanges {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `key` must be saved. Returns the new revision.
    pub fn record_save(&mut self, key: RecordKey) -> u64 {
        self.record(key, PendingOp::Save)
    }

    /// Records that `key` must be deleted. Returns the new revision.
    pub fn record_delete(&mut self, key: RecordKey, parents: Vec<RecordKey>) -> u64 {
        self.record(key, PendingOp::Delete { parents })
    }

    fn record(&mut self, key: RecordKey, op: PendingOp) -> u64 {
        self.next_revision += 1;
        let revision = self.next_revision;

        if let Some(entry) = self.by_key.get_mut(&key) {
            entry.op = op;
            entry.revision = revision;
            return revision;
        }

        let position = self.next_position;
        self.next_position += 1;
        self.order.insert(position, key.clone());
        self.by_key.insert(
            key.clone(),
            PendingEntry {
                key,
                op,
                revision,
                position,
            },
        );
        revision
    }

    /// Removes a key regardless of revision.
    pub fn remove(&mut self, key: &RecordKey) -> Option<PendingEntry> {
        let entry = self.by_key.remove(key)?;
        self.order.remove(&entry.position);
        Some(entry)
    }

    /// Removes `key` if its revision is still `revision`.
    ///
    /// Returns false if the key was re-recorded since, or is not pending.
    pub fn acknowledge(&mut self, key: &RecordKey, revision: u64) -> bool {
        match self.by_key.get(key) {
            Some(entry) if entry.revision == revision => {
                self.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Returns the entry for a key.
    pub fn get(&self, key: &RecordKey) -> Option<&PendingEntry> {
        self.by_key.get(key)
    }

    /// Returns true if the key is pending.
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Iterates entries in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.order.values().filter_map(|key| self.by_key.get(key))
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.by_key.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64) -> RecordKey {
        RecordKey::new("reminders", id)
    }

    #[test]
    fn keeps_first_recorded_order() {
        let mut pending = PendingChanges::new();
        pending.record_save(key(3));
        pending.record_save(key(1));
        pending.record_delete(key(2), Vec::new());

        let keys: Vec<_> = pending.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![key(3), key(1), key(2)]);
        assert_eq!(pending.len(), 3);
    }

    #[test]
    fn rerecord_replaces_op_in_place() {
        let mut pending = PendingChanges::new();
        pending.record_save(key(1));
        pending.record_save(key(2));
        let first = pending.get(&key(1)).unwrap().revision;

        let second = pending.record_delete(key(1), vec![key(9)]);
        assert!(second > first);

        let entries: Vec<_> = pending.iter().collect();
        assert_eq!(entries[0].key, key(1));
        assert_eq!(
            entries[0].op,
            PendingOp::Delete {
                parents: vec![key(9)]
            }
        );
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn acknowledge_requires_matching_revision() {
        let mut pending = PendingChanges::new();
        let stale = pending.record_save(key(1));
        let fresh = pending.record_save(key(1));

        assert!(!pending.acknowledge(&key(1), stale));
        assert!(pending.contains(&key(1)));
        assert!(pending.acknowledge(&key(1), fresh));
        assert!(pending.is_empty());
        assert!(!pending.acknowledge(&key(1), fresh));
    }

    #[test]
    fn remove_and_clear() {
        let mut pending = PendingChanges::new();
        pending.record_save(key(1));
        pending.record_save(key(2));
        assert_eq!(pending.remove(&key(1)).map(|e| e.op), Some(PendingOp::Save));
        assert!(pending.remove(&key(1)).is_none());
        assert_eq!(pending.iter().count(), 1);
        pending.clear();
        assert!(pending.is_empty());
        assert_eq!(pending.iter().count(), 0);
    }
}
