//! The remote object store, as seen by the engine.

use crate::error::{SyncError, SyncResult};
use crate::schema::SchemaGraph;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use zonesync_protocol::{
    merge_fields, ChangeToken, FailureReason, FetchResult, FieldMap, Operation, RecordChange,
    RecordKey, SaveResult, ZoneId,
};

/// The remote store the engine uploads to and fetches from.
///
/// Failures to reach the store are [`SyncError::Transport`]; per-record
/// refusals are reported as [`SaveResult::Failed`].
pub trait RemoteStore: Send + Sync {
    /// Uploads a batch. Returns one result per change, in batch order.
    fn push(&self, zone: &ZoneId, batch: &[RecordChange])
        -> SyncResult<Vec<(RecordKey, SaveResult)>>;

    /// Fetches changes made since `since` (everything when `None`).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownZone`] if the zone was deleted remotely.
    fn fetch(&self, zone: &ZoneId, since: Option<&ChangeToken>) -> SyncResult<FetchResult>;

    /// Creates a zone. Creating an existing zone is a no-op.
    fn create_zone(&self, zone: &ZoneId) -> SyncResult<()>;

    /// Deletes a zone and everything in it.
    fn delete_zone(&self, zone: &ZoneId) -> SyncResult<()>;
}

#[derive(Debug, Default)]
struct RemoteZone {
    records: BTreeMap<RecordKey, FieldMap>,
    // seq -> (key, deleted)
    changes: BTreeMap<u64, (RecordKey, bool)>,
    latest: HashMap<RecordKey, u64>,
    seq: u64,
}

impl RemoteZone {
    fn note_change(&mut self, key: &RecordKey, deleted: bool) {
        self.seq += 1;
        if let Some(old) = self.latest.insert(key.clone(), self.seq) {
            self.changes.remove(&old);
        }
        self.changes.insert(self.seq, (key.clone(), deleted));
    }

    /// First stored record other than those in `excluding` referencing `key`.
    fn referrer(
        &self,
        schema: &SchemaGraph,
        key: &RecordKey,
        excluding: &BTreeSet<RecordKey>,
    ) -> Option<RecordKey> {
        let target = key.id.to_field();
        schema.dependents_of(&key.table).iter().find_map(|dep| {
            self.records
                .iter()
                .find(|(k, fields)| {
                    k.table == dep.table
                        && !excluding.contains(*k)
                        && fields.get(&dep.column).is_some_and(|f| f.value == target)
                })
                .map(|(k, _)| k.clone())
        })
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    zones: BTreeMap<ZoneId, RemoteZone>,
    failures: VecDeque<SyncError>,
    page_limit: Option<usize>,
    pushes: usize,
}

/// In-memory [`RemoteStore`] with change tokens and reference checks.
///
/// Saves merge field by field, like a second replica would. Deleting a
/// record that a stored record still references is refused with
/// [`FailureReason::ReferenceViolation`].
pub struct MemoryRemote {
    schema: Arc<SchemaGraph>,
    state: Mutex<RemoteState>,
}

impl MemoryRemote {
    /// Creates an empty remote for `schema`.
    pub fn new(schema: Arc<SchemaGraph>) -> Self {
        Self {
            schema,
            state: Mutex::new(RemoteState::default()),
        }
    }

    /// Makes the next push or fetch fail with `error`.
    pub fn inject_failure(&self, error: SyncError) {
        self.state.lock().failures.push_back(error);
    }

    /// Limits how many changes one fetch returns.
    pub fn set_page_limit(&self, limit: usize) {
        self.state.lock().page_limit = Some(limit.max(1));
    }

    /// Returns true if the zone exists.
    pub fn has_zone(&self, zone: &ZoneId) -> bool {
        self.state.lock().zones.contains_key(zone)
    }

    /// Returns a stored record.
    pub fn record(&self, zone: &ZoneId, key: &RecordKey) -> Option<FieldMap> {
        self.state
            .lock()
            .zones
            .get(zone)
            .and_then(|z| z.records.get(key).cloned())
    }

    /// Every stored record in a zone.
    pub fn records(&self, zone: &ZoneId) -> BTreeMap<RecordKey, FieldMap> {
        self.state
            .lock()
            .zones
            .get(zone)
            .map(|z| z.records.clone())
            .unwrap_or_default()
    }

    /// Number of push calls served.
    pub fn push_count(&self) -> usize {
        self.state.lock().pushes
    }

    fn take_failure(state: &mut RemoteState) -> SyncResult<()> {
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl RemoteStore for MemoryRemote {
    fn push(
        &self,
        zone: &ZoneId,
        batch: &[RecordChange],
    ) -> SyncResult<Vec<(RecordKey, SaveResult)>> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state)?;
        state.pushes += 1;

        let Some(remote) = state.zones.get_mut(zone) else {
            return Ok(batch
                .iter()
                .map(|c| (c.key.clone(), SaveResult::Failed(FailureReason::ZoneNotFound)))
                .collect());
        };

        let mut results: HashMap<RecordKey, SaveResult> = HashMap::new();

        for change in batch.iter().filter(|c| c.operation == Operation::Save) {
            let existing = remote.records.get(&change.key).cloned().unwrap_or_default();
            let merged = merge_fields(&existing, &change.fields);
            if merged.changed || !remote.records.contains_key(&change.key) {
                remote.records.insert(change.key.clone(), merged.fields);
                remote.note_change(&change.key, false);
            }
            results.insert(change.key.clone(), SaveResult::Saved);
        }

        // A deletion is refused while a record outside the deleted set still
        // points at it. Refusals shrink the set, so iterate to a fixed point.
        let mut deleting: BTreeSet<RecordKey> = batch
            .iter()
            .filter(|c| c.operation == Operation::Delete)
            .map(|c| c.key.clone())
            .collect();
        loop {
            let refused: Vec<(RecordKey, RecordKey)> = deleting
                .iter()
                .filter_map(|key| {
                    remote
                        .referrer(&self.schema, key, &deleting)
                        .map(|by| (key.clone(), by))
                })
                .collect();
            if refused.is_empty() {
                break;
            }
            for (key, referenced_by) in refused {
                deleting.remove(&key);
                results.insert(
                    key,
                    SaveResult::Failed(FailureReason::ReferenceViolation { referenced_by }),
                );
            }
        }
        for key in deleting {
            if remote.records.remove(&key).is_some() {
                remote.note_change(&key, true);
            }
            results.insert(key, SaveResult::Saved);
        }

        Ok(batch
            .iter()
            .map(|c| {
                let result = results.get(&c.key).cloned().unwrap_or(SaveResult::Saved);
                (c.key.clone(), result)
            })
            .collect())
    }

    fn fetch(&self, zone: &ZoneId, since: Option<&ChangeToken>) -> SyncResult<FetchResult> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state)?;
        let limit = state.page_limit.unwrap_or(usize::MAX);

        let remote = state
            .zones
            .get(zone)
            .ok_or_else(|| SyncError::UnknownZone(zone.clone()))?;

        let after = match since {
            Some(token) => decode_token(token)?,
            None => 0,
        };

        let mut result = FetchResult::default();
        let mut last = after;
        let mut pending = remote.changes.range(after + 1..).peekable();
        let mut taken = 0;
        while taken < limit {
            let Some((seq, (key, deleted))) = pending.next() else {
                break;
            };
            if *deleted {
                result.deletions.push(key.clone());
            } else if let Some(fields) = remote.records.get(key) {
                result
                    .modifications
                    .push(RecordChange::save(zone.clone(), key.clone(), fields.clone()));
            }
            last = *seq;
            taken += 1;
        }
        result.has_more = pending.peek().is_some();
        if !result.has_more {
            last = last.max(remote.seq);
        }
        result.new_token = Some(ChangeToken::new(last.to_le_bytes().to_vec()));
        Ok(result)
    }

    fn create_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state)?;
        state.zones.entry(zone.clone()).or_default();
        Ok(())
    }

    fn delete_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state)?;
        state.zones.remove(zone);
        Ok(())
    }
}

fn decode_token(token: &ChangeToken) -> SyncResult<u64> {
    let bytes: [u8; 8] = token
        .as_bytes()
        .try_into()
        .map_err(|_| SyncError::transport_fatal(format!("unrecognized change token {token}")))?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DeleteAction, ForeignKey, TableSchema};
    use zonesync_protocol::LogicalTimestamp;

    fn remote() -> MemoryRemote {
        let schema = SchemaGraph::new(vec![
            TableSchema::new("lists", "id"),
            TableSchema::new("reminders", "id").foreign_key(ForeignKey::new(
                "listID",
                "lists",
                "id",
                DeleteAction::Cascade,
            )),
        ])
        .unwrap();
        MemoryRemote::new(Arc::new(schema))
    }

    fn zone() -> ZoneId {
        ZoneId::private("zone")
    }

    fn list(id: i64, title: &str, ts: u64) -> RecordChange {
        RecordChange::save(zone(), RecordKey::new("lists", id), FieldMap::new())
            .with_field("id", id, LogicalTimestamp::new(1))
            .with_field("title", title, LogicalTimestamp::new(ts))
    }

    fn reminder(id: i64, list: i64) -> RecordChange {
        RecordChange::save(zone(), RecordKey::new("reminders", id), FieldMap::new())
            .with_field("id", id, LogicalTimestamp::new(1))
            .with_field("listID", list, LogicalTimestamp::new(1))
    }

    #[test]
    fn push_to_missing_zone_reports_zone_not_found() {
        let remote = remote();
        let results = remote.push(&zone(), &[list(1, "a", 1)]).unwrap();
        assert_eq!(
            results[0].1,
            SaveResult::Failed(FailureReason::ZoneNotFound)
        );
        assert!(matches!(
            remote.fetch(&zone(), None),
            Err(SyncError::UnknownZone(_))
        ));
    }

    #[test]
    fn fetch_follows_tokens() {
        let remote = remote();
        remote.create_zone(&zone()).unwrap();
        remote.push(&zone(), &[list(1, "a", 1), list(2, "b", 1)]).unwrap();

        let first = remote.fetch(&zone(), None).unwrap();
        assert_eq!(first.modifications.len(), 2);
        let token = first.new_token.unwrap();

        assert!(remote.fetch(&zone(), Some(&token)).unwrap().is_empty());

        remote
            .push(&zone(), &[RecordChange::delete(zone(), RecordKey::new("lists", 2))])
            .unwrap();
        let next = remote.fetch(&zone(), Some(&token)).unwrap();
        assert!(next.modifications.is_empty());
        assert_eq!(next.deletions, vec![RecordKey::new("lists", 2)]);
    }

    #[test]
    fn paged_fetch_sets_has_more() {
        let remote = remote();
        remote.create_zone(&zone()).unwrap();
        remote.set_page_limit(1);
        remote.push(&zone(), &[list(1, "a", 1), list(2, "b", 1)]).unwrap();

        let page = remote.fetch(&zone(), None).unwrap();
        assert!(page.has_more);
        let page = remote.fetch(&zone(), page.new_token.as_ref()).unwrap();
        assert!(!page.has_more);
        assert_eq!(page.modifications[0].key, RecordKey::new("lists", 2));
    }

    #[test]
    fn saves_merge_per_field() {
        let remote = remote();
        remote.create_zone(&zone()).unwrap();
        remote.push(&zone(), &[list(1, "newer", 5)]).unwrap();
        remote.push(&zone(), &[list(1, "older", 3)]).unwrap();
        let stored = remote.record(&zone(), &RecordKey::new("lists", 1)).unwrap();
        assert_eq!(stored["title"].value.as_text(), Some("newer"));
    }

    #[test]
    fn referenced_delete_is_refused() {
        let remote = remote();
        remote.create_zone(&zone()).unwrap();
        remote.push(&zone(), &[list(1, "a", 1), reminder(1, 1)]).unwrap();

        let results = remote
            .push(&zone(), &[RecordChange::delete(zone(), RecordKey::new("lists", 1))])
            .unwrap();
        assert_eq!(
            results[0].1,
            SaveResult::Failed(FailureReason::ReferenceViolation {
                referenced_by: RecordKey::new("reminders", 1)
            })
        );

        // Deleting child and parent together succeeds.
        let results = remote
            .push(
                &zone(),
                &[
                    RecordChange::delete(zone(), RecordKey::new("reminders", 1)),
                    RecordChange::delete(zone(), RecordKey::new("lists", 1)),
                ],
            )
            .unwrap();
        assert!(results.iter().all(|(_, r)| r.is_saved()));
        assert!(remote.records(&zone()).is_empty());
    }

    #[test]
    fn injected_failure_is_returned_once() {
        let remote = remote();
        remote.create_zone(&zone()).unwrap();
        remote.inject_failure(SyncError::transport_retryable("offline"));
        assert!(remote.fetch(&zone(), None).unwrap_err().is_retryable());
        assert!(remote.fetch(&zone(), None).is_ok());
    }
}
