//! Durable staging area for records that could not be committed yet.
//!
//! State lives in an append-only log on a [`StorageBackend`]. Each entry is
//! framed as:
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | CBOR payload | crc32 (4) |
//! ```
//!
//! The checksum covers header and payload. On open the log is replayed into
//! memory; a torn final frame is cut off. When dead entries outnumber the
//! compaction threshold the log is rewritten with only live state.
//!
//! Besides staged records the log keeps the engine's registered zones, each
//! zone's change token and the logical clock's high-water mark.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use zonesync_protocol::{ChangeToken, RecordChange, RecordKey, ZoneId};
use zonesync_storage::StorageBackend;

const LOG_MAGIC: [u8; 4] = *b"ZSUL";
const LOG_VERSION: u16 = 1;
const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// A record waiting for a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsyncedRecord {
    /// The change as received. Its `zone` owns the staged entry.
    pub change: RecordChange,
    /// The first dependency found missing.
    pub missing: RecordKey,
    /// Wall-clock milliseconds when the record was first staged.
    pub first_seen_ms: u64,
}

impl UnsyncedRecord {
    /// Creates a staged record first seen now.
    pub fn new(change: RecordChange, missing: RecordKey) -> Self {
        let first_seen_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self {
            change,
            missing,
            first_seen_ms,
        }
    }

    /// The staged record's key.
    pub fn key(&self) -> &RecordKey {
        &self.change.key
    }

    /// The owning zone.
    pub fn zone(&self) -> &ZoneId {
        &self.change.zone
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogEntry {
    Zone { zone: ZoneId },
    Stage(UnsyncedRecord),
    Remove { zone: ZoneId, key: RecordKey },
    Token { zone: ZoneId, token: Option<ChangeToken> },
    DropZone { zone: ZoneId },
    Clock { high_water: u64 },
}

impl LogEntry {
    fn type_byte(&self) -> u8 {
        match self {
            LogEntry::Zone { .. } => 1,
            LogEntry::Stage(_) => 2,
            LogEntry::Remove { .. } => 3,
            LogEntry::Token { .. } => 4,
            LogEntry::DropZone { .. } => 5,
            LogEntry::Clock { .. } => 6,
        }
    }

    fn encode_frame(&self, out: &mut Vec<u8>) -> SyncResult<()> {
        let mut payload = Vec::new();
        ciborium::into_writer(self, &mut payload).map_err(|e| SyncError::Codec(e.to_string()))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| SyncError::Codec("log entry too large".into()))?;

        let start = out.len();
        out.extend_from_slice(&LOG_MAGIC);
        out.extend_from_slice(&LOG_VERSION.to_le_bytes());
        out.push(self.type_byte());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&payload);
        let crc = crc32fast::hash(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }
}

enum Frame {
    Entry(LogEntry, usize),
    /// Incomplete or checksum-failed final frame.
    Torn,
    End,
}

fn read_frame(data: &[u8], offset: usize) -> SyncResult<Frame> {
    let remaining = data.len() - offset;
    if remaining == 0 {
        return Ok(Frame::End);
    }
    if remaining < HEADER_SIZE {
        return Ok(Frame::Torn);
    }

    let header = &data[offset..offset + HEADER_SIZE];
    if header[0..4] != LOG_MAGIC {
        return Err(SyncError::Codec(format!("invalid magic at offset {offset}")));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > LOG_VERSION {
        return Err(SyncError::Codec(format!(
            "unsupported log version {version} at offset {offset}"
        )));
    }
    let type_byte = header[6];
    let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

    let total = HEADER_SIZE + len + CRC_SIZE;
    if remaining < total {
        return Ok(Frame::Torn);
    }

    let payload_end = offset + HEADER_SIZE + len;
    let stored = u32::from_le_bytes([
        data[payload_end],
        data[payload_end + 1],
        data[payload_end + 2],
        data[payload_end + 3],
    ]);
    let computed = crc32fast::hash(&data[offset..payload_end]);
    if stored != computed {
        if offset + total == data.len() {
            return Ok(Frame::Torn);
        }
        return Err(SyncError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }

    let entry: LogEntry = ciborium::from_reader(&data[offset + HEADER_SIZE..payload_end])
        .map_err(|e| SyncError::Codec(format!("bad entry at offset {offset}: {e}")))?;
    if entry.type_byte() != type_byte {
        return Err(SyncError::Codec(format!(
            "entry type {type_byte} does not match payload at offset {offset}"
        )));
    }
    Ok(Frame::Entry(entry, total))
}

#[derive(Debug, Default)]
struct LogState {
    zones: BTreeSet<ZoneId>,
    staged: HashMap<ZoneId, BTreeMap<RecordKey, UnsyncedRecord>>,
    // zone -> missing key -> staged keys waiting on it
    waiting: HashMap<ZoneId, HashMap<RecordKey, BTreeSet<RecordKey>>>,
    tokens: HashMap<ZoneId, ChangeToken>,
    clock: u64,
    entries: usize,
}

impl LogState {
    fn apply(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Zone { zone } => {
                self.zones.insert(zone);
            }
            LogEntry::Stage(record) => {
                let zone = record.zone().clone();
                let key = record.key().clone();
                self.unindex(&zone, &key);
                self.waiting
                    .entry(zone.clone())
                    .or_default()
                    .entry(record.missing.clone())
                    .or_default()
                    .insert(key.clone());
                self.staged.entry(zone).or_default().insert(key, record);
            }
            LogEntry::Remove { zone, key } => {
                self.unindex(&zone, &key);
                if let Some(records) = self.staged.get_mut(&zone) {
                    records.remove(&key);
                }
            }
            LogEntry::Token { zone, token } => match token {
                Some(token) => {
                    self.tokens.insert(zone, token);
                }
                None => {
                    self.tokens.remove(&zone);
                }
            },
            LogEntry::DropZone { zone } => {
                self.zones.remove(&zone);
                self.staged.remove(&zone);
                self.waiting.remove(&zone);
                self.tokens.remove(&zone);
            }
            LogEntry::Clock { high_water } => {
                self.clock = self.clock.max(high_water);
            }
        }
    }

    fn unindex(&mut self, zone: &ZoneId, key: &RecordKey) {
        let Some(previous) = self.staged.get(zone).and_then(|r| r.get(key)) else {
            return;
        };
        let missing = previous.missing.clone();
        if let Some(index) = self.waiting.get_mut(zone) {
            if let Some(keys) = index.get_mut(&missing) {
                keys.remove(key);
                if keys.is_empty() {
                    index.remove(&missing);
                }
            }
        }
    }

    fn staged_count(&self) -> usize {
        self.staged.values().map(BTreeMap::len).sum()
    }

    fn live_entries(&self) -> usize {
        self.zones.len() + self.staged_count() + self.tokens.len() + usize::from(self.clock > 0)
    }

    fn snapshot(&self) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = self
            .zones
            .iter()
            .map(|zone| LogEntry::Zone { zone: zone.clone() })
            .collect();
        if self.clock > 0 {
            entries.push(LogEntry::Clock {
                high_water: self.clock,
            });
        }
        entries.extend(self.tokens.iter().map(|(zone, token)| LogEntry::Token {
            zone: zone.clone(),
            token: Some(token.clone()),
        }));
        entries.extend(
            self.staged
                .values()
                .flat_map(BTreeMap::values)
                .cloned()
                .map(LogEntry::Stage),
        );
        entries
    }
}

struct Inner {
    backend: Box<dyn StorageBackend>,
    state: LogState,
}

/// The durable unsynced-record store.
///
/// Keyed by (zone, table, primary key). Also indexes staged records by the
/// dependency they wait on.
pub struct UnsyncedStore {
    inner: Mutex<Inner>,
    sync_on_write: bool,
    compaction_threshold: usize,
}

impl UnsyncedStore {
    /// Opens the store, replaying the log.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors and on corruption anywhere but the final frame.
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
        compaction_threshold: usize,
    ) -> SyncResult<Self> {
        let data = backend.read_all()?;
        let mut state = LogState::default();
        let mut offset = 0;

        loop {
            match read_frame(&data, offset)? {
                Frame::Entry(entry, len) => {
                    state.apply(entry);
                    state.entries += 1;
                    offset += len;
                }
                Frame::Torn => {
                    warn!(
                        offset,
                        size = data.len(),
                        "truncating torn tail of unsynced log"
                    );
                    backend.truncate(offset as u64)?;
                    backend.sync()?;
                    break;
                }
                Frame::End => break,
            }
        }

        debug!(
            entries = state.entries,
            staged = state.staged_count(),
            zones = state.zones.len(),
            "opened unsynced log"
        );

        Ok(Self {
            inner: Mutex::new(Inner { backend, state }),
            sync_on_write,
            compaction_threshold,
        })
    }

    fn write(&self, entries: Vec<LogEntry>) -> SyncResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut data = Vec::new();
        for entry in &entries {
            entry.encode_frame(&mut data)?;
        }

        let mut inner = self.inner.lock();
        inner.backend.append(&data)?;
        if self.sync_on_write {
            inner.backend.sync()?;
        } else {
            inner.backend.flush()?;
        }
        inner.state.entries += entries.len();
        for entry in entries {
            inner.state.apply(entry);
        }

        let dead = inner.state.entries.saturating_sub(inner.state.live_entries());
        if dead > self.compaction_threshold {
            Self::compact_locked(&mut inner)?;
        }
        Ok(())
    }

    fn compact_locked(inner: &mut Inner) -> SyncResult<()> {
        let entries = inner.state.snapshot();
        let mut data = Vec::new();
        for entry in &entries {
            entry.encode_frame(&mut data)?;
        }
        let before = inner.state.entries;
        inner.backend.replace(&data)?;
        inner.state.entries = entries.len();
        debug!(before, after = entries.len(), "compacted unsynced log");
        Ok(())
    }

    /// Rewrites the log with only live entries.
    pub fn compact(&self) -> SyncResult<()> {
        Self::compact_locked(&mut self.inner.lock())
    }

    /// Stages a record, replacing any entry for the same key.
    pub fn stage(&self, record: UnsyncedRecord) -> SyncResult<()> {
        self.write(vec![LogEntry::Stage(record)])
    }

    /// Stages several records in one write.
    pub fn stage_many(&self, records: Vec<UnsyncedRecord>) -> SyncResult<()> {
        self.write(records.into_iter().map(LogEntry::Stage).collect())
    }

    /// Removes a staged record.
    pub fn remove(&self, zone: &ZoneId, key: &RecordKey) -> SyncResult<Option<UnsyncedRecord>> {
        Ok(self.remove_many(zone, std::slice::from_ref(key))?.pop())
    }

    /// Removes several staged records in one write. Returns those that existed.
    pub fn remove_many(
        &self,
        zone: &ZoneId,
        keys: &[RecordKey],
    ) -> SyncResult<Vec<UnsyncedRecord>> {
        let removed: Vec<UnsyncedRecord> = {
            let inner = self.inner.lock();
            let Some(records) = inner.state.staged.get(zone) else {
                return Ok(Vec::new());
            };
            keys.iter().filter_map(|k| records.get(k).cloned()).collect()
        };
        self.write(
            removed
                .iter()
                .map(|r| LogEntry::Remove {
                    zone: zone.clone(),
                    key: r.key().clone(),
                })
                .collect(),
        )?;
        Ok(removed)
    }

    /// Returns a staged record.
    pub fn get(&self, zone: &ZoneId, key: &RecordKey) -> Option<UnsyncedRecord> {
        self.inner
            .lock()
            .state
            .staged
            .get(zone)
            .and_then(|r| r.get(key).cloned())
    }

    /// Returns true if the key is staged in the zone.
    pub fn contains(&self, zone: &ZoneId, key: &RecordKey) -> bool {
        self.inner
            .lock()
            .state
            .staged
            .get(zone)
            .is_some_and(|r| r.contains_key(key))
    }

    /// Staged records waiting on `missing`.
    pub fn waiting_on(&self, zone: &ZoneId, missing: &RecordKey) -> Vec<UnsyncedRecord> {
        let inner = self.inner.lock();
        let state = &inner.state;
        let (Some(index), Some(records)) = (state.waiting.get(zone), state.staged.get(zone)) else {
            return Vec::new();
        };
        index
            .get(missing)
            .map(|keys| keys.iter().filter_map(|k| records.get(k).cloned()).collect())
            .unwrap_or_default()
    }

    /// All staged records of a zone, ordered by key.
    pub fn staged(&self, zone: &ZoneId) -> Vec<UnsyncedRecord> {
        self.inner
            .lock()
            .state
            .staged
            .get(zone)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of staged records in a zone.
    pub fn count(&self, zone: &ZoneId) -> usize {
        self.inner
            .lock()
            .state
            .staged
            .get(zone)
            .map_or(0, BTreeMap::len)
    }

    /// Number of staged records across zones.
    pub fn len(&self) -> usize {
        self.inner.lock().state.staged_count()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a zone.
    pub fn register_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        if self.inner.lock().state.zones.contains(zone) {
            return Ok(());
        }
        self.write(vec![LogEntry::Zone { zone: zone.clone() }])
    }

    /// Registered zones.
    pub fn zones(&self) -> Vec<ZoneId> {
        self.inner.lock().state.zones.iter().cloned().collect()
    }

    /// Forgets a zone with its staged records and token.
    pub fn drop_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        self.write(vec![LogEntry::DropZone { zone: zone.clone() }])
    }

    /// The zone's change token.
    pub fn token(&self, zone: &ZoneId) -> Option<ChangeToken> {
        self.inner.lock().state.tokens.get(zone).cloned()
    }

    /// Replaces the zone's change token.
    pub fn set_token(&self, zone: &ZoneId, token: Option<ChangeToken>) -> SyncResult<()> {
        if self.inner.lock().state.tokens.get(zone) == token.as_ref() {
            return Ok(());
        }
        self.write(vec![LogEntry::Token {
            zone: zone.clone(),
            token,
        }])
    }

    /// The persisted clock high-water mark.
    pub fn clock_mark(&self) -> u64 {
        self.inner.lock().state.clock
    }

    /// Persists a clock high-water mark if it is higher than the stored one.
    pub fn set_clock_mark(&self, high_water: u64) -> SyncResult<()> {
        if high_water <= self.inner.lock().state.clock {
            return Ok(());
        }
        self.write(vec![LogEntry::Clock { high_water }])
    }

    /// Number of frames currently in the log.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().state.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use zonesync_protocol::{FieldMap, LogicalTimestamp};
    use zonesync_storage::{FileBackend, InMemoryBackend};

    fn zone() -> ZoneId {
        ZoneId::private("zone")
    }

    fn staged(id: i64, parent: i64) -> UnsyncedRecord {
        let change = RecordChange::save(zone(), RecordKey::new("users", id), FieldMap::new())
            .with_field("id", id, LogicalTimestamp::new(1))
            .with_field("parentID", parent, LogicalTimestamp::new(1));
        UnsyncedRecord::new(change, RecordKey::new("users", parent))
    }

    fn open(backend: &InMemoryBackend) -> UnsyncedStore {
        UnsyncedStore::open(Box::new(backend.clone()), true, 1024).unwrap()
    }

    #[test]
    fn stage_index_and_remove() {
        let backend = InMemoryBackend::new();
        let store = open(&backend);
        store.stage(staged(2, 1)).unwrap();
        store.stage(staged(3, 1)).unwrap();
        store.stage(staged(4, 3)).unwrap();

        assert_eq!(store.count(&zone()), 3);
        let waiting: Vec<_> = store
            .waiting_on(&zone(), &RecordKey::new("users", 1))
            .iter()
            .map(|r| r.key().clone())
            .collect();
        assert_eq!(waiting, vec![RecordKey::new("users", 2), RecordKey::new("users", 3)]);

        let removed = store
            .remove_many(&zone(), &[RecordKey::new("users", 2), RecordKey::new("users", 9)])
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(store.waiting_on(&zone(), &RecordKey::new("users", 1)).len(), 1);
        assert!(!store.contains(&zone(), &RecordKey::new("users", 2)));
    }

    #[test]
    fn restaging_moves_index_entry() {
        let backend = InMemoryBackend::new();
        let store = open(&backend);
        store.stage(staged(2, 1)).unwrap();
        store.stage(staged(2, 5)).unwrap();
        assert!(store.waiting_on(&zone(), &RecordKey::new("users", 1)).is_empty());
        assert_eq!(store.waiting_on(&zone(), &RecordKey::new("users", 5)).len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn state_survives_reopen() {
        let backend = InMemoryBackend::new();
        {
            let store = open(&backend);
            store.register_zone(&zone()).unwrap();
            store.stage(staged(2, 1)).unwrap();
            store
                .set_token(&zone(), Some(ChangeToken::new(vec![7])))
                .unwrap();
            store.set_clock_mark(42).unwrap();
        }

        let store = open(&backend);
        assert_eq!(store.zones(), vec![zone()]);
        assert_eq!(store.count(&zone()), 1);
        assert_eq!(store.token(&zone()), Some(ChangeToken::new(vec![7])));
        assert_eq!(store.clock_mark(), 42);
        assert_eq!(store.waiting_on(&zone(), &RecordKey::new("users", 1)).len(), 1);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let backend = InMemoryBackend::new();
        {
            let store = open(&backend);
            store.stage(staged(2, 1)).unwrap();
            store.stage(staged(3, 1)).unwrap();
        }
        let mut data = backend.data();
        let full = data.len();
        data.truncate(full - 3);

        let torn = InMemoryBackend::with_data(data);
        let store = open(&torn);
        assert_eq!(store.count(&zone()), 1);
        assert!(torn.data().len() < full - 3);

        // The log stays appendable after truncation.
        store.stage(staged(3, 1)).unwrap();
        assert_eq!(open(&torn).count(&zone()), 2);
    }

    #[test]
    fn corrupt_middle_frame_fails() {
        let backend = InMemoryBackend::new();
        {
            let store = open(&backend);
            store.stage(staged(2, 1)).unwrap();
            store.stage(staged(3, 1)).unwrap();
        }
        let mut data = backend.data();
        data[HEADER_SIZE + 2] ^= 0xff;

        let result = UnsyncedStore::open(Box::new(InMemoryBackend::with_data(data)), true, 1024);
        assert!(matches!(result, Err(SyncError::ChecksumMismatch { .. })));
    }

    #[test]
    fn compaction_keeps_live_state() {
        let backend = InMemoryBackend::new();
        let store = UnsyncedStore::open(Box::new(backend.clone()), false, 4).unwrap();
        store.register_zone(&zone()).unwrap();
        for id in 2..10 {
            store.stage(staged(id, 1)).unwrap();
            store.remove(&zone(), &RecordKey::new("users", id)).unwrap();
        }
        store.stage(staged(20, 1)).unwrap();

        assert!(store.entry_count() <= 2 + 4 + 1);
        let reopened = open(&backend);
        assert_eq!(reopened.count(&zone()), 1);
        assert!(reopened.contains(&zone(), &RecordKey::new("users", 20)));
        assert_eq!(reopened.zones(), vec![zone()]);
    }

    #[test]
    fn drop_zone_forgets_everything() {
        let backend = InMemoryBackend::new();
        let store = open(&backend);
        store.register_zone(&zone()).unwrap();
        store.stage(staged(2, 1)).unwrap();
        store.set_token(&zone(), Some(ChangeToken::new(vec![1]))).unwrap();
        store.drop_zone(&zone()).unwrap();

        let store = open(&backend);
        assert!(store.zones().is_empty());
        assert!(store.is_empty());
        assert_eq!(store.token(&zone()), None);
    }

    #[test]
    fn file_backed_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unsynced.log");
        {
            let backend = FileBackend::open_exclusive(&path).unwrap();
            let store = UnsyncedStore::open(Box::new(backend), true, 1024).unwrap();
            store.stage(staged(2, 1)).unwrap();
        }
        let backend = FileBackend::open(&path).unwrap();
        let store = UnsyncedStore::open(Box::new(backend), true, 1024).unwrap();
        assert_eq!(store.count(&zone()), 1);
    }
}
