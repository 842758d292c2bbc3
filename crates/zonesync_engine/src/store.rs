//! The local relational store, as seen by the engine.
//!
//! The engine never runs SQL. It reads rows by key, asks for dependents, and
//! hands over a list of writes to commit atomically. [`MemoryStore`] is an
//! in-process implementation that enforces foreign keys at commit.

use crate::error::{SyncError, SyncResult};
use crate::schema::SchemaGraph;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use zonesync_protocol::{FieldMap, FieldValue, KeyValue, RecordKey, ZoneId};

/// A committed row and the zone that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Owning zone.
    pub zone: ZoneId,
    /// Timestamped fields.
    pub fields: FieldMap,
}

/// One write inside an atomic commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    /// Insert or replace a row.
    Upsert {
        /// Row key.
        key: RecordKey,
        /// Owning zone.
        zone: ZoneId,
        /// Full field map.
        fields: FieldMap,
    },
    /// Delete a row.
    Delete(RecordKey),
}

impl Write {
    /// The key this write touches.
    pub fn key(&self) -> &RecordKey {
        match self {
            Write::Upsert { key, .. } | Write::Delete(key) => key,
        }
    }
}

/// The embedded database the engine keeps in sync.
pub trait LocalStore: Send + Sync {
    /// Reads a row.
    fn get(&self, key: &RecordKey) -> SyncResult<Option<StoredRow>>;

    /// Returns true if `key` is committed and owned by `zone`.
    fn exists(&self, zone: &ZoneId, key: &RecordKey) -> SyncResult<bool> {
        Ok(self.get(key)?.is_some_and(|row| row.zone == *zone))
    }

    /// Rows of `table` in `zone` whose `column` equals `value`.
    fn dependents_of(
        &self,
        zone: &ZoneId,
        table: &str,
        column: &str,
        value: &KeyValue,
    ) -> SyncResult<Vec<RecordKey>>;

    /// All rows owned by `zone`.
    fn rows_in_zone(&self, zone: &ZoneId) -> SyncResult<Vec<(RecordKey, FieldMap)>>;

    /// Applies `writes` atomically, checking foreign keys at the end.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] and leaves the store unchanged if any
    /// reference is left dangling.
    fn commit(&self, writes: Vec<Write>) -> SyncResult<()>;
}

/// In-memory [`LocalStore`] with deferred foreign-key enforcement.
pub struct MemoryStore {
    schema: Arc<SchemaGraph>,
    rows: RwLock<BTreeMap<RecordKey, StoredRow>>,
    fail_commits: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store for `schema`.
    pub fn new(schema: Arc<SchemaGraph>) -> Self {
        Self {
            schema,
            rows: RwLock::new(BTreeMap::new()),
            fail_commits: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` commits fail without writing.
    pub fn fail_next_commits(&self, count: usize) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Returns a row's fields.
    pub fn row(&self, key: &RecordKey) -> Option<FieldMap> {
        self.rows.read().get(key).map(|r| r.fields.clone())
    }

    /// Returns one field value of a row.
    pub fn value(&self, key: &RecordKey, field: &str) -> Option<FieldValue> {
        self.rows
            .read()
            .get(key)
            .and_then(|r| r.fields.get(field).map(|f| f.value.clone()))
    }

    /// Number of rows in `table`.
    pub fn count(&self, table: &str) -> usize {
        self.rows.read().keys().filter(|k| k.table == table).count()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Every row, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<RecordKey, StoredRow> {
        self.rows.read().clone()
    }

    fn check_references(
        &self,
        rows: &BTreeMap<RecordKey, StoredRow>,
        touched: &[RecordKey],
    ) -> SyncResult<()> {
        for key in touched {
            match rows.get(key) {
                Some(row) => {
                    for parent in self.schema.parent_keys(&key.table, &row.fields)? {
                        if !rows.contains_key(&parent) {
                            return Err(SyncError::store(format!(
                                "foreign key violation: {key} references missing {parent}"
                            )));
                        }
                    }
                }
                None => {
                    let target = key.id.to_field();
                    for dep in self.schema.dependents_of(&key.table) {
                        let orphan = rows.iter().find(|(k, r)| {
                            k.table == dep.table
                                && r.fields.get(&dep.column).is_some_and(|f| f.value == target)
                        });
                        if let Some((child, _)) = orphan {
                            return Err(SyncError::store(format!(
                                "foreign key violation: {child} references deleted {key}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &RecordKey) -> SyncResult<Option<StoredRow>> {
        Ok(self.rows.read().get(key).cloned())
    }

    fn dependents_of(
        &self,
        zone: &ZoneId,
        table: &str,
        column: &str,
        value: &KeyValue,
    ) -> SyncResult<Vec<RecordKey>> {
        let target = value.to_field();
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|(k, r)| {
                k.table == table
                    && r.zone == *zone
                    && r.fields.get(column).is_some_and(|f| f.value == target)
            })
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn rows_in_zone(&self, zone: &ZoneId) -> SyncResult<Vec<(RecordKey, FieldMap)>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|(_, r)| r.zone == *zone)
            .map(|(k, r)| (k.clone(), r.fields.clone()))
            .collect())
    }

    fn commit(&self, writes: Vec<Write>) -> SyncResult<()> {
        if self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::store("injected commit failure"));
        }

        let mut rows = self.rows.write();
        let mut undo: Vec<(RecordKey, Option<StoredRow>)> = Vec::with_capacity(writes.len());
        let mut touched = Vec::with_capacity(writes.len());

        let mut result = Ok(());
        for write in writes {
            touched.push(write.key().clone());
            match write {
                Write::Upsert { key, zone, fields } => {
                    if let Some(existing) = rows.get(&key) {
                        if existing.zone != zone {
                            result = Err(SyncError::store(format!(
                                "{key} is owned by zone {}",
                                existing.zone
                            )));
                            break;
                        }
                    }
                    let previous = rows.insert(key.clone(), StoredRow { zone, fields });
                    undo.push((key, previous));
                }
                Write::Delete(key) => {
                    let previous = rows.remove(&key);
                    undo.push((key, previous));
                }
            }
        }

        if result.is_ok() {
            result = self.check_references(&rows, &touched);
        }

        if result.is_err() {
            for (key, previous) in undo.into_iter().rev() {
                match previous {
                    Some(row) => rows.insert(key, row),
                    None => rows.remove(&key),
                };
            }
        }
        result
    }
}
