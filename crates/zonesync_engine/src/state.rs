//! Sync engine state machine.

use crate::applier::{self, ApplyReport};
use crate::batcher::{self, PushOutcome, ZoneBatch};
use crate::cascade::{cascade_delete, CascadeOutcome, DeleteOrigin};
use crate::clock::LogicalClock;
use crate::config::EngineConfig;
use crate::context::{max_timestamp, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::order::topological_order;
use crate::remote::RemoteStore;
use crate::schema::SchemaGraph;
use crate::store::{LocalStore, Write};
use crate::unsynced::UnsyncedStore;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zonesync_protocol::{
    ChangeToken, FailureReason, Field, FieldValue, LogicalTimestamp, PendingChanges, RecordChange,
    RecordKey, SaveResult, Zone, ZoneId,
};
use zonesync_storage::StorageBackend;

/// The sync state of one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Zone is idle, not syncing.
    Idle,
    /// Fetching remote changes.
    Fetching,
    /// Pushing local changes.
    Pushing,
    /// The last sync cycle completed.
    Synced,
    /// The last sync cycle failed.
    Error,
    /// Waiting before retrying.
    RetryWait,
}

impl SyncState {
    /// Returns true if a sync cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Fetching | SyncState::Pushing)
    }

    /// Returns true if a new sync cycle can start.
    pub fn can_start_sync(&self) -> bool {
        matches!(
            self,
            SyncState::Idle | SyncState::Synced | SyncState::Error | SyncState::RetryWait
        )
    }
}

/// Statistics across all zones.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sync cycles completed.
    pub cycles_completed: u64,
    /// Remote modifications and deletions received.
    pub records_fetched: u64,
    /// Changes the remote accepted.
    pub records_pushed: u64,
    /// Records staged for a missing dependency.
    pub records_staged: u64,
    /// Staged records later committed.
    pub records_replayed: u64,
    /// Rows deleted by remote deletions, cascades included.
    pub records_deleted: u64,
    /// Remote records refused as malformed.
    pub records_rejected: u64,
    /// Fields resolved by last-writer-wins.
    pub conflicts_resolved: u64,
    /// Retries.
    pub retries: u64,
    /// Last successful sync.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of uploading a zone's pending changes.
#[derive(Debug, Clone, Default)]
pub struct PushSummary {
    /// Batches sent.
    pub batches: usize,
    /// Changes the remote accepted.
    pub pushed: usize,
    /// Changes the remote refused. They stay pending.
    pub failed: Vec<(RecordKey, FailureReason)>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone)]
pub struct SyncCycleResult {
    /// Remote modifications and deletions received.
    pub fetched: usize,
    /// What applying them did.
    pub applied: ApplyReport,
    /// Changes the remote accepted.
    pub pushed: usize,
    /// Changes the remote refused.
    pub failed: Vec<(RecordKey, FailureReason)>,
    /// The zone turned out to be deleted remotely and was removed locally.
    pub zone_deleted: bool,
    /// Duration of the cycle.
    pub duration: Duration,
}

struct ZoneContext {
    pending: PendingChanges,
}

struct ZoneHandle {
    state: RwLock<SyncState>,
    inner: Mutex<ZoneContext>,
}

impl ZoneHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(SyncState::Idle),
            inner: Mutex::new(ZoneContext {
                pending: PendingChanges::new(),
            }),
        })
    }
}

/// Keeps a local relational store and a remote store in sync, zone by zone.
///
/// Uploads are sent parents-first and deletions leaf-to-root. Remote records
/// whose references are not yet satisfied are staged in a durable log and
/// committed once the missing rows arrive.
pub struct SyncEngine<L: LocalStore, R: RemoteStore> {
    config: EngineConfig,
    schema: Arc<SchemaGraph>,
    local: Arc<L>,
    remote: Arc<R>,
    unsynced: UnsyncedStore,
    clock: LogicalClock,
    zones: RwLock<HashMap<ZoneId, Arc<ZoneHandle>>>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

impl<L: LocalStore, R: RemoteStore> SyncEngine<L, R> {
    /// Creates an engine.
    ///
    /// Replays the unsynced log from `log`, restores the zones it knows,
    /// seeds the clock past every stored timestamp, and commits any staged
    /// record whose dependencies are now present.
    ///
    /// # Errors
    ///
    /// Fails if the log is corrupt or cannot be read.
    pub fn new(
        config: EngineConfig,
        schema: Arc<SchemaGraph>,
        local: Arc<L>,
        remote: Arc<R>,
        log: Box<dyn StorageBackend>,
    ) -> SyncResult<Self> {
        let unsynced =
            UnsyncedStore::open(log, config.sync_on_write, config.compaction_threshold)?;
        let clock = LogicalClock::new(LogicalTimestamp::new(unsynced.clock_mark()));

        let engine = Self {
            config,
            schema,
            local,
            remote,
            unsynced,
            clock,
            zones: RwLock::new(HashMap::new()),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
        };

        for zone in engine.unsynced.zones() {
            for (_, fields) in engine.local.rows_in_zone(&zone)? {
                engine.clock.observe(max_timestamp(&fields));
            }
            let report = applier::reconcile(&engine.ctx(), &zone)?;
            if !report.replayed.is_empty() {
                info!(zone = %zone, replayed = report.replayed.len(), "released staged records");
            }
            engine.zones.write().insert(zone, ZoneHandle::new());
        }

        info!(
            zones = engine.zones.read().len(),
            staged = engine.unsynced.len(),
            clock = %engine.clock.current(),
            "sync engine ready"
        );
        Ok(engine)
    }

    fn ctx(&self) -> SyncContext<'_, L> {
        SyncContext {
            schema: &self.schema,
            local: self.local.as_ref(),
            unsynced: &self.unsynced,
            clock: &self.clock,
        }
    }

    fn zone_handle(&self, zone: &ZoneId) -> SyncResult<Arc<ZoneHandle>> {
        self.zones
            .read()
            .get(zone)
            .cloned()
            .ok_or_else(|| SyncError::UnknownZone(zone.clone()))
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The schema graph.
    pub fn schema(&self) -> &SchemaGraph {
        &self.schema
    }

    /// The local store.
    pub fn local(&self) -> &L {
        &self.local
    }

    /// The remote store.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Known zones, ordered by id.
    pub fn zones(&self) -> Vec<Zone> {
        let mut ids: Vec<ZoneId> = self.zones.read().keys().cloned().collect();
        ids.sort();
        ids.into_iter().map(Zone::new).collect()
    }

    /// Creates a zone remotely and starts tracking it.
    pub fn create_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        self.remote.create_zone(zone)?;
        self.unsynced.register_zone(zone)?;
        self.zones
            .write()
            .entry(zone.clone())
            .or_insert_with(ZoneHandle::new);
        info!(zone = %zone, "zone created");
        Ok(())
    }

    /// Deletes a zone remotely, then locally.
    pub fn delete_zone(&self, zone: &ZoneId) -> SyncResult<usize> {
        self.zone_handle(zone)?;
        self.remote.delete_zone(zone)?;
        self.handle_zone_deleted(zone)
    }

    /// Removes every local row of a zone that was deleted remotely, along
    /// with its pending changes, staged records and change token.
    ///
    /// Returns the number of rows removed.
    pub fn handle_zone_deleted(&self, zone: &ZoneId) -> SyncResult<usize> {
        let handle = self.zone_handle(zone)?;
        let mut inner = handle.inner.lock();

        let rows = self.local.rows_in_zone(zone)?;
        let keys: Vec<RecordKey> = rows.iter().map(|(k, _)| k.clone()).collect();
        let parents = rows
            .iter()
            .map(|(k, fields)| self.schema.parent_keys(&k.table, fields))
            .collect::<SyncResult<Vec<_>>>()?;
        let order = match topological_order(&keys, &parents) {
            Ok(order) => order,
            Err(e) => {
                debug!(zone = %zone, error = %e, "deleting zone rows in key order");
                (0..keys.len()).collect()
            }
        };
        let writes: Vec<Write> = order
            .into_iter()
            .rev()
            .map(|i| Write::Delete(keys[i].clone()))
            .collect();
        let removed = writes.len();
        if !writes.is_empty() {
            self.local.commit(writes)?;
        }

        inner.pending.clear();
        self.unsynced.drop_zone(zone)?;
        drop(inner);
        *handle.state.write() = SyncState::Idle;
        self.zones.write().remove(zone);

        info!(zone = %zone, removed, "zone removed locally");
        Ok(removed)
    }

    /// Writes fields of a local row and queues it for upload.
    ///
    /// Changed fields are stamped with a fresh timestamp. The primary-key
    /// column is filled in from `key` when absent. Returns the stamp, or the
    /// row's latest stamp when no value changed; nothing is written or queued
    /// in that case.
    ///
    /// # Errors
    ///
    /// Fails if the row belongs to another zone, a required column would be
    /// null, a referenced row is not in `zone`, or the clock is exhausted.
    pub fn save_local<S, V>(
        &self,
        zone: &ZoneId,
        key: &RecordKey,
        values: impl IntoIterator<Item = (S, V)>,
    ) -> SyncResult<LogicalTimestamp>
    where
        S: Into<String>,
        V: Into<FieldValue>,
    {
        let table = self.schema.require_table(&key.table)?;
        let handle = self.zone_handle(zone)?;
        let mut inner = handle.inner.lock();

        let mut fields = match self.local.get(key)? {
            Some(row) if row.zone != *zone => {
                return Err(SyncError::store(format!(
                    "{key} is owned by zone {}",
                    row.zone
                )));
            }
            Some(row) => row.fields,
            None => BTreeMap::new(),
        };

        let mut changed: Vec<(String, FieldValue)> = Vec::new();
        if !fields.contains_key(&table.primary_key) {
            changed.push((table.primary_key.clone(), key.id.to_field()));
        }
        for (name, value) in values {
            let name = name.into();
            let value = value.into();
            if name == table.primary_key && value != key.id.to_field() {
                return Err(SyncError::store(format!(
                    "{key}: primary key cannot change to {value}"
                )));
            }
            if fields.get(&name).map(|f| &f.value) != Some(&value) {
                changed.push((name, value));
            }
        }
        if changed.is_empty() {
            debug!(zone = %zone, key = %key, "local save changed nothing");
            return Ok(max_timestamp(&fields));
        }

        let ts = self.clock.tick_after(max_timestamp(&fields))?;
        for (name, value) in changed {
            fields.insert(name, Field::new(value, ts));
        }

        if let Some(column) = table
            .required
            .iter()
            .find(|c| fields.get(*c).map_or(true, |f| f.value.is_null()))
        {
            return Err(SyncError::store(format!(
                "{key}: required column {column} is null"
            )));
        }
        for parent in self.schema.parent_keys(&key.table, &fields)? {
            if !self.local.exists(zone, &parent)? {
                return Err(SyncError::store(format!(
                    "{key} references {parent}, which is not in zone {zone}"
                )));
            }
        }

        self.local.commit(vec![Write::Upsert {
            key: key.clone(),
            zone: zone.clone(),
            fields,
        }])?;
        inner.pending.record_save(key.clone());
        debug!(zone = %zone, key = %key, ts = %ts, "local save");
        Ok(ts)
    }

    /// Deletes a local row and everything cascading from it, and queues the
    /// deletions for upload.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ReferenceViolation`] if a no-action reference
    /// would be left dangling. Nothing is changed in that case.
    pub fn delete_local(&self, zone: &ZoneId, key: &RecordKey) -> SyncResult<CascadeOutcome> {
        let handle = self.zone_handle(zone)?;
        let mut inner = handle.inner.lock();
        cascade_delete(&self.ctx(), zone, &mut inner.pending, key, DeleteOrigin::Local)
    }

    /// Builds the next upload batch for a zone.
    pub fn next_batch(&self, zone: &ZoneId) -> SyncResult<ZoneBatch> {
        let handle = self.zone_handle(zone)?;
        let mut inner = handle.inner.lock();
        batcher::next_batch(
            &self.ctx(),
            zone,
            &mut inner.pending,
            self.config.max_batch_size,
        )
    }

    /// Records the remote's verdict on a batch built by [`Self::next_batch`].
    pub fn record_push_results(
        &self,
        zone: &ZoneId,
        batch: &ZoneBatch,
        results: Vec<(RecordKey, SaveResult)>,
    ) -> SyncResult<PushOutcome> {
        let handle = self.zone_handle(zone)?;
        let mut inner = handle.inner.lock();
        Ok(batcher::record_push_results(&mut inner.pending, batch, results))
    }

    /// Uploads pending changes batch by batch until nothing more is
    /// accepted.
    ///
    /// The zone is not locked while a batch is in flight; local edits made
    /// meanwhile stay pending.
    pub fn push_pending(&self, zone: &ZoneId) -> SyncResult<PushSummary> {
        let mut summary = PushSummary::default();
        let mut failed: BTreeMap<RecordKey, FailureReason> = BTreeMap::new();

        loop {
            self.check_cancelled()?;
            let batch = self.next_batch(zone)?;
            if batch.is_empty() {
                break;
            }
            let results = self.remote.push(zone, &batch.changes)?;
            let outcome = self.record_push_results(zone, &batch, results)?;

            summary.batches += 1;
            summary.pushed += outcome.saved.len();
            for key in &outcome.saved {
                failed.remove(key);
            }
            let progressed = !outcome.saved.is_empty();
            failed.extend(outcome.failed);
            if !progressed {
                break;
            }
        }

        summary.failed = failed.into_iter().collect();
        self.stats.write().records_pushed += summary.pushed as u64;
        if summary.batches > 0 {
            info!(
                zone = %zone,
                batches = summary.batches,
                pushed = summary.pushed,
                failed = summary.failed.len(),
                "pushed pending changes"
            );
        }
        Ok(summary)
    }

    /// Applies remote changes to a zone directly.
    pub fn apply(
        &self,
        zone: &ZoneId,
        modifications: Vec<RecordChange>,
        deletions: Vec<RecordKey>,
    ) -> SyncResult<ApplyReport> {
        let handle = self.zone_handle(zone)?;
        let report = {
            let mut inner = handle.inner.lock();
            applier::apply(&self.ctx(), zone, &mut inner.pending, modifications, deletions)?
        };
        self.record_apply_stats(&report);
        Ok(report)
    }

    /// Fetches and applies every remote change since the zone's token,
    /// page by page. The token is persisted after each applied page.
    pub fn fetch_and_apply(&self, zone: &ZoneId) -> SyncResult<ApplyReport> {
        self.fetch_all(zone).map(|(_, report)| report)
    }

    fn fetch_all(&self, zone: &ZoneId) -> SyncResult<(usize, ApplyReport)> {
        let mut received = 0;
        let mut report = ApplyReport::default();
        loop {
            self.check_cancelled()?;
            let token = self.unsynced.token(zone);
            let page = self.remote.fetch(zone, token.as_ref())?;
            received += page.modifications.len() + page.deletions.len();

            let applied = self.apply(zone, page.modifications, page.deletions)?;
            report.absorb(applied);
            if let Some(token) = page.new_token {
                self.unsynced.set_token(zone, Some(token))?;
            }
            if !page.has_more {
                break;
            }
        }
        self.stats.write().records_fetched += received as u64;
        Ok((received, report))
    }

    fn record_apply_stats(&self, report: &ApplyReport) {
        let mut stats = self.stats.write();
        stats.records_staged += report.staged.len() as u64;
        stats.records_replayed += report.replayed.len() as u64;
        stats.records_deleted += report.deleted.len() as u64;
        stats.records_rejected += report.rejected.len() as u64;
        stats.conflicts_resolved += report.conflicts as u64;
    }

    /// Performs a full sync cycle for a zone: fetch then push.
    ///
    /// A zone the remote no longer knows is removed locally and the cycle
    /// ends successfully with [`SyncCycleResult::zone_deleted`] set.
    pub fn sync(&self, zone: &ZoneId) -> SyncResult<SyncCycleResult> {
        let start = Instant::now();
        self.reset_cancel();
        let handle = self.zone_handle(zone)?;

        {
            let mut state = handle.state.write();
            if !state.can_start_sync() {
                return Err(SyncError::InvalidStateTransition {
                    from: format!("{:?}", *state),
                    to: "sync".into(),
                });
            }
            *state = SyncState::Fetching;
        }

        let mut result = SyncCycleResult {
            fetched: 0,
            applied: ApplyReport::default(),
            pushed: 0,
            failed: Vec::new(),
            zone_deleted: false,
            duration: Duration::ZERO,
        };

        match self.fetch_all(zone) {
            Ok((fetched, applied)) => {
                result.fetched = fetched;
                result.applied = applied;
            }
            Err(SyncError::UnknownZone(_)) => {
                warn!(zone = %zone, "zone was deleted remotely");
                if let Err(e) = self.handle_zone_deleted(zone) {
                    self.handle_error(&handle, &e);
                    return Err(e);
                }
                result.zone_deleted = true;
                result.duration = start.elapsed();
                return Ok(result);
            }
            Err(e) => {
                self.handle_error(&handle, &e);
                return Err(e);
            }
        }

        *handle.state.write() = SyncState::Pushing;
        match self.push_pending(zone) {
            Ok(summary) => {
                result.pushed = summary.pushed;
                result.failed = summary.failed;
            }
            Err(e) => {
                self.handle_error(&handle, &e);
                return Err(e);
            }
        }

        result.duration = start.elapsed();
        *handle.state.write() = SyncState::Synced;
        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.last_sync_time = Some(Instant::now());
            stats.last_error = None;
        }
        info!(
            zone = %zone,
            fetched = result.fetched,
            staged = result.applied.staged.len(),
            pushed = result.pushed,
            failed = result.failed.len(),
            elapsed_ms = result.duration.as_millis() as u64,
            "sync cycle complete"
        );
        Ok(result)
    }

    /// Performs a sync with retry on transient errors.
    pub fn sync_with_retry(&self, zone: &ZoneId) -> SyncResult<SyncCycleResult> {
        let retry = &self.config.retry;
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                if let Ok(handle) = self.zone_handle(zone) {
                    *handle.state.write() = SyncState::RetryWait;
                }
                let delay = retry.delay_for_attempt(attempt);
                debug!(zone = %zone, attempt, delay_ms = delay.as_millis() as u64, "retrying sync");
                std::thread::sleep(delay);
                self.stats.write().retries += 1;
            }

            self.check_cancelled()?;
            match self.sync(zone) {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    warn!(zone = %zone, attempt, error = %e, "sync failed, will retry");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::configuration("no sync attempts allowed")))
    }

    /// Cancels any ongoing sync operation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Resets the cancelled flag.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn handle_error(&self, handle: &ZoneHandle, error: &SyncError) {
        *handle.state.write() = SyncState::Error;
        self.stats.write().last_error = Some(error.to_string());
    }

    /// The zone's sync state.
    pub fn state(&self, zone: &ZoneId) -> SyncResult<SyncState> {
        Ok(*self.zone_handle(zone)?.state.read())
    }

    /// Statistics across all zones.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Number of changes waiting for upload.
    pub fn pending_count(&self, zone: &ZoneId) -> SyncResult<usize> {
        Ok(self.zone_handle(zone)?.inner.lock().pending.len())
    }

    /// Returns true if `key` is queued for upload.
    pub fn is_pending(&self, zone: &ZoneId, key: &RecordKey) -> SyncResult<bool> {
        Ok(self.zone_handle(zone)?.inner.lock().pending.contains(key))
    }

    /// Number of staged records in a zone.
    pub fn unsynced_count(&self, zone: &ZoneId) -> usize {
        self.unsynced.count(zone)
    }

    /// Returns true if `key` is staged in `zone`.
    pub fn is_staged(&self, zone: &ZoneId, key: &RecordKey) -> bool {
        self.unsynced.contains(zone, key)
    }

    /// The zone's persisted change token.
    pub fn token(&self, zone: &ZoneId) -> Option<ChangeToken> {
        self.unsynced.token(zone)
    }

    /// The current logical clock reading.
    pub fn clock(&self) -> LogicalTimestamp {
        self.clock.current()
    }

    /// Rewrites the unsynced log with only its live entries.
    pub fn compact_log(&self) -> SyncResult<()> {
        self.unsynced.compact()
    }
}
