//! Test fixtures and replica helpers.
//!
//! A [`Replica`] is one device: a local store, an unsynced log, and an
//! engine over both, talking to a remote shared with other replicas.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use zonesync_engine::{
    ApplyReport, DeleteAction, EngineConfig, ForeignKey, MemoryRemote, MemoryStore, SchemaGraph,
    StoredRow, SyncCycleResult, SyncEngine, TableSchema,
};
use zonesync_protocol::{
    FieldMap, FieldValue, LogicalTimestamp, RecordChange, RecordKey, ZoneId,
};
use zonesync_storage::{FileBackend, InMemoryBackend, StorageBackend};

/// Self-referencing table used by most fixtures.
pub const NODES: &str = "nodes";

/// Table whose rows optionally point at a node.
pub const TAGS: &str = "tags";

/// Engine over the in-memory store and remote.
pub type MemoryEngine = SyncEngine<MemoryStore, MemoryRemote>;

/// Nodes form a forest through a cascading `parentID`; tags reference
/// nodes with set-null.
pub fn forest_schema() -> Arc<SchemaGraph> {
    Arc::new(
        SchemaGraph::new(vec![
            TableSchema::new(NODES, "id")
                .required("label")
                .foreign_key(ForeignKey::new("parentID", NODES, "id", DeleteAction::Cascade)),
            TableSchema::new(TAGS, "id").foreign_key(ForeignKey::new(
                "nodeID",
                NODES,
                "id",
                DeleteAction::SetNull,
            )),
        ])
        .expect("forest schema is valid"),
    )
}

/// The zone every fixture syncs.
pub fn test_zone() -> ZoneId {
    ZoneId::private("zonesync.test")
}

/// Key of node `id`.
pub fn node_key(id: i64) -> RecordKey {
    RecordKey::new(NODES, id)
}

/// Key of tag `id`.
pub fn tag_key(id: i64) -> RecordKey {
    RecordKey::new(TAGS, id)
}

/// A node as another replica would have uploaded it, every field stamped `ts`.
pub fn node_change(id: i64, parent: Option<i64>, label: &str, ts: u64) -> RecordChange {
    let ts = LogicalTimestamp::new(ts);
    RecordChange::save(test_zone(), node_key(id), FieldMap::new())
        .with_field("id", id, ts)
        .with_field("label", label, ts)
        .with_field("parentID", parent, ts)
}

/// A remote shared by every replica of a test.
pub fn shared_remote() -> Arc<MemoryRemote> {
    Arc::new(MemoryRemote::new(forest_schema()))
}

/// Installs a test-friendly subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One device syncing [`test_zone`] through a shared remote.
pub struct Replica {
    /// The engine under test.
    pub engine: MemoryEngine,
    /// The local store, shared with the engine.
    pub local: Arc<MemoryStore>,
    config: EngineConfig,
    log: InMemoryBackend,
}

impl Replica {
    /// Creates a replica with the default configuration.
    pub fn new(remote: &Arc<MemoryRemote>) -> Self {
        Self::with_config(remote, EngineConfig::default())
    }

    /// Creates a replica with `config` and registers [`test_zone`].
    pub fn with_config(remote: &Arc<MemoryRemote>, config: EngineConfig) -> Self {
        let schema = forest_schema();
        let local = Arc::new(MemoryStore::new(Arc::clone(&schema)));
        let log = InMemoryBackend::new();
        let engine = open_engine(config.clone(), schema, &local, remote, Box::new(log.clone()));
        engine.create_zone(&test_zone()).expect("Failed to create zone");
        Self {
            engine,
            local,
            config,
            log,
        }
    }

    /// Drops the engine and opens a new one over the same store and log.
    pub fn restart(self, remote: &Arc<MemoryRemote>) -> Self {
        let Replica {
            engine,
            local,
            config,
            log,
        } = self;
        drop(engine);
        let engine = open_engine(
            config.clone(),
            forest_schema(),
            &local,
            remote,
            Box::new(log.clone()),
        );
        Self {
            engine,
            local,
            config,
            log,
        }
    }

    /// Saves node `id` locally.
    pub fn save_node(&self, id: i64, parent: Option<i64>, label: &str) -> LogicalTimestamp {
        self.engine
            .save_local(
                &test_zone(),
                &node_key(id),
                [
                    ("label", FieldValue::from(label)),
                    ("parentID", FieldValue::from(parent)),
                ],
            )
            .expect("Failed to save node")
    }

    /// Saves tag `id` locally, optionally pointing at a node.
    pub fn save_tag(&self, id: i64, node: Option<i64>) -> LogicalTimestamp {
        self.engine
            .save_local(&test_zone(), &tag_key(id), [("nodeID", node)])
            .expect("Failed to save tag")
    }

    /// Applies remote modifications as one fetch page.
    pub fn deliver(&self, changes: Vec<RecordChange>) -> ApplyReport {
        self.engine
            .apply(&test_zone(), changes, Vec::new())
            .expect("Failed to apply changes")
    }

    /// Runs one sync cycle.
    pub fn sync(&self) -> SyncCycleResult {
        self.engine.sync(&test_zone()).expect("Failed to sync")
    }

    /// Every committed row.
    pub fn snapshot(&self) -> BTreeMap<RecordKey, StoredRow> {
        self.local.snapshot()
    }

    /// Committed parent of node `id`, if the node exists.
    pub fn parent_of(&self, id: i64) -> Option<FieldValue> {
        self.local.value(&node_key(id), "parentID")
    }

    /// Raw bytes of the unsynced log.
    pub fn log_bytes(&self) -> Vec<u8> {
        self.log.data()
    }
}

/// A replica whose unsynced log lives in a temporary directory.
pub struct FileReplica {
    /// The engine under test.
    pub engine: MemoryEngine,
    /// The local store, shared with the engine.
    pub local: Arc<MemoryStore>,
    dir: TempDir,
}

impl FileReplica {
    /// Creates a replica with a file-backed log.
    pub fn new(remote: &Arc<MemoryRemote>) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let local = Arc::new(MemoryStore::new(forest_schema()));
        let engine = open_file_engine(&log_path(dir.path()), &local, remote);
        engine.create_zone(&test_zone()).expect("Failed to create zone");
        Self { engine, local, dir }
    }

    /// Path to the log file.
    pub fn path(&self) -> PathBuf {
        log_path(self.dir.path())
    }

    /// Closes the engine, releasing the file lock, and opens it again.
    pub fn reopen(self, remote: &Arc<MemoryRemote>) -> Self {
        let FileReplica { engine, local, dir } = self;
        drop(engine);
        let engine = open_file_engine(&log_path(dir.path()), &local, remote);
        Self { engine, local, dir }
    }
}

fn log_path(dir: &Path) -> PathBuf {
    dir.join("unsynced.log")
}

fn open_file_engine(
    path: &Path,
    local: &Arc<MemoryStore>,
    remote: &Arc<MemoryRemote>,
) -> MemoryEngine {
    let backend = FileBackend::open_exclusive(path).expect("Failed to open log file");
    open_engine(
        EngineConfig::default(),
        forest_schema(),
        local,
        remote,
        Box::new(backend),
    )
}

fn open_engine(
    config: EngineConfig,
    schema: Arc<SchemaGraph>,
    local: &Arc<MemoryStore>,
    remote: &Arc<MemoryRemote>,
    log: Box<dyn StorageBackend>,
) -> MemoryEngine {
    SyncEngine::new(config, schema, Arc::clone(local), Arc::clone(remote), log)
        .expect("Failed to open engine")
}
