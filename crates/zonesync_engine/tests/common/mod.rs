//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use zonesync_engine::{
    DeleteAction, EngineConfig, ForeignKey, MemoryRemote, MemoryStore, SchemaGraph, SyncEngine,
    TableSchema,
};
use zonesync_protocol::{FieldMap, FieldValue, LogicalTimestamp, RecordChange, RecordKey, ZoneId};
use zonesync_storage::{InMemoryBackend, StorageBackend};

pub type Engine = SyncEngine<MemoryStore, MemoryRemote>;

/// Users form a tree; lists own reminders; reminders may be assigned a user.
pub fn reminders_schema() -> Arc<SchemaGraph> {
    Arc::new(
        SchemaGraph::new(vec![
            TableSchema::new("localUsers", "id")
                .required("name")
                .foreign_key(ForeignKey::new(
                    "parentID",
                    "localUsers",
                    "id",
                    DeleteAction::Cascade,
                )),
            TableSchema::new("remindersLists", "id").required("title"),
            TableSchema::new("reminders", "id")
                .required("title")
                .required("remindersListID")
                .foreign_key(ForeignKey::new(
                    "remindersListID",
                    "remindersLists",
                    "id",
                    DeleteAction::Cascade,
                ))
                .foreign_key(ForeignKey::new(
                    "assigneeID",
                    "localUsers",
                    "id",
                    DeleteAction::SetNull,
                )),
            TableSchema::new("attachments", "id").foreign_key(ForeignKey::new(
                "reminderID",
                "reminders",
                "id",
                DeleteAction::NoAction,
            )),
        ])
        .expect("valid schema"),
    )
}

pub fn zone() -> ZoneId {
    ZoneId::private("co.pointfree.SQLiteData.defaultZone")
}

pub fn user(id: i64) -> RecordKey {
    RecordKey::new("localUsers", id)
}

pub fn list(id: i64) -> RecordKey {
    RecordKey::new("remindersLists", id)
}

pub fn reminder(id: i64) -> RecordKey {
    RecordKey::new("reminders", id)
}

pub fn attachment(id: i64) -> RecordKey {
    RecordKey::new("attachments", id)
}

/// One device: its own local store and log, sharing a remote with others.
pub struct Device {
    pub engine: Engine,
    pub local: Arc<MemoryStore>,
    pub log: InMemoryBackend,
}

impl Device {
    pub fn new(remote: &Arc<MemoryRemote>) -> Self {
        Self::with_config(remote, EngineConfig::default())
    }

    pub fn with_config(remote: &Arc<MemoryRemote>, config: EngineConfig) -> Self {
        let schema = reminders_schema();
        let local = Arc::new(MemoryStore::new(Arc::clone(&schema)));
        let log = InMemoryBackend::new();
        let engine = SyncEngine::new(
            config,
            schema,
            Arc::clone(&local),
            Arc::clone(remote),
            Box::new(log.clone()) as Box<dyn StorageBackend>,
        )
        .expect("engine");
        engine.create_zone(&zone()).expect("zone");
        Self { engine, local, log }
    }

    /// Drops the engine and opens a new one over the same store and log.
    pub fn restart(self, remote: &Arc<MemoryRemote>) -> Self {
        let Device { engine, local, log } = self;
        drop(engine);
        let engine = SyncEngine::new(
            EngineConfig::default(),
            reminders_schema(),
            Arc::clone(&local),
            Arc::clone(remote),
            Box::new(log.clone()) as Box<dyn StorageBackend>,
        )
        .expect("engine");
        Self { engine, local, log }
    }

    pub fn save_user(&self, id: i64, name: &str, parent: Option<i64>) {
        self.engine
            .save_local(
                &zone(),
                &user(id),
                [
                    ("name", FieldValue::from(name)),
                    ("parentID", FieldValue::from(parent)),
                ],
            )
            .expect("save user");
    }

    pub fn save_list(&self, id: i64, title: &str) {
        self.engine
            .save_local(&zone(), &list(id), [("title", title)])
            .expect("save list");
    }

    pub fn save_reminder(&self, id: i64, title: &str, list_id: i64, assignee: Option<i64>) {
        self.engine
            .save_local(
                &zone(),
                &reminder(id),
                [
                    ("title", FieldValue::from(title)),
                    ("remindersListID", FieldValue::from(list_id)),
                    ("assigneeID", FieldValue::from(assignee)),
                ],
            )
            .expect("save reminder");
    }

    pub fn sync(&self) {
        self.engine.sync(&zone()).expect("sync");
    }

    pub fn count(&self, table: &str) -> usize {
        self.engine.local().count(table)
    }

    pub fn has(&self, key: &RecordKey) -> bool {
        self.engine.local().row(key).is_some()
    }

    pub fn value(&self, key: &RecordKey, field: &str) -> Option<FieldValue> {
        self.engine.local().value(key, field)
    }

    pub fn parent_of(&self, id: i64) -> Option<FieldValue> {
        self.value(&user(id), "parentID")
    }
}

pub fn remote() -> Arc<MemoryRemote> {
    Arc::new(MemoryRemote::new(reminders_schema()))
}

/// A user row as another device would have uploaded it.
pub fn remote_user(id: i64, name: &str, parent: Option<i64>, ts: u64) -> RecordChange {
    let ts = LogicalTimestamp::new(ts);
    RecordChange::save(zone(), user(id), FieldMap::new())
        .with_field("id", id, ts)
        .with_field("name", name, ts)
        .with_field("parentID", parent, ts)
}
