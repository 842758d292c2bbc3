//! Durable state across engine restarts.

mod common;

use common::*;
use std::sync::Arc;
use tempfile::tempdir;
use zonesync_engine::{EngineConfig, LocalStore, MemoryStore, SyncEngine, Write};
use zonesync_protocol::{Field, FieldMap, FieldValue, LogicalTimestamp};
use zonesync_storage::{FileBackend, StorageBackend};

#[test]
fn staged_records_survive_restart() {
    let remote = remote();
    let device = Device::new(&remote);
    device
        .engine
        .apply(&zone(), vec![remote_user(3, "Child", Some(2), 1)], vec![])
        .unwrap();

    let device = device.restart(&remote);
    assert_eq!(device.engine.unsynced_count(&zone()), 1);
    assert_eq!(device.engine.zones().len(), 1);

    device
        .engine
        .apply(&zone(), vec![remote_user(2, "Parent", None, 1)], vec![])
        .unwrap();
    assert_eq!(device.engine.unsynced_count(&zone()), 0);
    assert!(device.has(&user(3)));
}

#[test]
fn restart_releases_records_whose_parent_was_committed() {
    let remote = remote();
    let device = Device::new(&remote);
    device
        .engine
        .apply(&zone(), vec![remote_user(3, "Child", Some(2), 1)], vec![])
        .unwrap();

    // The parent lands in the store without the engine seeing it, as after
    // a crash between the group commit and the log cleanup.
    let ts = LogicalTimestamp::new(1);
    let mut fields = FieldMap::new();
    fields.insert("id".into(), Field::new(2, ts));
    fields.insert("name".into(), Field::new("Parent", ts));
    device
        .local
        .commit(vec![Write::Upsert {
            key: user(2),
            zone: zone(),
            fields,
        }])
        .unwrap();

    let device = device.restart(&remote);
    assert_eq!(device.engine.unsynced_count(&zone()), 0);
    assert_eq!(device.parent_of(3), Some(FieldValue::Integer(2)));
}

#[test]
fn change_token_survives_restart() {
    let remote = remote();
    let a = Device::new(&remote);
    a.save_user(1, "Root", None);
    a.sync();

    let b = Device::new(&remote);
    b.sync();
    let token = b.engine.token(&zone());
    assert!(token.is_some());

    let b = b.restart(&remote);
    assert_eq!(b.engine.token(&zone()), token);
    let result = b.engine.sync(&zone()).unwrap();
    assert_eq!(result.fetched, 0);
}

#[test]
fn clock_survives_restart_without_rows() {
    let remote = remote();
    let device = Device::new(&remote);
    device
        .engine
        .apply(&zone(), vec![remote_user(1, "Root", None, 500)], vec![])
        .unwrap();
    device.engine.apply(&zone(), vec![], vec![user(1)]).unwrap();
    assert!(device.engine.local().is_empty());

    let device = device.restart(&remote);
    assert!(device.engine.clock() >= LogicalTimestamp::new(500));
}

#[test]
fn torn_log_tail_is_discarded() {
    let remote = remote();
    let device = Device::new(&remote);
    device
        .engine
        .apply(&zone(), vec![remote_user(3, "Child", Some(2), 1)], vec![])
        .unwrap();

    let mut log = device.log.clone();
    log.append(b"ZSUL\x01\x00\x02\xff").unwrap();

    let device = device.restart(&remote);
    assert_eq!(device.engine.unsynced_count(&zone()), 1);
}

#[test]
fn file_backed_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("unsynced.log");
    let remote = remote();
    let schema = reminders_schema();
    let local = Arc::new(MemoryStore::new(Arc::clone(&schema)));

    let open = |local: &Arc<MemoryStore>| {
        let backend = FileBackend::open_exclusive(&path).unwrap();
        SyncEngine::new(
            EngineConfig::default(),
            Arc::clone(&schema),
            Arc::clone(local),
            Arc::clone(&remote),
            Box::new(backend) as Box<dyn StorageBackend>,
        )
        .unwrap()
    };

    {
        let engine = open(&local);
        engine.create_zone(&zone()).unwrap();
        engine
            .apply(&zone(), vec![remote_user(3, "Child", Some(2), 1)], vec![])
            .unwrap();
        assert!(engine.is_staged(&zone(), &user(3)));
    }

    let engine = open(&local);
    assert!(engine.is_staged(&zone(), &user(3)));
    engine
        .apply(&zone(), vec![remote_user(2, "Parent", None, 1)], vec![])
        .unwrap();
    assert!(!engine.is_staged(&zone(), &user(3)));
    assert_eq!(local.count("localUsers"), 2);
}
