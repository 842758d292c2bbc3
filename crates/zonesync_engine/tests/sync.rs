//! Cross-table references, conflicts and the sync cycle.

mod common;

use common::*;
use std::time::Duration;
use zonesync_engine::{EngineConfig, RemoteStore, RetryConfig, SyncError, SyncState};
use zonesync_protocol::{FieldMap, FieldValue, LogicalTimestamp, RecordChange};

#[test]
fn set_null_reference_survives_parent_delete() {
    let remote = remote();
    let a = Device::new(&remote);
    a.save_user(1, "Assignee", None);
    a.save_list(1, "Groceries");
    a.save_reminder(1, "Milk", 1, Some(1));
    a.sync();

    let b = Device::new(&remote);
    b.sync();

    let outcome = a.engine.delete_local(&zone(), &user(1)).unwrap();
    assert_eq!(outcome.deleted, vec![user(1)]);
    assert_eq!(outcome.nulled, vec![reminder(1)]);
    assert_eq!(a.value(&reminder(1), "assigneeID"), Some(FieldValue::Null));

    // The nulled reminder must reach the remote before the user goes.
    let keys: Vec<_> = a.engine.next_batch(&zone()).unwrap().keys().cloned().collect();
    assert_eq!(keys, vec![reminder(1), user(1)]);

    let result = a.engine.sync(&zone()).unwrap();
    assert!(result.failed.is_empty());
    assert!(remote.record(&zone(), &user(1)).is_none());

    b.sync();
    assert!(!b.has(&user(1)));
    assert_eq!(b.value(&reminder(1), "assigneeID"), Some(FieldValue::Null));
    assert_eq!(b.value(&reminder(1), "title"), Some(FieldValue::from("Milk")));
}

#[test]
fn list_delete_cascades_to_reminders() {
    let remote = remote();
    let a = Device::new(&remote);
    a.save_list(1, "Groceries");
    a.save_list(2, "Chores");
    a.save_reminder(1, "Milk", 1, None);
    a.save_reminder(2, "Eggs", 1, None);
    a.save_reminder(3, "Dishes", 2, None);
    a.sync();

    let outcome = a.engine.delete_local(&zone(), &list(1)).unwrap();
    assert_eq!(outcome.deleted.len(), 3);
    assert_eq!(outcome.deleted.last(), Some(&list(1)));
    a.sync();

    assert_eq!(a.count("reminders"), 1);
    assert_eq!(remote.records(&zone()).len(), 2);
}

#[test]
fn no_action_reference_blocks_local_delete() {
    let remote = remote();
    let device = Device::new(&remote);
    device.save_list(1, "Groceries");
    device.save_reminder(1, "Milk", 1, None);
    device
        .engine
        .save_local(&zone(), &attachment(1), [("reminderID", 1)])
        .unwrap();
    device.sync();

    let err = device.engine.delete_local(&zone(), &list(1)).unwrap_err();
    assert!(matches!(
        err,
        SyncError::ReferenceViolation { ref key, ref referenced_by }
            if *key == reminder(1) && *referenced_by == attachment(1)
    ));
    assert!(device.has(&list(1)));
    assert!(device.has(&reminder(1)));
    assert_eq!(device.engine.pending_count(&zone()).unwrap(), 0);
}

#[test]
fn remote_delete_refused_by_local_reference_is_reported() {
    let remote = remote();
    let a = Device::new(&remote);
    a.save_list(1, "Groceries");
    a.save_reminder(1, "Milk", 1, None);
    a.sync();

    let b = Device::new(&remote);
    b.sync();

    a.engine
        .save_local(&zone(), &attachment(1), [("reminderID", 1)])
        .unwrap();
    b.engine.delete_local(&zone(), &reminder(1)).unwrap();
    b.sync();

    let result = a.engine.sync(&zone()).unwrap();
    assert_eq!(
        result.applied.rejected_deletions,
        vec![(reminder(1), attachment(1))]
    );
    assert!(a.has(&reminder(1)));
    assert!(a.has(&attachment(1)));
}

#[test]
fn concurrent_edits_converge_to_later_timestamp() {
    let remote = remote();
    let a = Device::new(&remote);
    a.save_user(1, "Original", None);
    a.sync();
    let b = Device::new(&remote);
    b.sync();

    a.save_user(1, "From A", None);
    // B writes twice, so its last stamp is the larger one.
    b.save_user(1, "From B draft", None);
    b.save_user(1, "From B", None);

    a.sync();
    let result = b.engine.sync(&zone()).unwrap();
    assert_eq!(result.applied.conflicts, 1);
    a.sync();

    assert_eq!(a.value(&user(1), "name"), Some(FieldValue::from("From B")));
    assert_eq!(b.value(&user(1), "name"), Some(FieldValue::from("From B")));
    assert_eq!(
        remote.record(&zone(), &user(1)).unwrap()["name"].value,
        FieldValue::from("From B")
    );
    assert!(a.engine.stats().conflicts_resolved >= 1);
}

#[test]
fn equal_timestamps_keep_committed_value() {
    let remote = remote();
    let device = Device::new(&remote);
    device
        .engine
        .apply(&zone(), vec![remote_user(1, "First", None, 4)], vec![])
        .unwrap();
    let report = device
        .engine
        .apply(&zone(), vec![remote_user(1, "Second", None, 4)], vec![])
        .unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(device.value(&user(1), "name"), Some(FieldValue::from("First")));
}

#[test]
fn local_writes_stamp_past_observed_remote_time() {
    let remote = remote();
    let device = Device::new(&remote);
    device
        .engine
        .apply(&zone(), vec![remote_user(1, "Remote", None, 900)], vec![])
        .unwrap();
    let ts = device
        .engine
        .save_local(&zone(), &user(1), [("name", "Local")])
        .unwrap();
    assert!(ts > LogicalTimestamp::new(900));
}

#[test]
fn malformed_remote_record_does_not_block_siblings() {
    let remote = remote();
    let nameless = RecordChange::save(zone(), user(5), FieldMap::new())
        .with_field("id", 5, LogicalTimestamp::new(1));
    remote.create_zone(&zone()).unwrap();
    remote
        .push(&zone(), &[nameless, remote_user(6, "Fine", None, 1)])
        .unwrap();

    let device = Device::new(&remote);
    let result = device.engine.sync(&zone()).unwrap();

    assert_eq!(result.applied.rejected.len(), 1);
    assert_eq!(result.applied.rejected[0].record, "5:localUsers");
    assert!(device.has(&user(6)));
    assert!(!device.has(&user(5)));
    assert_eq!(device.engine.stats().records_rejected, 1);
}

#[test]
fn paged_fetch_persists_token() {
    let remote = remote();
    let a = Device::new(&remote);
    for id in 1..=7 {
        a.save_user(id, "user", None);
    }
    a.sync();

    remote.set_page_limit(3);
    let b = Device::new(&remote);
    let result = b.engine.sync(&zone()).unwrap();
    assert_eq!(result.fetched, 7);
    assert_eq!(b.count("localUsers"), 7);
    let token = b.engine.token(&zone()).expect("token");

    // Nothing new: the token does not move and nothing is fetched.
    let again = b.engine.sync(&zone()).unwrap();
    assert_eq!(again.fetched, 0);
    assert_eq!(b.engine.token(&zone()), Some(token));
}

#[test]
fn edit_during_upload_stays_pending() {
    let remote = remote();
    let device = Device::new(&remote);
    device.save_user(1, "Before", None);

    let batch = device.engine.next_batch(&zone()).unwrap();
    device.save_user(1, "During", None);
    let results = remote.push(&zone(), &batch.changes).unwrap();
    let outcome = device
        .engine
        .record_push_results(&zone(), &batch, results)
        .unwrap();

    assert_eq!(outcome.saved, vec![user(1)]);
    assert!(device.engine.is_pending(&zone(), &user(1)).unwrap());

    device.engine.push_pending(&zone()).unwrap();
    assert!(!device.engine.is_pending(&zone(), &user(1)).unwrap());
    assert_eq!(
        remote.record(&zone(), &user(1)).unwrap()["name"].value,
        FieldValue::from("During")
    );
}

#[test]
fn zone_deletion_reaches_other_device() {
    let remote = remote();
    let a = Device::new(&remote);
    a.save_user(1, "Root", None);
    a.save_user(2, "Child", Some(1));
    a.save_list(1, "Groceries");
    a.sync();

    let b = Device::new(&remote);
    b.sync();
    b.engine
        .apply(&zone(), vec![remote_user(9, "Orphan", Some(8), 1)], vec![])
        .unwrap();
    assert_eq!(b.engine.unsynced_count(&zone()), 1);

    assert_eq!(a.engine.delete_zone(&zone()).unwrap(), 3);
    assert!(!remote.has_zone(&zone()));
    assert!(a.engine.zones().is_empty());

    let result = b.engine.sync(&zone()).unwrap();
    assert!(result.zone_deleted);
    assert!(b.engine.local().is_empty());
    assert_eq!(b.engine.unsynced_count(&zone()), 0);
    assert!(b.engine.token(&zone()).is_none());
    assert!(matches!(b.engine.state(&zone()), Err(SyncError::UnknownZone(_))));
}

#[test]
fn retryable_failure_is_retried() {
    let remote = remote();
    let retry = RetryConfig::new(3)
        .with_initial_delay(Duration::from_millis(1))
        .with_jitter(false);
    let device = Device::with_config(&remote, EngineConfig::default().with_retry(retry));
    device.save_user(1, "Root", None);

    remote.inject_failure(SyncError::transport_retryable("connection reset"));
    let result = device.engine.sync_with_retry(&zone()).unwrap();

    assert_eq!(result.pushed, 1);
    assert_eq!(device.engine.stats().retries, 1);
    assert_eq!(device.engine.state(&zone()).unwrap(), SyncState::Synced);
}

#[test]
fn fatal_failure_is_not_retried() {
    let remote = remote();
    let device = Device::new(&remote);
    device.save_user(1, "Root", None);

    remote.inject_failure(SyncError::transport_fatal("quota exceeded"));
    let err = device.engine.sync_with_retry(&zone()).unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!(device.engine.stats().retries, 0);
    assert_eq!(device.engine.state(&zone()).unwrap(), SyncState::Error);
    assert_eq!(device.engine.pending_count(&zone()).unwrap(), 1);
    assert!(device.engine.stats().last_error.is_some());

    device.sync();
    assert_eq!(device.engine.pending_count(&zone()).unwrap(), 0);
}

#[test]
fn zones_are_independent() {
    let remote = remote();
    let device = Device::new(&remote);
    let shared = zonesync_protocol::ZoneId::shared("family");
    device.engine.create_zone(&shared).unwrap();

    device.save_user(1, "Private root", None);
    let err = device
        .engine
        .save_local(&shared, &user(2), [("name", FieldValue::from("x")), ("parentID", FieldValue::from(1))])
        .unwrap_err();
    assert!(matches!(err, SyncError::Store(_)));

    device
        .engine
        .save_local(&shared, &user(3), [("name", "Shared root")])
        .unwrap();
    device.sync();
    device.engine.sync(&shared).unwrap();

    assert_eq!(remote.records(&zone()).len(), 1);
    assert_eq!(remote.records(&shared).len(), 1);
    assert_eq!(device.engine.zones().len(), 2);
}
