use replication_ledger::config::ReplicationConfig;
use replication_ledger::store::memory::DeleteFault;
use replication_ledger::store::{MemoryRecordStore, RecordGroup, RecordStore, StatusEntry};
use replication_ledger::{GarbageCollector, LedgerError, ProgressRecord, ReplicationTarget};
use std::sync::Arc;

fn store_with_targets(targets: &[(&str, &str)]) -> Arc<MemoryRecordStore> {
    let mut config = ReplicationConfig::default();
    for (peer, remote) in targets {
        config.add_target("1", peer, remote);
    }
    Arc::new(MemoryRecordStore::with_config(config))
}

fn status(sequence: u64, progress: ProgressRecord) -> StatusEntry {
    StatusEntry {
        source_table_id: "1".to_string(),
        sequence,
        progress,
    }
}

fn done(offset: u64) -> ProgressRecord {
    ProgressRecord::new(offset, offset, true, false)
}

fn peer(name: &str, remote: &str) -> ReplicationTarget {
    ReplicationTarget::new(name, remote, "1")
}

#[test]
fn open_files_without_work_are_kept() {
    let store = store_with_targets(&[("peer1", "5")]);
    for (idx, file) in ["/wal/1", "/wal/2", "/wal/3"].iter().enumerate() {
        store.insert_group(RecordGroup::new(
            *file,
            status(idx as u64 + 1, ProgressRecord::new(0, 0, false, false)),
        ));
    }

    let gc = GarbageCollector::new(store.clone());
    let stats = gc.run_pass().unwrap();
    assert_eq!(stats.records_removed, 0);
    assert_eq!(stats.groups_scanned, 3);
    assert_eq!(store.file_count(), 3);
}

#[test]
fn fully_replicated_group_removes_status_and_work() {
    let store = store_with_targets(&[("peer1", "5")]);
    store.insert_group(
        RecordGroup::new("/wal/1", status(1, done(10000)))
            .with_work(peer("peer1", "5"), done(10000)),
    );

    let gc = GarbageCollector::new(store.clone());
    let stats = gc.run_pass().unwrap();
    assert_eq!(stats.groups_removed, 1);
    assert_eq!(stats.records_removed, 2);
    assert_eq!(store.record_count(), 0);
    assert_eq!(store.flush_count(), 1);
}

#[test]
fn one_incomplete_target_keeps_the_group() {
    let store = store_with_targets(&[("peer1", "5"), ("peer2", "6")]);
    store.insert_group(
        RecordGroup::new("/wal/1", status(1, done(10000)))
            .with_work(peer("peer1", "5"), done(10000))
            .with_work(peer("peer2", "6"), ProgressRecord::new(10000, 10000, false, false)),
    );

    let gc = GarbageCollector::new(store.clone());
    let stats = gc.run_pass().unwrap();
    assert_eq!(stats.records_removed, 0);
    assert_eq!(store.record_count(), 3);
}

#[test]
fn second_pass_removes_nothing() {
    let store = store_with_targets(&[("peer1", "5")]);
    store.insert_group(
        RecordGroup::new("/wal/1", status(1, done(50))).with_work(peer("peer1", "5"), done(50)),
    );
    store.insert_group(
        RecordGroup::new("/wal/2", status(2, done(50))).with_work(peer("peer1", "5"), done(50)),
    );

    let gc = GarbageCollector::new(store.clone());
    assert_eq!(gc.run_pass().unwrap().records_removed, 4);
    let second = gc.run_pass().unwrap();
    assert_eq!(second.records_removed, 0);
    assert_eq!(second.groups_scanned, 0);
}

#[test]
fn closed_status_without_work_for_configured_target_is_kept() {
    let store = store_with_targets(&[("peer1", "5"), ("peer2", "6")]);
    store.insert_group(
        RecordGroup::new("/wal/1", status(1, done(10))).with_work(peer("peer1", "5"), done(10)),
    );

    let gc = GarbageCollector::new(store.clone());
    assert_eq!(gc.run_pass().unwrap().records_removed, 0);
    assert!(store.group("/wal/1").is_some());
}

#[test]
fn orphaned_work_is_deleted_with_the_group() {
    let store = store_with_targets(&[("peer1", "5")]);
    store.insert_group(
        RecordGroup::new("/wal/1", status(1, done(10)))
            .with_work(peer("peer1", "5"), done(10))
            .with_work(peer("retired", "9"), ProgressRecord::ingested_until(10)),
    );

    let gc = GarbageCollector::new(store.clone());
    let stats = gc.run_pass().unwrap();
    assert_eq!(stats.records_removed, 3);
    assert_eq!(store.file_count(), 0);
}

#[test]
fn malformed_group_is_skipped_not_deleted() {
    let store = store_with_targets(&[]);
    store.insert_group(RecordGroup::new(
        "/wal/bad",
        status(1, ProgressRecord::new(20, 10, true, false)),
    ));
    store.insert_group(RecordGroup::new("/wal/good", status(2, done(10))));

    let gc = GarbageCollector::new(store.clone());
    let stats = gc.run_pass().unwrap();
    assert_eq!(stats.malformed_groups, 1);
    assert_eq!(stats.records_removed, 1);
    assert!(store.group("/wal/bad").is_some());
    assert!(store.group("/wal/good").is_none());
}

#[test]
fn unavailable_store_aborts_the_pass() {
    let store = store_with_targets(&[("peer1", "5")]);
    store.insert_group(RecordGroup::new("/wal/1", status(1, done(10))));
    store.set_unavailable(true);

    let gc = GarbageCollector::new(store.clone());
    assert!(matches!(
        gc.run_pass(),
        Err(LedgerError::StoreUnavailable(_))
    ));
    store.set_unavailable(false);
    assert_eq!(store.file_count(), 1);
}

#[test]
fn delete_failure_does_not_stop_other_groups() {
    let store = store_with_targets(&[("peer1", "5")]);
    for (seq, file) in [(1, "/wal/1"), (2, "/wal/2"), (3, "/wal/3")] {
        store.insert_group(
            RecordGroup::new(file, status(seq, done(10))).with_work(peer("peer1", "5"), done(10)),
        );
    }
    store.fail_deletes_for("/wal/2", DeleteFault::Reject);

    let gc = GarbageCollector::new(store.clone());
    match gc.run_pass() {
        Err(LedgerError::PartialBatchDeleteFailure {
            removed,
            failed_files,
        }) => {
            assert_eq!(removed, 4);
            assert_eq!(failed_files, vec!["/wal/2".to_string()]);
        }
        other => panic!("expected partial failure, got {:?}", other),
    }
    assert_eq!(store.file_count(), 1);
    assert_eq!(store.flush_count(), 1);

    store.clear_delete_faults();
    assert_eq!(gc.run_pass().unwrap().records_removed, 2);
    assert_eq!(store.file_count(), 0);
}

#[test]
fn interrupted_delete_is_finished_on_the_next_pass() {
    let store = store_with_targets(&[("peer1", "5"), ("peer2", "6")]);
    store.insert_group(
        RecordGroup::new("/wal/1", status(1, done(10)))
            .with_work(peer("peer1", "5"), done(10))
            .with_work(peer("peer2", "6"), done(10)),
    );
    store.fail_deletes_for("/wal/1", DeleteFault::AfterFirst);

    let gc = GarbageCollector::new(store.clone());
    let err = gc.run_pass().unwrap_err();
    assert!(matches!(
        err,
        LedgerError::PartialBatchDeleteFailure { removed: 1, .. }
    ));

    // Status goes first, so only Work records are left behind
    let remnant = store.group("/wal/1").unwrap();
    assert!(remnant.status.is_none());
    assert_eq!(remnant.work.len(), 2);

    store.clear_delete_faults();
    let stats = gc.run_pass().unwrap();
    assert_eq!(stats.records_removed, 2);
    assert_eq!(store.file_count(), 0);
}

#[test]
fn remove_complete_records_accepts_any_group_source() {
    let store = store_with_targets(&[("peer1", "5")]);
    store
        .record_status("/wal/1", "1", ProgressRecord::file_closed(10))
        .unwrap();
    let groups = store.scan_grouped_by_file().unwrap().collect::<Vec<_>>();

    let gc = GarbageCollector::new(store.clone());
    let stats = gc.remove_complete_records(groups).unwrap();
    assert_eq!(stats.groups_scanned, 1);
    assert_eq!(stats.records_removed, 0);
}
