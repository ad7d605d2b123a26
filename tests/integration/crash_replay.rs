#![allow(missing_docs)]

mod common;

use std::fs::OpenOptions;
use std::io::Write;
use std::time::Duration;

use common::{consumed, key_on, open_partition, vertex, wait_until, Harness};
use sombra_node::{
    meta::{FileMetaStore, MetaStore, QUEUE_OFFSETS_KEY},
    model::EntityKind,
    partition::{partition_dir, JOURNAL_FILE_NAME},
    types::{PartitionId, StoreError},
};

#[test]
fn replay_after_lost_offsets_is_idempotent() {
    let harness = Harness::new();
    let config = harness.config(1);
    let key = key_on(&config, PartitionId(0));
    for snapshot in 1..=4 {
        harness.append(snapshot, vec![vertex(key, &format!("v{snapshot}"))]);
    }

    let first = harness.node(&config);
    first.start().expect("start first node");
    wait_until("records applied", || consumed(&first) == 3);
    first.stop();

    // Offsets never reached disk before the crash.
    FileMetaStore::open(&config.meta_dir)
        .unwrap()
        .write(QUEUE_OFFSETS_KEY, b"[-1]")
        .unwrap();

    let second = harness.node(&config);
    second.start().expect("start second node");
    assert_eq!(second.snapshot_info().snapshot_id, 4);
    wait_until("records replayed", || consumed(&second) == 3);
    assert_eq!(second.snapshot_info().snapshot_id, 4);
    assert_eq!(harness.faults.writes().len(), 8);
    second.stop();

    let partition = open_partition(&config, PartitionId(0));
    assert_eq!(partition.version_count(EntityKind::Vertex, key), 4);
    assert_eq!(
        partition.get_latest(EntityKind::Vertex, key),
        Some(b"v4".to_vec())
    );
}

#[test]
fn persisted_offsets_skip_applied_records() {
    let harness = Harness::new();
    let config = harness.config(1);
    let key = key_on(&config, PartitionId(0));
    for snapshot in 1..=3 {
        harness.append(snapshot, vec![vertex(key, "v")]);
    }

    let first = harness.node(&config);
    first.start().expect("start first node");
    wait_until("records applied", || consumed(&first) == 2);
    first.stop();
    assert_eq!(
        FileMetaStore::open(&config.meta_dir)
            .unwrap()
            .read(QUEUE_OFFSETS_KEY)
            .unwrap(),
        Some(b"[2]".to_vec())
    );

    let second = harness.node(&config);
    second.start().expect("start second node");
    assert_eq!(consumed(&second), 2);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(harness.faults.writes().len(), 3);

    harness.append(4, vec![vertex(key, "w")]);
    wait_until("new record applied", || consumed(&second) == 3);
    assert_eq!(harness.faults.writes().len(), 4);
    assert_eq!(second.snapshot_info().snapshot_id, 3);
    second.stop();
}

#[test]
fn changed_queue_count_refuses_to_start() {
    let harness = Harness::new();
    let config = harness.config(1);
    let first = harness.node(&config);
    first.start().expect("start first node");
    first.stop();

    let mut widened = config.clone();
    widened.queue_count = 2;
    let second = harness.node(&widened);
    assert!(matches!(
        second.start(),
        Err(StoreError::QueueCountMismatch {
            persisted: 1,
            configured: 2
        })
    ));
    assert!(!second.store().is_started());
}

#[test]
fn torn_journal_tail_is_discarded_on_restart() {
    let harness = Harness::new();
    let config = harness.config(1);
    let key = key_on(&config, PartitionId(0));
    harness.append(1, vec![vertex(key, "a")]);
    harness.append(2, vec![vertex(key, "b")]);

    let first = harness.node(&config);
    first.start().expect("start first node");
    wait_until("records applied", || consumed(&first) == 1);
    first.stop();

    let journal = partition_dir(&config.data_dir, PartitionId(0)).join(JOURNAL_FILE_NAME);
    let mut file = OpenOptions::new().append(true).open(&journal).unwrap();
    file.write_all(&[0x17, 0, 0, 0, 9, 9]).unwrap();
    drop(file);

    let second = harness.node(&config);
    second.start().expect("start after torn write");
    assert_eq!(second.snapshot_info().snapshot_id, 2);
    harness.append(3, vec![vertex(key, "c")]);
    wait_until("new record applied", || consumed(&second) == 2);
    second.stop();

    let partition = open_partition(&config, PartitionId(0));
    assert_eq!(
        partition.get_latest(EntityKind::Vertex, key),
        Some(b"c".to_vec())
    );
    assert_eq!(partition.durable_snapshot_id(), 3);
}
