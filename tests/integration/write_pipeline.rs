#![allow(missing_docs)]

mod common;

use std::time::Duration;

use common::{consumed, key_on, open_partition, vertex, vertex_type, wait_until, Harness};
use sombra_node::{
    model::{EntityKind, SnapshotInfo},
    types::{PartitionId, NO_OFFSET, NO_SNAPSHOT},
};

#[test]
fn watermark_trails_latest_applied_batch() {
    let harness = Harness::new();
    let config = harness.config(1);
    let key = key_on(&config, PartitionId(0));
    harness.append(5, vec![vertex(key, "a")]);
    harness.append(6, vec![vertex(key, "b")]);

    let node = harness.node(&config);
    node.start().expect("start node");
    wait_until("both records applied", || consumed(&node) == 1);
    assert_eq!(node.snapshot_info().snapshot_id, 5);
    wait_until("commit of 5", || {
        harness.commits.accepted_snapshots().last() == Some(&5)
    });
    node.stop();

    let partition = open_partition(&config, PartitionId(0));
    assert_eq!(
        partition.get_latest(EntityKind::Vertex, key),
        Some(b"b".to_vec())
    );
    assert_eq!(partition.get(EntityKind::Vertex, key, 5), Some(b"a".to_vec()));
    assert_eq!(partition.durable_snapshot_id(), 6);
}

#[test]
fn broadcast_schema_change_reaches_every_partition() {
    let harness = Harness::new();
    let config = harness.config(2);
    harness.append(7, vec![vertex_type("person")]);
    harness.append(8, vec![vertex(key_on(&config, PartitionId(1)), "x")]);

    let node = harness.node(&config);
    node.start().expect("start node");
    wait_until("records applied", || consumed(&node) == 1);
    assert_eq!(node.writer().last_ddl_snapshot_id(), 7);
    assert_eq!(*node.snapshot_info(), SnapshotInfo::new(7, 7));
    wait_until("commit carrying ddl 7", || {
        harness
            .commits
            .accepted()
            .iter()
            .any(|commit| commit.snapshot_id == 7 && commit.ddl_snapshot_id == 7)
    });
    node.stop();

    let ddl_writes: Vec<_> = harness
        .faults
        .writes()
        .into_iter()
        .filter(|write| write.snapshot_id == 7)
        .map(|write| write.partition)
        .collect();
    assert_eq!(ddl_writes.len(), 2);
    for id in [PartitionId(0), PartitionId(1)] {
        let partition = open_partition(&config, id);
        assert_eq!(partition.vertex_types(), vec!["person".to_string()]);
        assert_eq!(partition.ddl_snapshot_id(), 7);
    }
}

#[test]
fn full_write_buffer_holds_back_the_log() {
    let harness = Harness::new();
    let mut config = harness.config(1);
    config.write_buffer_capacity = 1;
    let key = key_on(&config, PartitionId(0));
    harness.faults.fail_always(PartitionId(0));
    for snapshot in 1..=6 {
        harness.append(snapshot, vec![vertex(key, &snapshot.to_string())]);
    }

    let node = harness.node(&config);
    node.start().expect("start node");
    wait_until("writer retrying the first batch", || {
        harness.faults.failures(PartitionId(0)) >= 3
    });
    std::thread::sleep(Duration::from_millis(50));
    assert!(node.writer().buffered() <= 1);
    assert_eq!(consumed(&node), NO_OFFSET);
    assert_eq!(node.snapshot_info().snapshot_id, NO_SNAPSHOT);

    harness.faults.heal(PartitionId(0));
    wait_until("backlog drained", || consumed(&node) == 5);
    assert_eq!(node.snapshot_info().snapshot_id, 5);
    let applied: Vec<_> = harness
        .faults
        .writes()
        .iter()
        .map(|write| write.snapshot_id)
        .collect();
    assert_eq!(applied, vec![1, 2, 3, 4, 5, 6]);
    node.stop();
}

#[test]
fn live_records_are_applied_after_replay() {
    let harness = Harness::new();
    let config = harness.config(2);
    let node = harness.node(&config);
    node.start().expect("start node");

    for snapshot in 1..=4 {
        let partition = PartitionId((snapshot % 2) as u32);
        harness.append(snapshot, vec![vertex(key_on(&config, partition), "v")]);
    }
    wait_until("live records applied", || consumed(&node) == 3);
    assert_eq!(node.snapshot_info().snapshot_id, 3);
    assert_eq!(harness.faults.writes_to(PartitionId(0)), 2);
    assert_eq!(harness.faults.writes_to(PartitionId(1)), 2);
    node.stop();
}
