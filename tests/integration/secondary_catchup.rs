#![allow(missing_docs)]

mod common;

use std::collections::BTreeMap;

use common::{consumed, fast_config, key_on, vertex, vertex_type, wait_until, Harness};
use sombra_node::{
    config::{NodeConfig, NodeRole},
    model::{EntityKind, OperationBatch, OperationType},
    partition::{
        bulk_file_name, partition_dir, BulkFileWriter, GraphPartition, KvPartition,
        KvPartitionFactory,
    },
    types::{PartitionId, StoreError},
};

fn follower_of(leader: &Harness) -> Harness {
    Harness {
        log: leader.log.clone(),
        ..Harness::new()
    }
}

fn secondary_config(follower: &Harness, leader: &NodeConfig) -> NodeConfig {
    NodeConfig {
        role: NodeRole::Secondary,
        primary_data_dir: Some(leader.data_dir.clone()),
        ..fast_config(&follower.dir.path().join("secondary"), leader.partition_count)
    }
}

#[test]
fn secondary_applies_only_schema_from_the_log() {
    let leader = Harness::new();
    let follower = follower_of(&leader);
    let primary_config = leader.config(2);
    let secondary_config = secondary_config(&follower, &primary_config);

    let primary = leader.node(&primary_config);
    let secondary = follower.node(&secondary_config);
    primary.start().expect("start primary");
    secondary.start().expect("start secondary");

    leader.append(1, vec![vertex_type("person")]);
    leader.append(2, vec![vertex(key_on(&primary_config, PartitionId(0)), "alice")]);
    wait_until("primary applied both records", || consumed(&primary) == 1);
    wait_until("secondary applied the schema record", || consumed(&secondary) == 0);
    wait_until("catch-up rounds on both partitions", || {
        follower.faults.catch_ups() >= 4
    });

    let writes = follower.faults.writes();
    assert_eq!(writes.len(), 2);
    assert!(writes
        .iter()
        .all(|write| write.op_types == vec![OperationType::CreateVertexType]));
    assert_eq!(secondary.writer().last_ddl_snapshot_id(), 1);
    let scheduler = secondary.catchup().expect("secondary runs catch-up");
    assert!(scheduler.rounds_completed() >= 1);
    assert_eq!(scheduler.rounds_failed(), 0);
    assert!(primary.catchup().is_none());

    secondary.stop();
    primary.stop();
}

#[test]
fn replica_partition_follows_primary_across_compaction() {
    let leader = Harness::new();
    let config = leader.config(1);
    let key = key_on(&config, PartitionId(0));
    let primary = leader.node(&config);
    primary.start().expect("start primary");
    leader.append(1, vec![vertex(key, "alice")]);
    wait_until("first record applied", || consumed(&primary) == 0);

    let replica_dir = leader.dir.path().join("replica");
    let mut replica = KvPartition::open_secondary(
        PartitionId(0),
        &replica_dir,
        partition_dir(&config.data_dir, PartitionId(0)),
    )
    .unwrap();
    replica.recover().unwrap();
    assert_eq!(
        replica.get_latest(EntityKind::Vertex, key),
        Some(b"alice".to_vec())
    );

    primary.service().compact_db().expect("compact");
    leader.append(2, vec![vertex(key + 1, "bob")]);
    wait_until("second record applied", || consumed(&primary) == 1);
    replica.try_catch_up_with_primary().unwrap();
    assert_eq!(
        replica.get_latest(EntityKind::Vertex, key),
        Some(b"alice".to_vec())
    );
    assert_eq!(
        replica.get_latest(EntityKind::Vertex, key + 1),
        Some(b"bob".to_vec())
    );
    assert_eq!(replica.durable_snapshot_id(), 2);
    assert!(!replica_dir.join("journal.log").exists());
    primary.stop();
}

#[test]
fn secondary_only_operations_are_role_checked() {
    let leader = Harness::new();
    let follower = follower_of(&leader);
    let primary_config = leader.config(1);
    let secondary_config = secondary_config(&follower, &primary_config);

    let primary = leader.node(&primary_config);
    let secondary = follower.node(&secondary_config);
    primary.start().expect("start primary");
    secondary.start().expect("start secondary");

    assert!(matches!(
        primary.service().reopen_secondary(),
        Err(StoreError::NotSecondary)
    ));
    secondary.service().reopen_secondary().expect("manual catch-up");

    let remote = follower.dir.path().join("bulk");
    std::fs::create_dir_all(&remote).unwrap();
    let id = PartitionId(0);
    let mut bulk = BulkFileWriter::create(remote.join(bulk_file_name(id)), id).unwrap();
    bulk.write(1, OperationBatch::new(vec![vertex(0, "a")])).unwrap();
    bulk.finish().unwrap();
    assert!(matches!(
        secondary.service().ingest(&remote, &BTreeMap::new()),
        Err(StoreError::Partition { .. })
    ));

    secondary.stop();
    primary.stop();
}

#[test]
fn secondary_factory_requires_primary_location() {
    let harness = Harness::new();
    let config = NodeConfig {
        role: NodeRole::Secondary,
        ..harness.config(1)
    };
    assert!(matches!(
        KvPartitionFactory::from_config(&config),
        Err(StoreError::Invalid(_))
    ));
}
