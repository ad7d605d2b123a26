#![allow(missing_docs)]

mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use common::{consumed, key_on, open_partition, vertex, wait_until, GatedStorage, Harness};
use sombra_node::{
    config::NodeConfig,
    model::{EntityKind, OperationBatch},
    partition::{bulk_file_name, BulkFileWriter, ExternalStorage},
    service::KEEP_DOWNLOADS_OPTION,
    types::{PartitionId, StoreError},
};

/// Writes one bulk file per partition, each holding `key_on(partition)`.
fn stage_bulk_load(config: &NodeConfig, remote: &Path, snapshot_id: i64) {
    std::fs::create_dir_all(remote).unwrap();
    for partition in 0..config.partition_count {
        let id = PartitionId(partition);
        let mut writer = BulkFileWriter::create(remote.join(bulk_file_name(id)), id).unwrap();
        writer
            .write(
                snapshot_id,
                OperationBatch::new(vec![vertex(key_on(config, id), &format!("bulk-{partition}"))]),
            )
            .unwrap();
        writer.finish().unwrap();
    }
}

fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn ingest_loads_every_partition_and_cleans_up() {
    let harness = Harness::new();
    let config = harness.config(2);
    let remote = harness.dir.path().join("remote").join("load-1");
    stage_bulk_load(&config, &remote, 10);

    let node = harness.node(&config);
    node.start().expect("start node");
    node.service()
        .ingest(&remote, &BTreeMap::new())
        .expect("ingest");
    assert!(!config.download_dir.join("load-1").exists());
    node.stop();

    for partition in 0..2 {
        let id = PartitionId(partition);
        let stored = open_partition(&config, id);
        assert_eq!(
            stored.get_latest(EntityKind::Vertex, key_on(&config, id)),
            Some(format!("bulk-{partition}").into_bytes())
        );
    }
}

#[test]
fn ingest_can_keep_downloaded_files() {
    let harness = Harness::new();
    let config = harness.config(2);
    let remote = harness.dir.path().join("remote").join("load-2");
    stage_bulk_load(&config, &remote, 3);

    let node = harness.node(&config);
    node.start().expect("start node");
    let service = node.service();
    service
        .ingest(&remote, &options(&[(KEEP_DOWNLOADS_OPTION, "true")]))
        .expect("ingest");
    let staged = config.download_dir.join("load-2");
    assert!(staged.join(bulk_file_name(PartitionId(0))).exists());
    assert!(staged.join(bulk_file_name(PartitionId(1))).exists());

    service.clear_ingest(&remote).expect("clear");
    assert!(!staged.exists());
    assert!(matches!(
        service.ingest(&remote, &options(&[(KEEP_DOWNLOADS_OPTION, "maybe")])),
        Err(StoreError::Invalid(_))
    ));
    node.stop();
}

#[test]
fn missing_bulk_file_fails_ingest() {
    let harness = Harness::new();
    let config = harness.config(2);
    let remote = harness.dir.path().join("remote").join("partial");
    stage_bulk_load(&config, &remote, 3);
    std::fs::remove_file(remote.join(bulk_file_name(PartitionId(1)))).unwrap();

    let node = harness.node(&config);
    node.start().expect("start node");
    assert!(matches!(
        node.service().ingest(&remote, &BTreeMap::new()),
        Err(StoreError::MissingFile(_))
    ));
    assert!(!config.download_dir.join("partial").exists());
    node.stop();
}

#[test]
fn overlapping_ingest_is_rejected() {
    let harness = Harness::new();
    let config = harness.config(1);
    let first_remote = harness.dir.path().join("remote").join("first");
    let second_remote = harness.dir.path().join("remote").join("second");
    stage_bulk_load(&config, &first_remote, 4);
    stage_bulk_load(&config, &second_remote, 5);

    let storage = Arc::new(GatedStorage::default());
    let node = Arc::new(
        harness.node_with_storage(&config, Arc::clone(&storage) as Arc<dyn ExternalStorage>),
    );
    node.start().expect("start node");

    let running = {
        let node = Arc::clone(&node);
        let remote = first_remote.clone();
        thread::spawn(move || node.service().ingest(&remote, &BTreeMap::new()))
    };
    wait_until("first ingest downloading", || storage.entered() == 1);
    assert!(matches!(
        node.service().ingest(&second_remote, &BTreeMap::new()),
        Err(StoreError::IngestBusy)
    ));
    assert!(config.download_dir.join("first").exists());

    storage.open();
    running.join().unwrap().expect("first ingest");
    node.service()
        .ingest(&second_remote, &BTreeMap::new())
        .expect("second ingest after the first finished");
    node.stop();
}

#[test]
fn state_reports_disk_usage_per_partition() {
    let harness = Harness::new();
    let config = harness.config(3);
    let node = harness.node(&config);
    node.start().expect("start node");
    let states = node.service().get_state().expect("state");
    let partitions: Vec<_> = states.iter().map(|state| state.partition).collect();
    assert_eq!(partitions, vec![PartitionId(0), PartitionId(1), PartitionId(2)]);
    for state in &states {
        assert!(state.total_space > 0);
        assert!(state.usable_space <= state.total_space);
    }
    node.stop();
    assert!(matches!(node.service().get_state(), Err(StoreError::Stopped)));
}

#[test]
fn compaction_and_gc_keep_visible_data() {
    let harness = Harness::new();
    let config = harness.config(1);
    let key = key_on(&config, PartitionId(0));
    for snapshot in 1..=4 {
        harness.append(snapshot, vec![vertex(key, &format!("v{snapshot}"))]);
    }
    let node = harness.node(&config);
    node.start().expect("start node");
    wait_until("records applied", || consumed(&node) == 3);

    let service = node.service();
    service.garbage_collect(3).expect("gc");
    service.compact_db().expect("compact");
    node.stop();

    let partition = open_partition(&config, PartitionId(0));
    assert_eq!(partition.gc_snapshot_id(), 3);
    assert_eq!(partition.version_count(EntityKind::Vertex, key), 2);
    assert_eq!(partition.get(EntityKind::Vertex, key, 3), Some(b"v3".to_vec()));
    assert_eq!(
        partition.get_latest(EntityKind::Vertex, key),
        Some(b"v4".to_vec())
    );
}

#[test]
fn gc_can_be_disabled() {
    let harness = Harness::new();
    let config = NodeConfig {
        gc_enabled: false,
        ..harness.config(1)
    };
    let node = harness.node(&config);
    node.start().expect("start node");
    assert!(matches!(
        node.service().garbage_collect(5),
        Err(StoreError::GcDisabled)
    ));
    node.stop();
}

#[test]
fn replay_from_offset_filters_by_timestamp() {
    let harness = Harness::new();
    let config = harness.config(1);
    let key = key_on(&config, PartitionId(0));
    harness.append_at(1, 100, vec![vertex(key, "a")]);
    harness.append_at(2, 200, vec![vertex(key, "b")]);
    harness.append_at(3, 300, vec![vertex(key, "c")]);

    let node = harness.node(&config);
    node.start().expect("start node");
    wait_until("records applied", || consumed(&node) == 2);
    let watermark = node.snapshot_info().snapshot_id;

    let replayed = node
        .service()
        .replay_records_from(0, 200)
        .expect("replay");
    assert_eq!(replayed, vec![2, 3]);
    wait_until("replayed batches written", || harness.faults.writes().len() == 5);
    assert_eq!(node.snapshot_info().snapshot_id, watermark);
    assert_eq!(node.service().replay_records_from(2, 0).unwrap(), vec![3]);
    node.stop();
}
