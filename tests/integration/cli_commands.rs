#![allow(missing_docs)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use sombra_node::{
    log::{FileLog, LogService},
    model::{OperationBatch, OperationBlob, OperationType},
    partition::{partition_dir, BulkFileWriter, JOURNAL_FILE_NAME},
    types::{NodeId, PartitionId, BROADCAST_KEY},
};
use tempfile::TempDir;

fn seed_partition(data_dir: &Path, id: PartitionId) {
    let dir = partition_dir(data_dir, id);
    std::fs::create_dir_all(&dir).unwrap();
    let mut writer = BulkFileWriter::create(dir.join(JOURNAL_FILE_NAME), id).unwrap();
    writer
        .write(
            2,
            OperationBatch::new(vec![OperationBlob::broadcast(
                OperationType::CreateVertexType,
                b"person".to_vec(),
            )]),
        )
        .unwrap();
    writer
        .write(
            4,
            OperationBatch::new(vec![OperationBlob::new(
                OperationType::OverwriteVertex,
                42,
                b"alice".to_vec(),
            )]),
        )
        .unwrap();
    writer.finish().unwrap();
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json output")
}

#[test]
fn append_writes_sequential_records() {
    let dir = TempDir::new().expect("tempdir");
    let log_dir = dir.path().join("log");
    let log_arg = log_dir.to_str().unwrap();

    let output = cargo_bin_cmd!("sombra-node")
        .args(["append", "--log-dir", log_arg, "--snapshot", "3"])
        .args(["--op", "create_vertex_type", "--key", "-1", "--value", "person"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8(output).unwrap().trim(), "0");

    let output = cargo_bin_cmd!("sombra-node")
        .args(["--format", "json", "append", "--log-dir", log_arg, "--snapshot", "4"])
        .args(["--op", "overwrite-vertex", "--key", "7", "--value", "bob"])
        .assert()
        .success()
        .get_output()
        .clone();
    assert_eq!(stdout_json(&output)["offset"], 1);

    let log = FileLog::open(&log_dir).unwrap();
    let mut reader = log.create_reader(NodeId(0), 0).unwrap();
    let first = reader.read_next_record().unwrap().expect("first record");
    let second = reader.read_next_record().unwrap().expect("second record");
    assert!(reader.read_next_record().unwrap().is_none());
    assert_eq!(first.snapshot_id, 3);
    assert_eq!(first.batch.ops()[0].op_type, OperationType::CreateVertexType);
    assert_eq!(first.batch.ops()[0].partition_key, BROADCAST_KEY);
    assert_eq!(second.offset, 1);
    assert_eq!(second.batch.ops()[0].payload, b"bob".to_vec());
}

#[test]
fn append_rejects_unknown_operation() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("sombra-node")
        .args(["append", "--log-dir"])
        .arg(dir.path())
        .args(["--snapshot", "1", "--op", "rename_everything", "--key", "1"])
        .assert()
        .failure();
}

#[test]
fn inspect_reports_partition_state() {
    let dir = TempDir::new().expect("tempdir");
    seed_partition(dir.path(), PartitionId(1));

    let output = cargo_bin_cmd!("sombra-node")
        .args(["--format", "json", "inspect", "--data-dir"])
        .arg(dir.path())
        .args(["--partition", "1", "--key", "42"])
        .assert()
        .success()
        .get_output()
        .clone();
    let report = stdout_json(&output);
    assert_eq!(report["partition"], 1);
    assert_eq!(report["durable_snapshot_id"], 4);
    assert_eq!(report["ddl_snapshot_id"], 2);
    assert_eq!(report["live_entities"], 1);
    assert_eq!(report["vertex_types"][0], "person");
    assert_eq!(report["value"], "alice");

    let text = cargo_bin_cmd!("sombra-node")
        .args(["inspect", "--data-dir"])
        .arg(dir.path())
        .args(["--partition", "1"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(text).unwrap();
    assert!(text.contains("durable snapshot 4"), "{text}");
    assert!(text.contains("vertex types     person"), "{text}");
}

#[test]
fn inspect_missing_partition_fails() {
    let dir = TempDir::new().expect("tempdir");
    let output = cargo_bin_cmd!("sombra-node")
        .args(["inspect", "--data-dir"])
        .arg(dir.path())
        .args(["--partition", "3"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8(output).unwrap().contains("no partition"));
}

#[test]
fn run_starts_and_stops_on_stdin_close() {
    let dir = TempDir::new().expect("tempdir");
    let output = cargo_bin_cmd!("sombra-node")
        .args(["--format", "json", "run", "--root"])
        .arg(dir.path())
        .write_stdin("")
        .assert()
        .success()
        .get_output()
        .clone();
    let report = stdout_json(&output);
    assert_eq!(report["snapshot_id"], -1);
    assert!(dir.path().join("meta").join("queue_offsets").exists());
    assert!(partition_dir(&dir.path().join("partitions"), PartitionId(0))
        .join(JOURNAL_FILE_NAME)
        .exists());
}

#[test]
fn run_rejects_secondary_without_primary() {
    let dir = TempDir::new().expect("tempdir");
    let stderr = cargo_bin_cmd!("sombra-node")
        .args(["run", "--role", "secondary", "--root"])
        .arg(dir.path())
        .write_stdin("")
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8(stderr).unwrap().contains("primary_data_dir"));
}
