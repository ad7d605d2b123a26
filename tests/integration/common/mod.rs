#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sombra_node::{
    config::NodeConfig,
    log::MemoryLog,
    meta::FileMetaStore,
    model::{OperationBatch, OperationBlob, OperationType},
    partition::{
        partition_dir, ExternalStorage, GraphPartition, KvPartition, KvPartitionFactory,
        LocalFsStorage, PartitionFactory,
    },
    routing::PartitionMap,
    types::{LogOffset, NodeId, PartitionId, QueueId, Result, SnapshotId, StoreError},
    writer::SnapshotCommitClient,
    NodeDeps, StoreNode,
};
use tempfile::TempDir;

pub const NODE: NodeId = NodeId(0);
pub const QUEUE: QueueId = QueueId(0);

/// Node settings with short timers so tests converge quickly.
pub fn fast_config(root: &Path, partition_count: u32) -> NodeConfig {
    NodeConfig {
        partition_count,
        write_retry_interval_ms: 10,
        partition_retry_interval_ms: 5,
        log_poll_timeout_ms: 10,
        offset_persist_interval_ms: 20,
        catchup_interval_ms: 20,
        shutdown_timeout_ms: 5_000,
        sync_writes: false,
        ..NodeConfig::default()
    }
    .with_root(root)
}

pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// First non-negative key routed to `partition`.
pub fn key_on(config: &NodeConfig, partition: PartitionId) -> i64 {
    let map = PartitionMap::round_robin(config.partition_count, config.node_count).unwrap();
    (0..)
        .find(|key| map.partition_for_key(*key) == partition)
        .unwrap()
}

pub fn vertex(key: i64, value: &str) -> OperationBlob {
    OperationBlob::new(OperationType::OverwriteVertex, key, value.as_bytes().to_vec())
}

pub fn vertex_type(name: &str) -> OperationBlob {
    OperationBlob::broadcast(OperationType::CreateVertexType, name.as_bytes().to_vec())
}

pub fn consumed(node: &StoreNode) -> LogOffset {
    node.writer().consumed_queue_offsets().get(QUEUE)
}

/// Opens a stopped node's partition directly from disk.
pub fn open_partition(config: &NodeConfig, id: PartitionId) -> KvPartition {
    let mut partition = KvPartition::open(id, partition_dir(&config.data_dir, id), false).unwrap();
    partition.recover().unwrap();
    partition
}

#[derive(Clone, Copy, Debug)]
enum Fault {
    Times(usize),
    Always,
}

#[derive(Clone, Debug)]
pub struct WriteRecord {
    pub partition: PartitionId,
    pub snapshot_id: SnapshotId,
    pub op_types: Vec<OperationType>,
}

/// Shared script and journal of every partition opened through a
/// [`ScriptedFactory`].
#[derive(Default)]
pub struct FaultPlan {
    faults: Mutex<HashMap<PartitionId, Fault>>,
    writes: Mutex<Vec<WriteRecord>>,
    failures: Mutex<HashMap<PartitionId, usize>>,
    catch_ups: AtomicUsize,
}

impl FaultPlan {
    pub fn fail_times(&self, partition: PartitionId, times: usize) {
        self.faults.lock().insert(partition, Fault::Times(times));
    }

    pub fn fail_always(&self, partition: PartitionId) {
        self.faults.lock().insert(partition, Fault::Always);
    }

    pub fn heal(&self, partition: PartitionId) {
        self.faults.lock().remove(&partition);
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    pub fn writes_to(&self, partition: PartitionId) -> usize {
        self.writes
            .lock()
            .iter()
            .filter(|write| write.partition == partition)
            .count()
    }

    pub fn failures(&self, partition: PartitionId) -> usize {
        self.failures.lock().get(&partition).copied().unwrap_or(0)
    }

    pub fn catch_ups(&self) -> usize {
        self.catch_ups.load(Ordering::SeqCst)
    }

    fn check(&self, partition: PartitionId) -> Result<()> {
        let mut faults = self.faults.lock();
        let fail = match faults.get_mut(&partition) {
            Some(Fault::Always) => true,
            Some(Fault::Times(left)) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };
        if fail {
            *self.failures.lock().entry(partition).or_default() += 1;
            return Err(StoreError::Partition {
                partition,
                reason: "injected fault".into(),
            });
        }
        Ok(())
    }
}

struct ScriptedPartition {
    inner: Box<dyn GraphPartition>,
    faults: Arc<FaultPlan>,
}

impl GraphPartition for ScriptedPartition {
    fn id(&self) -> PartitionId {
        self.inner.id()
    }

    fn write_batch(&mut self, snapshot_id: SnapshotId, ops: &OperationBatch) -> Result<bool> {
        self.faults.check(self.inner.id())?;
        let has_ddl = self.inner.write_batch(snapshot_id, ops)?;
        self.faults.writes.lock().push(WriteRecord {
            partition: self.inner.id(),
            snapshot_id,
            op_types: ops.iter().map(|op| op.op_type).collect(),
        });
        Ok(has_ddl)
    }

    fn recover(&mut self) -> Result<SnapshotId> {
        self.inner.recover()
    }

    fn ingest_external_file(&mut self, local_file: &Path) -> Result<()> {
        self.inner.ingest_external_file(local_file)
    }

    fn garbage_collect(&mut self, snapshot_id: SnapshotId) -> Result<()> {
        self.inner.garbage_collect(snapshot_id)
    }

    fn compact(&mut self) -> Result<()> {
        self.inner.compact()
    }

    fn try_catch_up_with_primary(&mut self) -> Result<()> {
        self.faults.catch_ups.fetch_add(1, Ordering::SeqCst);
        self.inner.try_catch_up_with_primary()
    }

    fn data_dir(&self) -> Option<&Path> {
        self.inner.data_dir()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// Journal-backed partitions with scripted write faults.
pub struct ScriptedFactory {
    inner: KvPartitionFactory,
    faults: Arc<FaultPlan>,
}

impl PartitionFactory for ScriptedFactory {
    fn open(&self, id: PartitionId) -> Result<Box<dyn GraphPartition>> {
        Ok(Box::new(ScriptedPartition {
            inner: self.inner.open(id)?,
            faults: Arc::clone(&self.faults),
        }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub snapshot_id: SnapshotId,
    pub ddl_snapshot_id: SnapshotId,
    pub queue_offsets: Vec<LogOffset>,
}

/// Coordinator stand-in that records commits and can reject the next few.
#[derive(Default)]
pub struct RecordingCommitClient {
    reject_next: AtomicUsize,
    attempts: Mutex<Vec<SnapshotId>>,
    accepted: Mutex<Vec<Commit>>,
}

impl RecordingCommitClient {
    pub fn reject_next(&self, count: usize) {
        self.reject_next.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<SnapshotId> {
        self.attempts.lock().clone()
    }

    pub fn accepted(&self) -> Vec<Commit> {
        self.accepted.lock().clone()
    }

    pub fn accepted_snapshots(&self) -> Vec<SnapshotId> {
        self.accepted.lock().iter().map(|c| c.snapshot_id).collect()
    }
}

impl SnapshotCommitClient for RecordingCommitClient {
    fn commit_snapshot_id(
        &self,
        _node: NodeId,
        snapshot_id: SnapshotId,
        ddl_snapshot_id: SnapshotId,
        queue_offsets: &[LogOffset],
    ) -> Result<()> {
        self.attempts.lock().push(snapshot_id);
        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(StoreError::Commit("coordinator unavailable".into()));
        }
        self.accepted.lock().push(Commit {
            snapshot_id,
            ddl_snapshot_id,
            queue_offsets: queue_offsets.to_vec(),
        });
        Ok(())
    }
}

/// Local storage whose downloads block until [`GatedStorage::open`].
#[derive(Default)]
pub struct GatedStorage {
    open: Mutex<bool>,
    opened: Condvar,
    entered: AtomicUsize,
}

impl GatedStorage {
    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

impl ExternalStorage for GatedStorage {
    fn download(&self, remote: &Path, local: &Path) -> Result<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
        drop(open);
        LocalFsStorage.download(remote, local)
    }
}

/// One shared log, coordinator and fault script for every node a test
/// builds.
pub struct Harness {
    pub dir: TempDir,
    pub log: MemoryLog,
    pub faults: Arc<FaultPlan>,
    pub commits: Arc<RecordingCommitClient>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
            log: MemoryLog::new(),
            faults: Arc::new(FaultPlan::default()),
            commits: Arc::new(RecordingCommitClient::default()),
        }
    }

    pub fn config(&self, partition_count: u32) -> NodeConfig {
        fast_config(&self.dir.path().join("primary"), partition_count)
    }

    pub fn node(&self, config: &NodeConfig) -> StoreNode {
        self.node_with_storage(config, Arc::new(LocalFsStorage))
    }

    pub fn node_with_storage(
        &self,
        config: &NodeConfig,
        storage: Arc<dyn ExternalStorage>,
    ) -> StoreNode {
        let factory = KvPartitionFactory::from_config(config).expect("partition factory");
        let deps = NodeDeps {
            log: Arc::new(self.log.clone()),
            meta: Arc::new(FileMetaStore::open(&config.meta_dir).expect("meta store")),
            commit_client: Arc::clone(&self.commits) as Arc<dyn SnapshotCommitClient>,
            partitions: Arc::new(ScriptedFactory {
                inner: factory,
                faults: Arc::clone(&self.faults),
            }),
            storage,
        };
        StoreNode::new(config.clone(), deps).expect("node")
    }

    pub fn append(&self, snapshot_id: SnapshotId, ops: Vec<OperationBlob>) -> LogOffset {
        self.log
            .append(NODE, QUEUE, snapshot_id, OperationBatch::new(ops))
    }

    pub fn append_at(
        &self,
        snapshot_id: SnapshotId,
        timestamp_ms: u64,
        ops: Vec<OperationBlob>,
    ) -> LogOffset {
        self.log
            .append_at(NODE, QUEUE, snapshot_id, timestamp_ms, OperationBatch::new(ops))
    }
}
