//! Graph partitions: the per-partition storage engine behind the store.
//!
//! A [`GraphPartition`] is owned exclusively by the store, which serializes
//! every call to it. [`KvPartition`] is the journal-backed implementation
//! used by the node; tests plug in their own through [`PartitionFactory`].

mod bulk;
mod journal;
mod kv;
mod storage;

use std::path::{Path, PathBuf};

use crate::model::OperationBatch;
use crate::types::{PartitionId, Result, SnapshotId};

pub use bulk::BulkFileWriter;
pub use kv::{KvPartition, KvPartitionFactory};
pub use storage::{ExternalStorage, LocalFsStorage};

/// Name of the journal file inside a partition directory.
pub const JOURNAL_FILE_NAME: &str = "journal.log";

/// One shard of the graph store.
pub trait GraphPartition: Send {
    /// Partition id.
    fn id(&self) -> PartitionId;

    /// Applies `ops` at `snapshot_id`.
    ///
    /// Returns `true` when the batch changed the schema. Re-applying a batch
    /// that is already durable must leave the partition unchanged.
    fn write_batch(&mut self, snapshot_id: SnapshotId, ops: &OperationBatch) -> Result<bool>;

    /// Loads durable state and returns the highest snapshot it covers, or
    /// [`crate::types::NO_SNAPSHOT`] when empty.
    fn recover(&mut self) -> Result<SnapshotId>;

    /// Merges a bulk-loaded file that already sits on local disk.
    fn ingest_external_file(&mut self, local_file: &Path) -> Result<()>;

    /// Discards versions no reader at or after `snapshot_id` can observe.
    fn garbage_collect(&mut self, snapshot_id: SnapshotId) -> Result<()>;

    /// Rewrites on-disk state to drop superseded records.
    fn compact(&mut self) -> Result<()>;

    /// Pulls the primary's newer durable state. Secondary replicas only.
    fn try_catch_up_with_primary(&mut self) -> Result<()>;

    /// Directory holding this partition's files, if any.
    fn data_dir(&self) -> Option<&Path> {
        None
    }

    /// Flushes and releases the partition.
    fn close(&mut self) -> Result<()>;
}

/// Opens partitions for the store.
pub trait PartitionFactory: Send + Sync {
    /// Opens partition `id` without recovering it.
    fn open(&self, id: PartitionId) -> Result<Box<dyn GraphPartition>>;
}

/// Directory of partition `id` under `root`.
pub fn partition_dir(root: &Path, id: PartitionId) -> PathBuf {
    root.join(format!("partition-{:05}", id.0))
}

/// Name of the bulk file a partition ingests from an ingestion directory.
pub fn bulk_file_name(id: PartitionId) -> String {
    format!("part-r-{:05}.sst", id.0)
}
