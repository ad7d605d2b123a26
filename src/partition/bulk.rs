use std::path::Path;

use crate::model::OperationBatch;
use crate::types::{PartitionId, Result, SnapshotId};

use super::journal::{Journal, JournalFrame, JournalHeader};

/// Produces bulk-load files that [`super::KvPartition`] can ingest.
///
/// A bulk file uses the partition journal format, so ingestion appends its
/// frames verbatim.
pub struct BulkFileWriter {
    journal: Journal,
}

impl BulkFileWriter {
    /// Creates (or truncates) a bulk file for `partition` at `path`.
    pub fn create(path: impl AsRef<Path>, partition: PartitionId) -> Result<Self> {
        let header = JournalHeader {
            partition,
            generation: 0,
        };
        let journal = Journal::rewrite(path.as_ref(), header, &[], false)?;
        Ok(Self { journal })
    }

    /// Adds `ops` as of `snapshot_id`.
    pub fn write(&mut self, snapshot_id: SnapshotId, ops: OperationBatch) -> Result<()> {
        self.journal.append(&JournalFrame::batch(snapshot_id, ops))
    }

    /// Flushes the file to disk.
    pub fn finish(self) -> Result<()> {
        self.journal.sync()
    }
}
