//! Request surface a storage node exposes to the cluster's RPC layer.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::processor::LogProcessor;
use crate::store::{PartitionDiskState, StoreService};
use crate::types::{LogOffset, Result, SnapshotId, StoreError};

/// Ingest option: keep downloaded bulk files after ingestion (`true`/`false`).
pub const KEEP_DOWNLOADS_OPTION: &str = "ingest.keep_downloads";

/// Thin adapter from node-level requests to the store and log processor.
#[derive(Clone)]
pub struct StoreNodeService {
    store: Arc<StoreService>,
    processor: Arc<LogProcessor>,
}

impl StoreNodeService {
    /// Wraps a node's store and processor.
    pub fn new(store: Arc<StoreService>, processor: Arc<LogProcessor>) -> Self {
        Self { store, processor }
    }

    /// Ingests the bulk files under `path`.
    ///
    /// Downloaded files are removed afterwards unless
    /// [`KEEP_DOWNLOADS_OPTION`] is `true`.
    pub fn ingest(&self, path: &Path, options: &BTreeMap<String, String>) -> Result<()> {
        let keep_downloads = match options.get(KEEP_DOWNLOADS_OPTION) {
            None => false,
            Some(value) => value.parse::<bool>().map_err(|_| {
                StoreError::invalid(format!("{KEEP_DOWNLOADS_OPTION} must be true or false, got `{value}`"))
            })?,
        };
        let result = self.store.ingest_data(path);
        if !keep_downloads && !matches!(result, Err(StoreError::IngestBusy)) {
            if let Err(err) = self.store.clear_ingest(path) {
                warn!(path = %path.display(), error = %err, "service.ingest.cleanup_failed");
            }
        }
        result
    }

    /// Removes files downloaded for `path`.
    pub fn clear_ingest(&self, path: &Path) -> Result<()> {
        self.store.clear_ingest(path)
    }

    /// Compacts every local partition.
    pub fn compact_db(&self) -> Result<()> {
        self.store.compact()
    }

    /// Garbage-collects every local partition up to `snapshot_id`.
    pub fn garbage_collect(&self, snapshot_id: SnapshotId) -> Result<()> {
        self.store.garbage_collect(snapshot_id)
    }

    /// Runs one catch-up round against the primary immediately.
    pub fn reopen_secondary(&self) -> Result<()> {
        self.store.try_catch_up_with_primary()
    }

    /// Disk usage per local partition.
    pub fn get_state(&self) -> Result<Vec<PartitionDiskState>> {
        self.store.partition_states()
    }

    /// Re-applies log records from `offset` stamped at or after
    /// `timestamp_ms`.
    pub fn replay_records_from(
        &self,
        offset: LogOffset,
        timestamp_ms: u64,
    ) -> Result<Vec<SnapshotId>> {
        self.processor.replay_records_from(offset, timestamp_ms)
    }
}
