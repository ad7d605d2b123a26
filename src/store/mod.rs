//! Owner of the node's local partitions.
//!
//! Every partition sits behind its own mutex, so writes, garbage collection,
//! ingestion and catch-up against the same partition never overlap. Work that
//! spans partitions runs on rayon pools sized from the node configuration.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{NodeConfig, NodeRole};
use crate::model::{OperationBatch, StoreDataBatch};
use crate::partition::{bulk_file_name, ExternalStorage, GraphPartition, PartitionFactory};
use crate::primitives::concurrency::StopToken;
use crate::routing::PartitionMap;
use crate::types::{NodeId, PartitionId, Result, SnapshotId, StoreError, NO_SNAPSHOT};

/// Disk usage of the volume holding one partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct PartitionDiskState {
    /// Partition id.
    pub partition: PartitionId,
    /// Size of the volume in bytes.
    pub total_space: u64,
    /// Bytes available to this process.
    pub usable_space: u64,
}

struct PartitionSlot {
    id: PartitionId,
    partition: Mutex<Box<dyn GraphPartition>>,
}

struct Started {
    partitions: BTreeMap<PartitionId, Arc<PartitionSlot>>,
    write_pool: ThreadPool,
    download_pool: ThreadPool,
}

impl Started {
    fn slots(&self) -> impl Iterator<Item = &Arc<PartitionSlot>> {
        self.partitions.values()
    }
}

/// Executes writes and maintenance against the partitions this node owns.
pub struct StoreService {
    node_id: NodeId,
    role: NodeRole,
    partition_map: Arc<PartitionMap>,
    factory: Arc<dyn PartitionFactory>,
    storage: Arc<dyn ExternalStorage>,
    write_threads: usize,
    download_threads: usize,
    partition_retry_interval: Duration,
    gc_enabled: bool,
    shutdown_timeout: Duration,
    download_dir: PathBuf,
    started: RwLock<Option<Arc<Started>>>,
    ingest_gate: Mutex<()>,
    maintenance_gate: Mutex<()>,
    stop: StopToken,
}

fn build_pool(prefix: &'static str, threads: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |idx| format!("{prefix}-{idx}"))
        .build()
        .map_err(|err| StoreError::invalid(format!("{prefix} pool: {err}")))
}

impl StoreService {
    /// Creates a stopped store for `config.node_id`.
    pub fn new(
        config: &NodeConfig,
        partition_map: Arc<PartitionMap>,
        factory: Arc<dyn PartitionFactory>,
        storage: Arc<dyn ExternalStorage>,
    ) -> Self {
        Self {
            node_id: config.node_id,
            role: config.role,
            partition_map,
            factory,
            storage,
            write_threads: config.write_threads,
            download_threads: config.download_threads,
            partition_retry_interval: config.partition_retry_interval(),
            gc_enabled: config.gc_enabled,
            shutdown_timeout: config.shutdown_timeout(),
            download_dir: config.download_dir.clone(),
            started: RwLock::new(None),
            ingest_gate: Mutex::new(()),
            maintenance_gate: Mutex::new(()),
            stop: StopToken::new(),
        }
    }

    /// Opens every partition this node owns and starts the worker pools.
    pub fn start(&self) -> Result<()> {
        if self.stop.is_stopped() {
            return Err(StoreError::Stopped);
        }
        let mut started = self.started.write();
        if started.is_some() {
            return Err(StoreError::invalid("store is already started"));
        }
        let mut partitions = BTreeMap::new();
        for id in self.partition_map.partitions_of(self.node_id) {
            let partition = self.factory.open(id)?;
            partitions.insert(
                id,
                Arc::new(PartitionSlot {
                    id,
                    partition: Mutex::new(partition),
                }),
            );
        }
        info!(
            node = %self.node_id,
            role = ?self.role,
            partitions = partitions.len(),
            "store.started"
        );
        *started = Some(Arc::new(Started {
            partitions,
            write_pool: build_pool("store-write", self.write_threads)?,
            download_pool: build_pool("store-download", self.download_threads)?,
        }));
        Ok(())
    }

    fn started(&self) -> Result<Arc<Started>> {
        self.started.read().clone().ok_or(StoreError::Stopped)
    }

    /// Partitions owned by this node.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.started
            .read()
            .as_ref()
            .map(|started| started.partitions.keys().copied().collect())
            .unwrap_or_else(|| self.partition_map.partitions_of(self.node_id))
    }

    /// Replica role the store was configured with.
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Recovers every partition in parallel.
    ///
    /// Returns the lowest recovered snapshot, or [`NO_SNAPSHOT`] when the node
    /// owns no partitions. Any single failure fails the whole recovery.
    pub fn recover(&self) -> Result<SnapshotId> {
        let started = self.started()?;
        let recovered: Vec<(PartitionId, Result<SnapshotId>)> = started.write_pool.install(|| {
            started
                .partitions
                .par_iter()
                .map(|(id, slot)| (*id, slot.partition.lock().recover()))
                .collect()
        });
        let mut lowest: Option<SnapshotId> = None;
        for (id, result) in recovered {
            match result {
                Ok(snapshot) => {
                    debug!(partition = %id, snapshot, "store.partition_recovered");
                    lowest = Some(lowest.map_or(snapshot, |low| low.min(snapshot)));
                }
                Err(err) => {
                    error!(partition = %id, error = %err, "store.recover.failed");
                    return Err(err);
                }
            }
        }
        let snapshot = lowest.unwrap_or(NO_SNAPSHOT);
        info!(node = %self.node_id, snapshot, "store.recovered");
        Ok(snapshot)
    }

    /// Writes every partition's share of `batch`, in parallel.
    ///
    /// Partitions that fail are retried on their own after a pause while the
    /// ones that succeeded are left alone. Returns whether any partition
    /// reported a schema change, or [`StoreError::Stopped`] if the store or
    /// `cancel` stops before every partition succeeded.
    pub fn batch_write(&self, batch: &StoreDataBatch, cancel: &StopToken) -> Result<bool> {
        let started = self.started()?;
        let snapshot_id = batch.snapshot_id();
        let (mut pending, unowned) = batch.writes_for(started.partitions.keys().copied());
        if !unowned.is_empty() {
            error!(
                snapshot = snapshot_id,
                partitions = ?unowned,
                "store.batch_write.unowned"
            );
        }

        let mut has_ddl = false;
        let mut attempt = 0u32;
        while !pending.is_empty() {
            if self.stop.is_stopped() || cancel.is_stopped() {
                return Err(StoreError::Stopped);
            }
            attempt += 1;
            let outcomes: Vec<(PartitionId, OperationBatch, Result<bool>)> =
                started.write_pool.install(|| {
                    pending
                        .into_par_iter()
                        .map(|(id, ops)| {
                            let result = match started.partitions.get(&id) {
                                Some(slot) => slot.partition.lock().write_batch(snapshot_id, &ops),
                                None => Err(StoreError::partition(id, "not owned by this node")),
                            };
                            (id, ops, result)
                        })
                        .collect()
                });
            pending = Vec::new();
            for (id, ops, result) in outcomes {
                match result {
                    Ok(ddl) => has_ddl |= ddl,
                    Err(err) => {
                        warn!(
                            partition = %id,
                            snapshot = snapshot_id,
                            attempt,
                            error = %err,
                            "store.partition_write.failed"
                        );
                        pending.push((id, ops));
                    }
                }
            }
            if !pending.is_empty() {
                cancel.wait_timeout(self.partition_retry_interval);
            }
        }
        Ok(has_ddl)
    }

    fn staging_dir(&self, remote_dir: &Path) -> PathBuf {
        self.download_dir
            .join(remote_dir.file_name().unwrap_or_else(|| OsStr::new("ingest")))
    }

    /// Downloads and ingests one bulk file per owned partition.
    ///
    /// Only one ingestion runs at a time; a concurrent request fails with
    /// [`StoreError::IngestBusy`] instead of queueing.
    pub fn ingest_data(&self, remote_dir: &Path) -> Result<()> {
        let _ingesting = self.ingest_gate.try_lock().ok_or(StoreError::IngestBusy)?;
        let started = self.started()?;
        let staging = self.staging_dir(remote_dir);
        fs::create_dir_all(&staging)?;
        let ids: Vec<PartitionId> = started.partitions.keys().copied().collect();

        let downloaded: Vec<(PartitionId, PathBuf)> = started.download_pool.install(|| {
            ids.par_iter()
                .map(|id| -> Result<(PartitionId, PathBuf)> {
                    let name = bulk_file_name(*id);
                    let local = staging.join(&name);
                    self.storage.download(&remote_dir.join(&name), &local)?;
                    Ok((*id, local))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        started.download_pool.install(|| {
            downloaded
                .par_iter()
                .map(|(id, local)| match started.partitions.get(id) {
                    Some(slot) => slot.partition.lock().ingest_external_file(local),
                    None => Err(StoreError::partition(*id, "not owned by this node")),
                })
                .collect::<Result<Vec<()>>>()
        })
        .map_err(|err| {
            warn!(path = %remote_dir.display(), error = %err, "store.ingest.failed");
            err
        })?;
        info!(
            path = %remote_dir.display(),
            partitions = downloaded.len(),
            "store.ingest.completed"
        );
        Ok(())
    }

    /// Removes files downloaded for `remote_dir`.
    pub fn clear_ingest(&self, remote_dir: &Path) -> Result<()> {
        let staging = self.staging_dir(remote_dir);
        match fs::remove_dir_all(&staging) {
            Ok(()) => {
                debug!(path = %staging.display(), "store.ingest.cleared");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Discards data obsoleted at or before `snapshot_id`, one partition at a
    /// time.
    pub fn garbage_collect(&self, snapshot_id: SnapshotId) -> Result<()> {
        if !self.gc_enabled {
            return Err(StoreError::GcDisabled);
        }
        let started = self.started()?;
        let _maintenance = self.maintenance_gate.lock();
        for slot in started.slots() {
            slot.partition
                .lock()
                .garbage_collect(snapshot_id)
                .map_err(|err| {
                    warn!(partition = %slot.id, snapshot = snapshot_id, error = %err, "store.gc.failed");
                    err
                })?;
        }
        debug!(snapshot = snapshot_id, "store.gc.completed");
        Ok(())
    }

    /// Compacts every partition, one at a time.
    pub fn compact(&self) -> Result<()> {
        let started = self.started()?;
        let _maintenance = self.maintenance_gate.lock();
        for slot in started.slots() {
            slot.partition.lock().compact().map_err(|err| {
                warn!(partition = %slot.id, error = %err, "store.compact.failed");
                err
            })?;
        }
        info!(partitions = started.partitions.len(), "store.compact.completed");
        Ok(())
    }

    /// Pulls the primary's durable state into every partition.
    ///
    /// Every partition is attempted; the first failure is returned.
    pub fn try_catch_up_with_primary(&self) -> Result<()> {
        if self.role != NodeRole::Secondary {
            return Err(StoreError::NotSecondary);
        }
        let started = self.started()?;
        let results: Vec<(PartitionId, Result<()>)> = started.write_pool.install(|| {
            started
                .partitions
                .par_iter()
                .map(|(id, slot)| (*id, slot.partition.lock().try_catch_up_with_primary()))
                .collect()
        });
        let mut first_failure = None;
        for (id, result) in results {
            if let Err(err) = result {
                warn!(partition = %id, error = %err, "store.catchup.failed");
                first_failure.get_or_insert(err);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Disk usage for every partition with a data directory.
    pub fn partition_states(&self) -> Result<Vec<PartitionDiskState>> {
        let started = self.started()?;
        let mut states = Vec::with_capacity(started.partitions.len());
        for slot in started.slots() {
            let Some(dir) = slot.partition.lock().data_dir().map(Path::to_path_buf) else {
                continue;
            };
            states.push(PartitionDiskState {
                partition: slot.id,
                total_space: fs2::total_space(&dir)?,
                usable_space: fs2::available_space(&dir)?,
            });
        }
        Ok(states)
    }

    /// Returns `true` between a successful [`StoreService::start`] and
    /// [`StoreService::stop`].
    pub fn is_started(&self) -> bool {
        self.started.read().is_some()
    }

    /// Closes every partition in parallel, waiting at most the configured
    /// shutdown timeout.
    pub fn stop(&self) {
        self.stop.stop();
        let Some(started) = self.started.write().take() else {
            return;
        };
        let (tx, rx) = crossbeam_channel::unbounded();
        for slot in started.slots() {
            let slot = Arc::clone(slot);
            let tx = tx.clone();
            started.write_pool.spawn(move || {
                let result = slot.partition.lock().close();
                let _ = tx.send((slot.id, result));
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.shutdown_timeout;
        let mut remaining = started.partitions.len();
        while remaining > 0 {
            match rx.recv_deadline(deadline) {
                Ok((id, result)) => {
                    remaining -= 1;
                    if let Err(err) = result {
                        warn!(partition = %id, error = %err, "store.partition_close.failed");
                    }
                }
                Err(_) => {
                    warn!(remaining, "store.stop.timeout");
                    break;
                }
            }
        }
        info!(node = %self.node_id, "store.stopped");
    }
}
