//! Single consumer of the node's replicated log.
//!
//! On start the processor replays everything after the persisted queue
//! offsets, then tails the log. Each record is split into per-partition
//! batches and handed to the [`WriterAgent`], which blocks the processor when
//! its buffer is full. A timer persists the writer's consumed offsets so a
//! restart only replays what was not yet applied.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{NodeConfig, NodeRole};
use crate::log::{LogReader, LogService};
use crate::meta::{MetaStore, QUEUE_OFFSETS_KEY};
use crate::model::{LogEntry, QueueOffsets, StoreDataBatch};
use crate::primitives::concurrency::{spawn_worker, StopToken, WorkerHandle};
use crate::routing::PartitionMap;
use crate::types::{LogOffset, NodeId, Result, SnapshotId, StoreError};
use crate::writer::WriterAgent;

/// Turns log records into partition-addressed batches for the writer.
pub struct LogProcessor {
    node_id: NodeId,
    role: NodeRole,
    queue_count: usize,
    partition_map: Arc<PartitionMap>,
    log: Arc<dyn LogService>,
    meta: Arc<dyn MetaStore>,
    writer: Arc<WriterAgent>,
    log_poll_timeout: Duration,
    offset_persist_interval: Duration,
    shutdown_timeout: Duration,
    /// Offsets loaded by `recover`; records at or below them are skipped.
    resume: Mutex<Option<QueueOffsets>>,
    /// Offsets last written to the metadata store.
    persisted: Mutex<QueueOffsets>,
    fatal: Mutex<Option<String>>,
    stop: StopToken,
    workers: Mutex<Vec<WorkerHandle>>,
}

/// Outcome of handling one record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Dispatch {
    Written(SnapshotId),
    Skipped,
}

impl LogProcessor {
    /// Creates a processor feeding `writer`.
    pub fn new(
        config: &NodeConfig,
        partition_map: Arc<PartitionMap>,
        log: Arc<dyn LogService>,
        meta: Arc<dyn MetaStore>,
        writer: Arc<WriterAgent>,
    ) -> Self {
        Self {
            node_id: config.node_id,
            role: config.role,
            queue_count: config.queue_count,
            partition_map,
            log,
            meta,
            writer,
            log_poll_timeout: config.log_poll_timeout(),
            offset_persist_interval: config.offset_persist_interval(),
            shutdown_timeout: config.shutdown_timeout(),
            resume: Mutex::new(None),
            persisted: Mutex::new(QueueOffsets::fresh(config.queue_count)),
            fatal: Mutex::new(None),
            stop: StopToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Loads the persisted queue offsets, creating them on first run.
    ///
    /// Fails when the persisted record tracks a different number of queues
    /// than configured.
    pub fn recover(&self) -> Result<QueueOffsets> {
        let offsets = match self.meta.read(QUEUE_OFFSETS_KEY)? {
            Some(bytes) => {
                let offsets = QueueOffsets::from_json(&bytes)?;
                if offsets.len() != self.queue_count {
                    error!(
                        persisted = offsets.len(),
                        configured = self.queue_count,
                        "processor.recover.queue_count_mismatch"
                    );
                    return Err(StoreError::QueueCountMismatch {
                        persisted: offsets.len(),
                        configured: self.queue_count,
                    });
                }
                offsets
            }
            None => {
                let offsets = QueueOffsets::fresh(self.queue_count);
                self.meta.write(QUEUE_OFFSETS_KEY, &offsets.to_json()?)?;
                offsets
            }
        };
        info!(node = %self.node_id, offsets = ?offsets.as_slice(), "processor.recovered");
        *self.persisted.lock() = offsets.clone();
        *self.resume.lock() = Some(offsets.clone());
        Ok(offsets)
    }

    /// Starts the log poller and the offset persistence timer.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.resume.lock().is_none() {
            return Err(StoreError::invalid("processor must recover before starting"));
        }
        if self.stop.is_stopped() {
            return Err(StoreError::Stopped);
        }
        let poller = Arc::clone(self);
        let poll_handle = spawn_worker("log-poller", move || poller.run_poller())?;
        let persister = Arc::clone(self);
        let persist_handle = spawn_worker("offset-persister", move || {
            while !persister.stop.wait_timeout(persister.offset_persist_interval) {
                persister.persist_offsets();
            }
        })?;
        self.workers.lock().extend([poll_handle, persist_handle]);
        info!(node = %self.node_id, role = ?self.role, "processor.started");
        Ok(())
    }

    fn run_poller(&self) {
        match self.poll_batches() {
            Ok(()) => debug!("processor.poller.exited"),
            Err(_) if self.stop.is_stopped() => debug!("processor.poller.exited"),
            Err(err) => {
                error!(node = %self.node_id, error = %err, "processor.poll.failed");
                *self.fatal.lock() = Some(err.to_string());
            }
        }
    }

    /// Replays, then tails the log until stopped. Log errors end the loop.
    fn poll_batches(&self) -> Result<()> {
        let from = self
            .resume
            .lock()
            .as_ref()
            .map_or(0, |offsets| offsets.min() + 1);
        let mut reader = self.log.create_reader(self.node_id, from)?;
        let replayed = self.replay_wal(reader.as_mut())?;
        info!(from, replayed, "processor.replay.completed");
        while !self.stop.is_stopped() {
            for entry in reader.latest_updates(self.log_poll_timeout)? {
                if self.stop.is_stopped() {
                    break;
                }
                self.process_record(entry, true)?;
            }
        }
        Ok(())
    }

    /// Feeds every record up to the reader's replay head through
    /// [`LogProcessor::process_record`].
    fn replay_wal(&self, reader: &mut dyn LogReader) -> Result<usize> {
        let mut replayed = 0;
        while let Some(entry) = reader.read_next_record()? {
            if self.stop.is_stopped() {
                break;
            }
            if let Dispatch::Written(_) = self.process_record(entry, true)? {
                replayed += 1;
            }
        }
        Ok(replayed)
    }

    /// Routes one record and hands it to the writer.
    ///
    /// Records already covered by the recovered offsets are skipped when
    /// `skip_applied` is set. Routing inconsistencies drop the record.
    fn process_record(&self, entry: LogEntry, skip_applied: bool) -> Result<Dispatch> {
        if entry.queue_id.index() >= self.queue_count {
            error!(
                offset = entry.offset,
                queue = %entry.queue_id,
                queues = self.queue_count,
                "processor.record.unknown_queue"
            );
            return Ok(Dispatch::Skipped);
        }
        if skip_applied {
            let applied = self
                .resume
                .lock()
                .as_ref()
                .map_or(false, |offsets| entry.offset <= offsets.get(entry.queue_id));
            if applied {
                return Ok(Dispatch::Skipped);
            }
        }
        let batch = match self.build_batch(&entry) {
            Ok(Some(batch)) => batch,
            Ok(None) => return Ok(Dispatch::Skipped),
            Err(err @ StoreError::Routing { .. }) => {
                error!(
                    offset = entry.offset,
                    snapshot = entry.snapshot_id,
                    error = %err,
                    "processor.record.misrouted"
                );
                return Ok(Dispatch::Skipped);
            }
            Err(err) => return Err(err),
        };
        let snapshot_id = batch.snapshot_id();
        self.writer.write_store_until(batch, &self.stop)?;
        Ok(Dispatch::Written(snapshot_id))
    }

    /// Splits a record into per-partition and broadcast operations.
    ///
    /// Secondaries keep only schema and control operations. Returns `None`
    /// when nothing is left to write.
    fn build_batch(&self, entry: &LogEntry) -> Result<Option<StoreDataBatch>> {
        let filtered;
        let ops = match self.role {
            NodeRole::Primary => &entry.batch,
            NodeRole::Secondary => {
                filtered = entry.batch.schema_and_control_only();
                &filtered
            }
        };
        if ops.is_empty() {
            return Ok(None);
        }
        let mut batch = StoreDataBatch::new(entry.snapshot_id, entry.queue_id, entry.offset);
        for op in ops {
            if op.is_broadcast() {
                batch.add_broadcast(op.clone());
                continue;
            }
            let partition = self.partition_map.partition_for_key(op.partition_key);
            match self.partition_map.owner_of(partition) {
                Some(owner) if owner == self.node_id => batch.add_to_partition(partition, op.clone()),
                Some(owner) => {
                    return Err(StoreError::Routing {
                        partition,
                        owner,
                        node: self.node_id,
                    })
                }
                None => {
                    return Err(StoreError::partition(partition, "missing from the partition map"))
                }
            }
        }
        Ok(Some(batch))
    }

    /// Re-applies records starting at `offset` whose timestamp is at or after
    /// `timestamp_ms`, ignoring the recovered offsets.
    ///
    /// Returns the snapshot ids handed to the writer, in log order.
    pub fn replay_records_from(
        &self,
        offset: LogOffset,
        timestamp_ms: u64,
    ) -> Result<Vec<SnapshotId>> {
        let mut reader = self.log.create_reader(self.node_id, offset)?;
        let mut snapshots = Vec::new();
        while let Some(entry) = reader.read_next_record()? {
            if entry.timestamp_ms < timestamp_ms {
                continue;
            }
            if let Dispatch::Written(snapshot_id) = self.process_record(entry, false)? {
                snapshots.push(snapshot_id);
            }
        }
        info!(offset, timestamp_ms, replayed = snapshots.len(), "processor.replay_from");
        Ok(snapshots)
    }

    /// Writes the writer's consumed offsets if any queue moved forward.
    ///
    /// Best effort: failures are logged. Returns `true` when a new record was
    /// written.
    pub fn persist_offsets(&self) -> bool {
        let consumed = self.writer.consumed_queue_offsets();
        let mut persisted = self.persisted.lock();
        if !consumed.is_ahead_of(&persisted) {
            return false;
        }
        match consumed
            .to_json()
            .and_then(|bytes| self.meta.write(QUEUE_OFFSETS_KEY, &bytes))
        {
            Ok(()) => {
                debug!(offsets = ?consumed.as_slice(), "processor.offsets.persisted");
                *persisted = consumed;
                true
            }
            Err(err) => {
                warn!(error = %err, "processor.offsets.persist_failed");
                false
            }
        }
    }

    /// Offsets most recently written to the metadata store.
    pub fn persisted_offsets(&self) -> QueueOffsets {
        self.persisted.lock().clone()
    }

    /// Error that ended the poll loop, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    /// Stops both threads and persists the final offsets.
    pub fn stop(&self) {
        self.stop.stop();
        for worker in self.workers.lock().drain(..) {
            let name = worker.name().to_string();
            if !worker.join_timeout(self.shutdown_timeout) {
                warn!(worker = %name, "processor.stop.timeout");
            }
        }
        self.persist_offsets();
        info!(node = %self.node_id, "processor.stopped");
    }
}
