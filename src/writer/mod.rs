//! Applies fan-out batches to the store in arrival order and publishes the
//! node's durable watermark.
//!
//! A single consumer thread drains the [`WriteBuffer`]. A batch is retried
//! until the store accepts every partition's share of it, so the consumer
//! never moves past a batch that is not fully written. Progress is reported
//! to the coordinator from a separate commit thread.

mod buffer;
mod commit;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::model::{QueueOffsets, SnapshotCell, SnapshotInfo, StoreDataBatch};
use crate::primitives::concurrency::{spawn_worker, StopToken, WorkerHandle};
use crate::store::StoreService;
use crate::types::{NodeId, Result, SnapshotId, StoreError, NO_SNAPSHOT};

pub use buffer::WriteBuffer;
pub use commit::{LoggingCommitClient, SnapshotCommitClient};

use commit::{CommitExecutor, CommitRequester};

const BUFFER_POLL: Duration = Duration::from_millis(100);

/// Lifecycle of a [`WriterAgent`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AgentState {
    /// Not running.
    Stopped,
    /// Spawning its threads.
    Starting,
    /// Consuming batches.
    Running,
    /// Draining its threads.
    Stopping,
}

#[derive(Debug)]
struct Progress {
    /// Highest batch snapshot that advanced the watermark.
    consume_snapshot: SnapshotId,
    /// Highest batch snapshot that carried a schema change.
    last_ddl_snapshot: SnapshotId,
}

struct Shared {
    node_id: NodeId,
    store: Arc<StoreService>,
    commit_client: Arc<dyn SnapshotCommitClient>,
    buffer: WriteBuffer,
    published: SnapshotCell,
    progress: Mutex<Progress>,
    consumed_offsets: Mutex<QueueOffsets>,
    last_committed: AtomicI64,
    write_retry_interval: Duration,
    stop: StopToken,
}

impl Shared {
    fn run_consumer(&self, commits: &CommitRequester) {
        while !self.stop.is_stopped() {
            let Some(batch) = self.buffer.poll(BUFFER_POLL) else {
                continue;
            };
            let Some(has_ddl) = self.write_engine_with_retry(&batch) else {
                debug!(
                    snapshot = batch.snapshot_id(),
                    offset = batch.source_offset(),
                    "writer.batch.abandoned_on_stop"
                );
                break;
            };
            self.record_applied(&batch, has_ddl, commits);
        }
    }

    /// Writes `batch` until the store accepts it. Returns `None` only when the
    /// agent is stopping.
    fn write_engine_with_retry(&self, batch: &StoreDataBatch) -> Option<bool> {
        let mut attempt = 0u32;
        loop {
            match self.store.batch_write(batch, &self.stop) {
                Ok(has_ddl) => return Some(has_ddl),
                Err(_) if self.stop.is_stopped() => return None,
                Err(err) => {
                    attempt += 1;
                    warn!(
                        snapshot = batch.snapshot_id(),
                        queue = %batch.queue_id(),
                        offset = batch.source_offset(),
                        attempt,
                        error = %err,
                        "writer.batch_write.failed"
                    );
                    if self.stop.wait_timeout(self.write_retry_interval) {
                        return None;
                    }
                }
            }
        }
    }

    fn record_applied(&self, batch: &StoreDataBatch, has_ddl: bool, commits: &CommitRequester) {
        let snapshot_id = batch.snapshot_id();
        {
            let mut progress = self.progress.lock();
            if snapshot_id > progress.consume_snapshot {
                let next = self
                    .published
                    .load()
                    .advance(snapshot_id, progress.last_ddl_snapshot);
                self.published.store(next);
                progress.consume_snapshot = snapshot_id;
                debug!(
                    snapshot = next.snapshot_id,
                    ddl_snapshot = next.ddl_snapshot_id,
                    "writer.snapshot.published"
                );
                commits.request();
            }
            if has_ddl && snapshot_id > progress.last_ddl_snapshot {
                progress.last_ddl_snapshot = snapshot_id;
            }
        }
        self.consumed_offsets
            .lock()
            .advance(batch.queue_id(), batch.source_offset());
    }

    /// One commit round: sends the published watermark if it is newer than
    /// the last one the coordinator accepted.
    fn commit_latest(&self) {
        let info = self.published.load();
        if info.snapshot_id <= self.last_committed.load(Ordering::SeqCst) {
            return;
        }
        let offsets = self.consumed_offsets.lock().clone();
        match self.commit_client.commit_snapshot_id(
            self.node_id,
            info.snapshot_id,
            info.ddl_snapshot_id,
            offsets.as_slice(),
        ) {
            Ok(()) => {
                self.last_committed.store(info.snapshot_id, Ordering::SeqCst);
                debug!(snapshot = info.snapshot_id, "writer.commit.sent");
            }
            Err(err) => {
                warn!(snapshot = info.snapshot_id, error = %err, "writer.commit.failed");
            }
        }
    }
}

struct Workers {
    consumer: WorkerHandle,
    commits: CommitExecutor,
}

/// Consumer of fan-out batches for one node.
pub struct WriterAgent {
    shared: Arc<Shared>,
    state: Mutex<AgentState>,
    workers: Mutex<Option<Workers>>,
    shutdown_timeout: Duration,
}

impl WriterAgent {
    /// Creates a stopped agent writing into `store`.
    pub fn new(
        config: &NodeConfig,
        store: Arc<StoreService>,
        commit_client: Arc<dyn SnapshotCommitClient>,
    ) -> Self {
        let shared = Shared {
            node_id: config.node_id,
            store,
            commit_client,
            buffer: WriteBuffer::new(config.write_buffer_capacity),
            published: SnapshotCell::default(),
            progress: Mutex::new(Progress {
                consume_snapshot: NO_SNAPSHOT,
                last_ddl_snapshot: NO_SNAPSHOT,
            }),
            consumed_offsets: Mutex::new(QueueOffsets::fresh(config.queue_count)),
            last_committed: AtomicI64::new(NO_SNAPSHOT),
            write_retry_interval: config.write_retry_interval(),
            stop: StopToken::new(),
        };
        Self {
            shared: Arc::new(shared),
            state: Mutex::new(AgentState::Stopped),
            workers: Mutex::new(None),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    /// Seeds the agent with the recovered snapshot and queue offsets.
    ///
    /// Must run before [`WriterAgent::start`].
    pub fn init(&self, snapshot_id: SnapshotId, queue_offsets: QueueOffsets) -> Result<()> {
        if *self.state.lock() != AgentState::Stopped {
            return Err(StoreError::invalid("writer can only be initialised while stopped"));
        }
        self.shared
            .published
            .store(SnapshotInfo::new(snapshot_id, snapshot_id));
        *self.shared.progress.lock() = Progress {
            consume_snapshot: snapshot_id,
            last_ddl_snapshot: snapshot_id,
        };
        *self.shared.consumed_offsets.lock() = queue_offsets;
        info!(node = %self.shared.node_id, snapshot = snapshot_id, "writer.initialised");
        Ok(())
    }

    /// Spawns the consumer and commit threads.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != AgentState::Stopped {
                return Err(StoreError::invalid(format!("writer cannot start from {:?}", *state)));
            }
            if self.shared.stop.is_stopped() {
                return Err(StoreError::Stopped);
            }
            *state = AgentState::Starting;
        }
        match self.spawn_workers() {
            Ok(workers) => {
                *self.workers.lock() = Some(workers);
                *self.state.lock() = AgentState::Running;
                info!(node = %self.shared.node_id, "writer.started");
                Ok(())
            }
            Err(err) => {
                self.shared.stop.stop();
                *self.state.lock() = AgentState::Stopped;
                Err(err)
            }
        }
    }

    fn spawn_workers(&self) -> Result<Workers> {
        let commit_shared = Arc::clone(&self.shared);
        let commits = CommitExecutor::spawn("writer-commit", move || commit_shared.commit_latest())?;
        let requester = commits.requester();
        let consumer_shared = Arc::clone(&self.shared);
        let consumer = match spawn_worker("writer-consumer", move || {
            consumer_shared.run_consumer(&requester)
        }) {
            Ok(consumer) => consumer,
            Err(err) => {
                commits.shutdown(self.shutdown_timeout);
                return Err(err);
            }
        };
        Ok(Workers { consumer, commits })
    }

    /// Hands a batch to the consumer, blocking while the buffer is full.
    pub fn write_store(&self, batch: StoreDataBatch) -> Result<()> {
        self.write_store_until(batch, &StopToken::new())
    }

    /// Like [`WriterAgent::write_store`], but also gives up once `cancel`
    /// fires.
    pub fn write_store_until(&self, batch: StoreDataBatch, cancel: &StopToken) -> Result<()> {
        match *self.state.lock() {
            AgentState::Running | AgentState::Starting => {}
            AgentState::Stopping | AgentState::Stopped => return Err(StoreError::Stopped),
        }
        self.shared
            .buffer
            .offer(batch, || cancel.is_stopped() || self.shared.stop.is_stopped())
    }

    /// Stops the consumer, then the commit thread, each within the shutdown
    /// timeout. A batch whose write is in progress completes first.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != AgentState::Running {
                self.shared.stop.stop();
                return;
            }
            *state = AgentState::Stopping;
        }
        self.shared.stop.stop();
        if let Some(workers) = self.workers.lock().take() {
            if !workers.consumer.join_timeout(self.shutdown_timeout) {
                warn!("writer.consumer.stop_timeout");
            }
            if !workers.commits.shutdown(self.shutdown_timeout) {
                warn!("writer.commit.stop_timeout");
            }
        }
        *self.state.lock() = AgentState::Stopped;
        let buffer = &self.shared.buffer;
        if !buffer.is_empty() {
            warn!(
                pending = buffer.len(),
                capacity = buffer.capacity(),
                "writer.stopped.unapplied"
            );
        }
        info!(
            node = %self.shared.node_id,
            snapshot = self.shared.published.load().snapshot_id,
            pending = buffer.len(),
            "writer.stopped"
        );
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    /// Latest published watermark.
    pub fn snapshot_info(&self) -> Arc<SnapshotInfo> {
        self.shared.published.load()
    }

    /// Offsets of the last batch applied from each queue.
    pub fn consumed_queue_offsets(&self) -> QueueOffsets {
        self.shared.consumed_offsets.lock().clone()
    }

    /// Highest snapshot seen carrying a schema change.
    pub fn last_ddl_snapshot_id(&self) -> SnapshotId {
        self.shared.progress.lock().last_ddl_snapshot
    }

    /// Highest snapshot the coordinator accepted.
    pub fn last_committed_snapshot_id(&self) -> SnapshotId {
        self.shared.last_committed.load(Ordering::SeqCst)
    }

    /// Batches waiting for the consumer.
    pub fn buffered(&self) -> usize {
        self.shared.buffer.len()
    }
}

impl Drop for WriterAgent {
    fn drop(&mut self) {
        self.stop();
    }
}
