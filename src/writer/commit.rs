use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::info;

use crate::primitives::concurrency::{spawn_worker, StopToken, WorkerHandle};
use crate::types::{LogOffset, NodeId, Result, SnapshotId};

const IDLE_CHECK: Duration = Duration::from_millis(100);

/// Reports durable progress to the cluster coordinator.
///
/// The coordinator treats commits as monotonic and idempotent, so a caller
/// may skip a failed commit and send a later, higher one instead.
pub trait SnapshotCommitClient: Send + Sync {
    /// Declares everything up to `snapshot_id` durable on `node`.
    fn commit_snapshot_id(
        &self,
        node: NodeId,
        snapshot_id: SnapshotId,
        ddl_snapshot_id: SnapshotId,
        queue_offsets: &[LogOffset],
    ) -> Result<()>;
}

/// Commit client for standalone nodes: records commits in the log only.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingCommitClient;

impl SnapshotCommitClient for LoggingCommitClient {
    fn commit_snapshot_id(
        &self,
        node: NodeId,
        snapshot_id: SnapshotId,
        ddl_snapshot_id: SnapshotId,
        queue_offsets: &[LogOffset],
    ) -> Result<()> {
        info!(
            node = %node,
            snapshot = snapshot_id,
            ddl_snapshot = ddl_snapshot_id,
            offsets = ?queue_offsets,
            "commit.snapshot"
        );
        Ok(())
    }
}

/// Handle used to ask the commit thread for another round.
#[derive(Clone)]
pub(crate) struct CommitRequester(Sender<()>);

impl CommitRequester {
    /// Requests a commit round. Requests made while one is already pending
    /// collapse into it.
    pub fn request(&self) {
        let _ = self.0.try_send(());
    }
}

/// Single thread running commit rounds one after another.
pub(crate) struct CommitExecutor {
    requester: CommitRequester,
    stop: StopToken,
    worker: WorkerHandle,
}

impl CommitExecutor {
    pub fn spawn<F>(name: &str, mut round: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, rx): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);
        let stop = StopToken::new();
        let worker_stop = stop.clone();
        let worker = spawn_worker(name, move || loop {
            match rx.recv_timeout(IDLE_CHECK) {
                Ok(()) => round(),
                Err(RecvTimeoutError::Timeout) if worker_stop.is_stopped() => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
        Ok(Self {
            requester: CommitRequester(tx),
            stop,
            worker,
        })
    }

    pub fn requester(&self) -> CommitRequester {
        self.requester.clone()
    }

    /// Lets a pending round finish, then stops the thread within `timeout`.
    pub fn shutdown(self, timeout: Duration) -> bool {
        self.stop.stop();
        drop(self.requester);
        self.worker.join_timeout(timeout)
    }
}
