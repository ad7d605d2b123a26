#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::types::Result;

/// Cooperative cancellation shared by a component and its worker threads.
///
/// Stopping is one-way. Sleeping loops use [`StopToken::wait_timeout`] so a
/// stop request wakes them immediately instead of after their interval.
#[derive(Clone, Default)]
pub struct StopToken {
    inner: Arc<StopState>,
}

#[derive(Default)]
struct StopState {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

impl StopToken {
    /// Creates a token that has not been stopped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and wakes every waiter.
    pub fn stop(&self) {
        let mut stopped = self.inner.stopped.lock();
        *stopped = true;
        self.inner.wakeup.notify_all();
    }

    /// Returns `true` once [`StopToken::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Sleeps up to `timeout`, returning early when stopped.
    ///
    /// Returns `true` if the token is stopped when the wait ends.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.inner.stopped.lock();
        while !*stopped {
            if self
                .inner
                .wakeup
                .wait_until(&mut stopped, deadline)
                .timed_out()
            {
                break;
            }
        }
        *stopped
    }
}

impl std::fmt::Debug for StopToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopToken")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Handle to a named background thread with a bounded-wait join.
pub struct WorkerHandle {
    name: String,
    done: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

struct DoneSignal(Sender<()>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

/// Spawns `body` on a named thread.
///
/// Completion is signalled even when `body` panics, so joins never wait on a
/// dead thread.
pub fn spawn_worker<F>(name: &str, body: F) -> Result<WorkerHandle>
where
    F: FnOnce() + Send + 'static,
{
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _signal = DoneSignal(done_tx);
            body();
        })?;
    Ok(WorkerHandle {
        name: name.to_string(),
        done: done_rx,
        join: Some(join),
    })
}

impl WorkerHandle {
    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` once the thread body has returned.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits up to `timeout` for the thread to exit.
    ///
    /// Returns `false` and leaves the thread detached when the deadline
    /// passes first.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.take() {
                    if join.join().is_err() {
                        warn!(worker = %self.name, "worker.panicked");
                    }
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    worker = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker.join.timeout"
                );
                false
            }
        }
    }
}
