//! Periodic catch-up for secondary nodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::concurrency::{spawn_worker, StopToken, WorkerHandle};
use crate::store::StoreService;
use crate::types::{Result, StoreError};

/// Runs [`StoreService::try_catch_up_with_primary`] with a fixed delay
/// between rounds. Failed rounds are logged and the schedule continues.
pub struct CatchupScheduler {
    store: Arc<StoreService>,
    interval: Duration,
    shutdown_timeout: Duration,
    rounds: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    stop: StopToken,
    worker: Mutex<Option<WorkerHandle>>,
}

impl CatchupScheduler {
    /// Creates a stopped scheduler.
    pub fn new(store: Arc<StoreService>, interval: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            store,
            interval,
            shutdown_timeout,
            rounds: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            stop: StopToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Starts the schedule. The first round runs after one interval.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(StoreError::invalid("catch-up scheduler already started"));
        }
        if self.stop.is_stopped() {
            return Err(StoreError::Stopped);
        }
        let store = Arc::clone(&self.store);
        let stop = self.stop.clone();
        let rounds = Arc::clone(&self.rounds);
        let failures = Arc::clone(&self.failures);
        let interval = self.interval;
        *worker = Some(spawn_worker("catchup", move || {
            while !stop.wait_timeout(interval) {
                match store.try_catch_up_with_primary() {
                    Ok(()) => debug!("catchup.round.completed"),
                    Err(err) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %err, "catchup.round.failed");
                    }
                }
                rounds.fetch_add(1, Ordering::Relaxed);
            }
        })?);
        info!(interval_ms = interval.as_millis() as u64, "catchup.started");
        Ok(())
    }

    /// Rounds attempted so far.
    pub fn rounds_completed(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Rounds that returned an error.
    pub fn rounds_failed(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Stops the schedule, waiting at most the shutdown timeout for a round in
    /// progress.
    pub fn stop(&self) {
        self.stop.stop();
        if let Some(worker) = self.worker.lock().take() {
            if !worker.join_timeout(self.shutdown_timeout) {
                warn!("catchup.stop.timeout");
            }
        }
    }
}
