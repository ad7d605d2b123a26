use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};

use crate::model::StoreDataBatch;
use crate::types::{Result, StoreError};

const OFFER_SLICE: Duration = Duration::from_millis(50);

/// Bounded FIFO between the log consumer and the writer.
///
/// A full buffer blocks the producer; nothing is ever dropped while the
/// writer is running.
pub struct WriteBuffer {
    tx: Sender<StoreDataBatch>,
    rx: Receiver<StoreDataBatch>,
    capacity: usize,
}

impl WriteBuffer {
    /// Creates a buffer holding at most `capacity` batches.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Enqueues `batch`, blocking while the buffer is full.
    ///
    /// Fails with [`StoreError::Stopped`] once `cancelled` returns `true`.
    pub fn offer(&self, batch: StoreDataBatch, cancelled: impl Fn() -> bool) -> Result<()> {
        let mut batch = batch;
        loop {
            if cancelled() {
                return Err(StoreError::Stopped);
            }
            match self.tx.send_timeout(batch, OFFER_SLICE) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(rejected)) => batch = rejected,
                Err(SendTimeoutError::Disconnected(_)) => return Err(StoreError::Stopped),
            }
        }
    }

    /// Takes the oldest batch, waiting up to `timeout`.
    pub fn poll(&self, timeout: Duration) -> Option<StoreDataBatch> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Number of queued batches.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of queued batches.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
