use serde::{Deserialize, Serialize};

use crate::types::{LogOffset, QueueId, Result, NO_OFFSET};

/// Last fully applied log offset for every ingestion queue.
///
/// Persisted as a JSON array so a restarted node knows where replay starts.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueOffsets {
    offsets: Vec<LogOffset>,
}

impl QueueOffsets {
    /// Offsets for `queue_count` queues that have consumed nothing.
    pub fn fresh(queue_count: usize) -> Self {
        Self {
            offsets: vec![NO_OFFSET; queue_count],
        }
    }

    /// Wraps explicit offsets.
    pub fn from_vec(offsets: Vec<LogOffset>) -> Self {
        Self { offsets }
    }

    /// Number of queues tracked.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns `true` when no queue is tracked.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Offset for `queue`, or [`NO_OFFSET`] when the queue is unknown.
    pub fn get(&self, queue: QueueId) -> LogOffset {
        self.offsets.get(queue.index()).copied().unwrap_or(NO_OFFSET)
    }

    /// Raises the offset for `queue`; lower values are ignored.
    pub fn advance(&mut self, queue: QueueId, offset: LogOffset) {
        if let Some(slot) = self.offsets.get_mut(queue.index()) {
            *slot = (*slot).max(offset);
        }
    }

    /// Lowest offset across all queues, the safe replay floor.
    pub fn min(&self) -> LogOffset {
        self.offsets.iter().copied().min().unwrap_or(NO_OFFSET)
    }

    /// Offsets as a slice, in queue order.
    pub fn as_slice(&self) -> &[LogOffset] {
        &self.offsets
    }

    /// Returns `true` when every queue is at or past `other` and at least one is past it.
    pub fn is_ahead_of(&self, other: &QueueOffsets) -> bool {
        self.offsets.len() == other.offsets.len()
            && self.offsets.iter().zip(&other.offsets).all(|(a, b)| a >= b)
            && self.offsets != other.offsets
    }

    /// Encodes the offsets for the metadata store.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes offsets previously written by [`QueueOffsets::to_json`].
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
