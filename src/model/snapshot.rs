use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::types::{SnapshotId, NO_SNAPSHOT};

/// Durable watermark published by a node.
///
/// Immutable: advancing the watermark produces a new value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Highest snapshot id whose writes are durable on every local partition.
    pub snapshot_id: SnapshotId,
    /// Highest snapshot id known to have carried a schema change.
    pub ddl_snapshot_id: SnapshotId,
}

impl SnapshotInfo {
    /// Watermark before anything is durable.
    pub const NONE: SnapshotInfo = SnapshotInfo {
        snapshot_id: NO_SNAPSHOT,
        ddl_snapshot_id: NO_SNAPSHOT,
    };

    /// Creates a watermark value.
    pub fn new(snapshot_id: SnapshotId, ddl_snapshot_id: SnapshotId) -> Self {
        Self {
            snapshot_id,
            ddl_snapshot_id,
        }
    }

    /// Watermark after a batch at `batch_snapshot_id` was applied.
    ///
    /// Only snapshots strictly before the batch are reported durable, and
    /// neither component ever moves backwards.
    pub fn advance(&self, batch_snapshot_id: SnapshotId, last_ddl_snapshot_id: SnapshotId) -> Self {
        Self {
            snapshot_id: self.snapshot_id.max(batch_snapshot_id - 1),
            ddl_snapshot_id: self.ddl_snapshot_id.max(last_ddl_snapshot_id),
        }
    }
}

impl Default for SnapshotInfo {
    fn default() -> Self {
        Self::NONE
    }
}

/// Single-writer cell holding the latest published [`SnapshotInfo`].
///
/// The value is swapped whole through an atomic pointer; readers never take
/// a lock and never see a half-updated watermark.
#[derive(Debug)]
pub struct SnapshotCell {
    current: ArcSwap<SnapshotInfo>,
}

impl SnapshotCell {
    /// Creates a cell holding `initial`.
    pub fn new(initial: SnapshotInfo) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Returns the latest published value.
    pub fn load(&self) -> Arc<SnapshotInfo> {
        self.current.load_full()
    }

    /// Publishes a new value.
    pub fn store(&self, info: SnapshotInfo) {
        self.current.store(Arc::new(info));
    }
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self::new(SnapshotInfo::NONE)
    }
}
