use std::collections::BTreeMap;

use crate::types::{LogOffset, PartitionId, QueueId, SnapshotId};

use super::{OperationBatch, OperationBlob};

/// One log record fanned out to the partitions it touches.
///
/// Routed operations live in a per-partition map; broadcast operations live
/// in their own slot and are applied to every partition the node owns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreDataBatch {
    snapshot_id: SnapshotId,
    queue_id: QueueId,
    source_offset: LogOffset,
    partitions: BTreeMap<PartitionId, OperationBatch>,
    broadcast: OperationBatch,
}

impl StoreDataBatch {
    /// Starts an empty batch for the record at `source_offset`.
    pub fn new(snapshot_id: SnapshotId, queue_id: QueueId, source_offset: LogOffset) -> Self {
        Self {
            snapshot_id,
            queue_id,
            source_offset,
            partitions: BTreeMap::new(),
            broadcast: OperationBatch::default(),
        }
    }

    /// Adds an operation routed to a single partition.
    pub fn add_to_partition(&mut self, partition: PartitionId, op: OperationBlob) {
        self.partitions.entry(partition).or_default().push(op);
    }

    /// Adds an operation for every local partition.
    pub fn add_broadcast(&mut self, op: OperationBlob) {
        self.broadcast.push(op);
    }

    /// Snapshot id of the source record.
    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    /// Queue the source record arrived through.
    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    /// Log offset of the source record.
    pub fn source_offset(&self) -> LogOffset {
        self.source_offset
    }

    /// Routed sub-batches keyed by partition.
    pub fn partition_batches(&self) -> &BTreeMap<PartitionId, OperationBatch> {
        &self.partitions
    }

    /// Broadcast slot.
    pub fn broadcast(&self) -> &OperationBatch {
        &self.broadcast
    }

    /// Returns `true` when neither slot carries an operation.
    pub fn is_empty(&self) -> bool {
        self.broadcast.is_empty() && self.partitions.values().all(OperationBatch::is_empty)
    }

    /// Expands the batch into one write per partition.
    ///
    /// Every partition in `owned` receives the broadcast operations followed
    /// by its own routed operations. Routed partitions missing from `owned`
    /// are returned separately so the caller can report them.
    pub fn writes_for(
        &self,
        owned: impl IntoIterator<Item = PartitionId>,
    ) -> (Vec<(PartitionId, OperationBatch)>, Vec<PartitionId>) {
        let mut writes = Vec::new();
        let mut seen = Vec::new();
        for partition in owned {
            let routed = self.partitions.get(&partition);
            if self.broadcast.is_empty() && routed.map_or(true, OperationBatch::is_empty) {
                continue;
            }
            let mut ops = self.broadcast.clone();
            if let Some(routed) = routed {
                ops.extend_from(routed);
                seen.push(partition);
            }
            writes.push((partition, ops));
        }
        let unowned = self
            .partitions
            .iter()
            .filter(|(id, ops)| !ops.is_empty() && !seen.contains(*id))
            .map(|(id, _)| *id)
            .collect();
        (writes, unowned)
    }
}
