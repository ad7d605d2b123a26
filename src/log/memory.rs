use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::model::{LogEntry, OperationBatch};
use crate::types::{LogOffset, NodeId, QueueId, Result, SnapshotId};

use super::{LogReader, LogService};

/// In-process log: one vector of records per node, offsets starting at zero.
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    nodes: Mutex<HashMap<NodeId, Vec<LogEntry>>>,
    appended: Condvar,
}

impl MemoryLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a batch for `node` and returns its offset.
    pub fn append(
        &self,
        node: NodeId,
        queue_id: QueueId,
        snapshot_id: SnapshotId,
        batch: OperationBatch,
    ) -> LogOffset {
        self.append_at(node, queue_id, snapshot_id, 0, batch)
    }

    /// Appends a batch stamped with `timestamp_ms`.
    pub fn append_at(
        &self,
        node: NodeId,
        queue_id: QueueId,
        snapshot_id: SnapshotId,
        timestamp_ms: u64,
        batch: OperationBatch,
    ) -> LogOffset {
        let mut nodes = self.inner.nodes.lock();
        let records = nodes.entry(node).or_default();
        let offset = records.len() as LogOffset;
        records.push(LogEntry {
            offset,
            snapshot_id,
            queue_id,
            timestamp_ms,
            batch,
        });
        self.inner.appended.notify_all();
        offset
    }

    /// Number of records appended for `node`.
    pub fn len(&self, node: NodeId) -> usize {
        self.inner.nodes.lock().get(&node).map_or(0, Vec::len)
    }
}

impl LogService for MemoryLog {
    fn create_reader(&self, node: NodeId, from_offset: LogOffset) -> Result<Box<dyn LogReader>> {
        let head = self.len(node) as LogOffset;
        Ok(Box::new(MemoryReader {
            shared: Arc::clone(&self.inner),
            node,
            next: from_offset.max(0),
            head,
        }))
    }
}

struct MemoryReader {
    shared: Arc<Shared>,
    node: NodeId,
    next: LogOffset,
    head: LogOffset,
}

impl LogReader for MemoryReader {
    fn read_next_record(&mut self) -> Result<Option<LogEntry>> {
        if self.next >= self.head {
            return Ok(None);
        }
        let nodes = self.shared.nodes.lock();
        let entry = nodes
            .get(&self.node)
            .and_then(|records| records.get(self.next as usize))
            .cloned();
        if entry.is_some() {
            self.next += 1;
        }
        Ok(entry)
    }

    fn latest_updates(&mut self, timeout: Duration) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + timeout;
        let mut nodes = self.shared.nodes.lock();
        loop {
            let available = nodes.get(&self.node).map_or(0, Vec::len) as LogOffset;
            if available > self.next {
                let start = self.next as usize;
                let updates = nodes
                    .get(&self.node)
                    .map(|records| records[start..].to_vec())
                    .unwrap_or_default();
                self.next = available;
                self.head = self.head.max(available);
                return Ok(updates);
            }
            if self
                .shared
                .appended
                .wait_until(&mut nodes, deadline)
                .timed_out()
            {
                return Ok(Vec::new());
            }
        }
    }
}
