use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical timestamp of a globally consistent point in the mutation log.
pub type SnapshotId = i64;

/// Position of a record in a node's replicated log.
pub type LogOffset = i64;

/// Offset recorded for a queue that has not consumed anything yet.
pub const NO_OFFSET: LogOffset = -1;

/// Snapshot id reported before anything is durable.
pub const NO_SNAPSHOT: SnapshotId = -1;

/// Partition key that addresses every local partition instead of exactly one.
pub const BROADCAST_KEY: i64 = -1;

/// Identifier of a storage node in the cluster.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

/// Identifier of a graph partition (shard).
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

/// Identifier of an ingestion queue feeding the log.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct QueueId(pub u32);

impl QueueId {
    /// Returns the queue position inside per-queue offset vectors.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
