use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use super::{NodeId, PartitionId};

/// Errors raised by the write path of a storage node.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding failure.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Persisted data failed validation.
    #[error("corruption: {0}")]
    Corruption(String),
    /// Caller supplied an argument the component cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// A record addressed a partition that this node does not own.
    #[error("partition {partition} is owned by node {owner}, not node {node}")]
    Routing {
        /// Partition the record resolved to.
        partition: PartitionId,
        /// Node that owns the partition according to the partition map.
        owner: NodeId,
        /// Node that received the record.
        node: NodeId,
    },
    /// Persisted queue offsets disagree with the configured queue count.
    #[error("persisted queue offsets hold {persisted} queues but {configured} are configured")]
    QueueCountMismatch {
        /// Number of queues found in the metadata store.
        persisted: usize,
        /// Number of queues in the node configuration.
        configured: usize,
    },
    /// A partition-level operation failed.
    #[error("partition {partition}: {reason}")]
    Partition {
        /// Partition that reported the failure.
        partition: PartitionId,
        /// Failure description.
        reason: String,
    },
    /// The component is stopping or stopped and refuses new work.
    #[error("component is stopping")]
    Stopped,
    /// An ingestion request arrived while another one is running.
    #[error("another ingestion is already running")]
    IngestBusy,
    /// Garbage collection was requested but is not enabled.
    #[error("garbage collection is disabled")]
    GcDisabled,
    /// A secondary-only operation ran on a primary node.
    #[error("operation requires a secondary node")]
    NotSecondary,
    /// The replicated log service failed.
    #[error("log: {0}")]
    Log(String),
    /// The coordinator rejected or failed a snapshot commit.
    #[error("snapshot commit: {0}")]
    Commit(String),
    /// A file expected on disk is missing.
    #[error("missing file: {0}")]
    MissingFile(PathBuf),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn partition(partition: PartitionId, reason: impl fmt::Display) -> Self {
        StoreError::Partition {
            partition,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        StoreError::Corruption(reason.into())
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        StoreError::Invalid(reason.into())
    }
}
