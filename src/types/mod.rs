#![forbid(unsafe_code)]

//! Identifiers and the error type shared by every component of a storage node.

mod error;
mod ids;

pub use error::{Result, StoreError};
pub use ids::{
    LogOffset, NodeId, PartitionId, QueueId, SnapshotId, BROADCAST_KEY, NO_OFFSET, NO_SNAPSHOT,
};
