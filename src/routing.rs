//! Cluster partition map: which partition a key belongs to and which node
//! owns each partition.

use xxhash_rust::xxh64::xxh64;

use crate::types::{NodeId, PartitionId, Result, StoreError};

/// Static assignment of keys to partitions and partitions to nodes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionMap {
    owners: Vec<NodeId>,
}

impl PartitionMap {
    /// Spreads `partition_count` partitions over `node_count` nodes, partition
    /// `p` going to node `p % node_count`.
    pub fn round_robin(partition_count: u32, node_count: u32) -> Result<Self> {
        if partition_count == 0 || node_count == 0 {
            return Err(StoreError::invalid(
                "partition map needs at least one partition and one node",
            ));
        }
        let owners = (0..partition_count)
            .map(|partition| NodeId(partition % node_count))
            .collect();
        Ok(Self { owners })
    }

    /// Uses an explicit owner per partition, indexed by partition id.
    pub fn with_owners(owners: Vec<NodeId>) -> Result<Self> {
        if owners.is_empty() {
            return Err(StoreError::invalid("partition map needs at least one partition"));
        }
        Ok(Self { owners })
    }

    /// Number of partitions in the cluster.
    pub fn partition_count(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Partition that owns `key`.
    ///
    /// Stable across processes: the key's big-endian bytes are hashed with
    /// xxh64 (seed 0) and reduced modulo the partition count.
    pub fn partition_for_key(&self, key: i64) -> PartitionId {
        let hash = xxh64(&key.to_be_bytes(), 0);
        PartitionId((hash % self.owners.len() as u64) as u32)
    }

    /// Node owning `partition`, if the partition exists.
    pub fn owner_of(&self, partition: PartitionId) -> Option<NodeId> {
        self.owners.get(partition.0 as usize).copied()
    }

    /// Partitions assigned to `node`, in ascending order.
    pub fn partitions_of(&self, node: NodeId) -> Vec<PartitionId> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == node)
            .map(|(partition, _)| PartitionId(partition as u32))
            .collect()
    }
}
