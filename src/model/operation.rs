use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{LogOffset, QueueId, SnapshotId, StoreError, BROADCAST_KEY};

/// Kind of mutation carried by an [`OperationBlob`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Control marker with no effect on stored data.
    Marker,
    /// Registers a vertex type.
    CreateVertexType,
    /// Registers an edge type.
    CreateEdgeType,
    /// Removes a vertex type.
    DropVertexType,
    /// Removes an edge type.
    DropEdgeType,
    /// Registers an edge kind (source/edge/destination triple).
    AddEdgeKind,
    /// Removes an edge kind.
    RemoveEdgeKind,
    /// Announces an upcoming bulk load for a type.
    PrepareDataLoad,
    /// Completes a bulk load for a type.
    CommitDataLoad,
    /// Replaces a vertex.
    OverwriteVertex,
    /// Upserts a vertex.
    UpdateVertex,
    /// Deletes a vertex.
    DeleteVertex,
    /// Replaces an edge.
    OverwriteEdge,
    /// Upserts an edge.
    UpdateEdge,
    /// Deletes an edge.
    DeleteEdge,
}

/// Entity family targeted by a data operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Graph vertex.
    Vertex,
    /// Graph edge.
    Edge,
}

impl OperationType {
    /// Every operation type, in declaration order.
    pub const ALL: [OperationType; 15] = [
        OperationType::Marker,
        OperationType::CreateVertexType,
        OperationType::CreateEdgeType,
        OperationType::DropVertexType,
        OperationType::DropEdgeType,
        OperationType::AddEdgeKind,
        OperationType::RemoveEdgeKind,
        OperationType::PrepareDataLoad,
        OperationType::CommitDataLoad,
        OperationType::OverwriteVertex,
        OperationType::UpdateVertex,
        OperationType::DeleteVertex,
        OperationType::OverwriteEdge,
        OperationType::UpdateEdge,
        OperationType::DeleteEdge,
    ];

    /// Returns `true` for operations that change the schema.
    pub fn is_ddl(self) -> bool {
        matches!(
            self,
            OperationType::CreateVertexType
                | OperationType::CreateEdgeType
                | OperationType::DropVertexType
                | OperationType::DropEdgeType
                | OperationType::AddEdgeKind
                | OperationType::RemoveEdgeKind
                | OperationType::PrepareDataLoad
                | OperationType::CommitDataLoad
        )
    }

    /// Returns `true` for operations a secondary node applies from the log.
    pub fn is_schema_or_control(self) -> bool {
        self == OperationType::Marker || self.is_ddl()
    }

    /// Returns the entity family for data operations.
    pub fn entity_kind(self) -> Option<EntityKind> {
        match self {
            OperationType::OverwriteVertex
            | OperationType::UpdateVertex
            | OperationType::DeleteVertex => Some(EntityKind::Vertex),
            OperationType::OverwriteEdge | OperationType::UpdateEdge | OperationType::DeleteEdge => {
                Some(EntityKind::Edge)
            }
            _ => None,
        }
    }

    /// Returns `true` when the operation removes its entity.
    pub fn is_delete(self) -> bool {
        matches!(self, OperationType::DeleteVertex | OperationType::DeleteEdge)
    }

    /// Canonical snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Marker => "marker",
            OperationType::CreateVertexType => "create_vertex_type",
            OperationType::CreateEdgeType => "create_edge_type",
            OperationType::DropVertexType => "drop_vertex_type",
            OperationType::DropEdgeType => "drop_edge_type",
            OperationType::AddEdgeKind => "add_edge_kind",
            OperationType::RemoveEdgeKind => "remove_edge_kind",
            OperationType::PrepareDataLoad => "prepare_data_load",
            OperationType::CommitDataLoad => "commit_data_load",
            OperationType::OverwriteVertex => "overwrite_vertex",
            OperationType::UpdateVertex => "update_vertex",
            OperationType::DeleteVertex => "delete_vertex",
            OperationType::OverwriteEdge => "overwrite_edge",
            OperationType::UpdateEdge => "update_edge",
            OperationType::DeleteEdge => "delete_edge",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        OperationType::ALL
            .into_iter()
            .find(|op| op.as_str() == normalized)
            .ok_or_else(|| StoreError::invalid(format!("unknown operation type `{s}`")))
    }
}

/// One mutation as appended to the replicated log.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OperationBlob {
    /// What the mutation does.
    pub op_type: OperationType,
    /// Routing key; [`BROADCAST_KEY`] targets every local partition.
    pub partition_key: i64,
    /// Opaque payload interpreted by the partition engine.
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl OperationBlob {
    /// Creates a blob routed by `partition_key`.
    pub fn new(op_type: OperationType, partition_key: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            op_type,
            partition_key,
            payload: payload.into(),
        }
    }

    /// Creates a blob applied to every partition owned by the receiving node.
    pub fn broadcast(op_type: OperationType, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(op_type, BROADCAST_KEY, payload)
    }

    /// Returns `true` when the blob targets every local partition.
    pub fn is_broadcast(&self) -> bool {
        self.partition_key == BROADCAST_KEY
    }
}

/// Ordered operations appended atomically under one snapshot id.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationBatch {
    ops: Vec<OperationBlob>,
}

impl OperationBatch {
    /// Wraps an ordered list of operations.
    pub fn new(ops: Vec<OperationBlob>) -> Self {
        Self { ops }
    }

    /// Appends an operation at the end of the batch.
    pub fn push(&mut self, op: OperationBlob) {
        self.ops.push(op);
    }

    /// Appends every operation from `other`, preserving order.
    pub fn extend_from(&mut self, other: &OperationBatch) {
        self.ops.extend(other.ops.iter().cloned());
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` when the batch carries no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations in append order.
    pub fn ops(&self) -> &[OperationBlob] {
        &self.ops
    }

    /// Iterates operations in append order.
    pub fn iter(&self) -> std::slice::Iter<'_, OperationBlob> {
        self.ops.iter()
    }

    /// Returns `true` if any operation changes the schema.
    pub fn has_ddl(&self) -> bool {
        self.ops.iter().any(|op| op.op_type.is_ddl())
    }

    /// Keeps only schema and control operations, the subset a secondary applies.
    pub fn schema_and_control_only(&self) -> OperationBatch {
        self.ops
            .iter()
            .filter(|op| op.op_type.is_schema_or_control())
            .cloned()
            .collect()
    }
}

impl FromIterator<OperationBlob> for OperationBatch {
    fn from_iter<I: IntoIterator<Item = OperationBlob>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a OperationBatch {
    type Item = &'a OperationBlob;
    type IntoIter = std::slice::Iter<'a, OperationBlob>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

/// A record read from the replicated log.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Strictly increasing position in the node's log.
    pub offset: LogOffset,
    /// Snapshot id shared by every operation in the batch.
    pub snapshot_id: SnapshotId,
    /// Ingestion queue the batch was appended through.
    #[serde(default)]
    pub queue_id: QueueId,
    /// Wall-clock append time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp_ms: u64,
    /// Operations appended atomically.
    pub batch: OperationBatch,
}
