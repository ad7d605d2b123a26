//! Values flowing through the write path: log records, per-partition fan-out
//! batches, the published snapshot watermark and the persisted queue offsets.

mod batch;
mod offsets;
mod operation;
mod snapshot;

pub use batch::StoreDataBatch;
pub use offsets::QueueOffsets;
pub use operation::{EntityKind, LogEntry, OperationBatch, OperationBlob, OperationType};
pub use snapshot::{SnapshotCell, SnapshotInfo};
