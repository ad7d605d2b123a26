//! Client side of the replicated mutation log.
//!
//! The log is an append-only sequence of [`LogEntry`] records per node.
//! Readers serve two phases: a bounded replay up to the head observed when
//! the reader was created, then live polling for anything appended later.

mod file;
mod memory;

use std::time::Duration;

use crate::model::LogEntry;
use crate::types::{LogOffset, NodeId, Result};

pub use file::FileLog;
pub use memory::MemoryLog;

/// Source of log readers for storage nodes.
pub trait LogService: Send + Sync {
    /// Opens a reader over `node`'s records starting at `from_offset`.
    fn create_reader(&self, node: NodeId, from_offset: LogOffset) -> Result<Box<dyn LogReader>>;
}

/// Cursor over one node's log.
pub trait LogReader: Send {
    /// Next record at or before the head observed when the reader was created.
    ///
    /// Returns `None` once the replay range is exhausted.
    fn read_next_record(&mut self) -> Result<Option<LogEntry>>;

    /// Records appended after the last one returned, waiting up to `timeout`
    /// when none are available yet.
    fn latest_updates(&mut self, timeout: Duration) -> Result<Vec<LogEntry>>;
}
