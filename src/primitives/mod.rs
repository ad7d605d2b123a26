//! Low-level building blocks shared by the write path.
//!
//! Includes positioned file I/O for partition journals and the cancellation
//! and worker-supervision primitives every background loop runs on.

/// Positioned file I/O.
///
/// Read/write-at-offset access used by partition journals.
pub mod io;

/// Cancellation tokens and supervised worker threads.
///
/// Replaces ad hoc stop flags with an explicit token that also wakes
/// sleeping loops, and gives every thread a bounded-wait join.
pub mod concurrency;
