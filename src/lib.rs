//! Write path of a partitioned Sombra storage node.
//!
//! A node consumes its replicated mutation log, routes every operation to the
//! local partition that owns it, applies batches durably and in order, and
//! reports a monotonically advancing snapshot watermark to the cluster
//! coordinator. Secondary nodes apply only schema operations from the log
//! and converge on the primary's partition state through periodic catch-up.

#![warn(missing_docs)]

pub mod catchup;
pub mod config;
pub mod log;
pub mod meta;
pub mod model;
pub mod node;
pub mod partition;
pub mod primitives;
pub mod processor;
pub mod routing;
pub mod service;
pub mod store;
pub mod types;
pub mod writer;

pub use config::{NodeConfig, NodeRole};
pub use node::{NodeDeps, StoreNode};
pub use types::{Result, StoreError};
