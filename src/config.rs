//! Node configuration loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NodeId;

/// Replica role of a storage node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Owns partitions and replays the full mutation log.
    #[default]
    Primary,
    /// Read replica: applies schema operations from the log and catches up
    /// data from the primary's persisted partitions.
    Secondary,
}

/// Errors raised while loading or validating a [`NodeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML for [`NodeConfig`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that failed to parse.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// A value is out of range or inconsistent with another value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for one storage node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id.
    pub node_id: NodeId,
    /// Replica role.
    pub role: NodeRole,
    /// Number of storage nodes partitions are spread across.
    pub node_count: u32,
    /// Number of partitions in the cluster.
    pub partition_count: u32,
    /// Number of ingestion queues feeding the log.
    pub queue_count: usize,
    /// Size of the partition-write pool.
    pub write_threads: usize,
    /// Size of the bulk-file download pool.
    pub download_threads: usize,
    /// Maximum number of fan-out batches waiting for the writer.
    pub write_buffer_capacity: usize,
    /// Pause between writer-level retries of a failed batch.
    pub write_retry_interval_ms: u64,
    /// Pause before retrying the partitions that failed inside one batch.
    pub partition_retry_interval_ms: u64,
    /// Upper bound on one live-poll wait against the log.
    pub log_poll_timeout_ms: u64,
    /// Period of the queue-offset persistence timer.
    pub offset_persist_interval_ms: u64,
    /// Fixed delay between secondary catch-up rounds.
    pub catchup_interval_ms: u64,
    /// Whether garbage collection requests are honoured.
    pub gc_enabled: bool,
    /// Bounded wait applied to each shutdown step.
    pub shutdown_timeout_ms: u64,
    /// Whether partition journals fsync every write.
    pub sync_writes: bool,
    /// Root directory for partition data.
    pub data_dir: PathBuf,
    /// Directory of the metadata store.
    pub meta_dir: PathBuf,
    /// Directory of the file-backed replicated log.
    pub log_dir: PathBuf,
    /// Scratch directory for downloaded bulk files.
    pub download_dir: PathBuf,
    /// Primary's partition data root, read by a secondary during catch-up.
    pub primary_data_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(0),
            role: NodeRole::Primary,
            node_count: 1,
            partition_count: 4,
            queue_count: 1,
            write_threads: 4,
            download_threads: 2,
            write_buffer_capacity: 64,
            write_retry_interval_ms: 1_000,
            partition_retry_interval_ms: 100,
            log_poll_timeout_ms: 100,
            offset_persist_interval_ms: 3_000,
            catchup_interval_ms: 1_000,
            gc_enabled: true,
            shutdown_timeout_ms: 5_000,
            sync_writes: true,
            data_dir: PathBuf::from("data/partitions"),
            meta_dir: PathBuf::from("data/meta"),
            log_dir: PathBuf::from("data/log"),
            download_dir: PathBuf::from("data/download"),
            primary_data_dir: None,
        }
    }
}

impl NodeConfig {
    /// Loads a configuration file, filling unspecified keys with defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: NodeConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Places every directory under `root`.
    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.data_dir = root.join("partitions");
        self.meta_dir = root.join("meta");
        self.log_dir = root.join("log");
        self.download_dir = root.join("download");
        self
    }

    /// Rejects settings the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("node_count", self.node_count as usize),
            ("partition_count", self.partition_count as usize),
            ("queue_count", self.queue_count),
            ("write_threads", self.write_threads),
            ("download_threads", self.download_threads),
            ("write_buffer_capacity", self.write_buffer_capacity),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be positive")));
            }
        }
        if self.node_id.0 >= self.node_count {
            return Err(ConfigError::Invalid(format!(
                "node_id {} is outside node_count {}",
                self.node_id, self.node_count
            )));
        }
        if self.role == NodeRole::Secondary && self.primary_data_dir.is_none() {
            return Err(ConfigError::Invalid(
                "secondary nodes require primary_data_dir".into(),
            ));
        }
        Ok(())
    }

    /// Writer-level retry pause.
    pub fn write_retry_interval(&self) -> Duration {
        Duration::from_millis(self.write_retry_interval_ms)
    }

    /// Partition-level retry pause.
    pub fn partition_retry_interval(&self) -> Duration {
        Duration::from_millis(self.partition_retry_interval_ms)
    }

    /// Live-poll wait bound.
    pub fn log_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.log_poll_timeout_ms)
    }

    /// Offset persistence period.
    pub fn offset_persist_interval(&self) -> Duration {
        Duration::from_millis(self.offset_persist_interval_ms)
    }

    /// Catch-up delay.
    pub fn catchup_interval(&self) -> Duration {
        Duration::from_millis(self.catchup_interval_ms)
    }

    /// Per-step shutdown wait.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
