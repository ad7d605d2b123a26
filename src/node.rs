//! Wiring and lifecycle of a complete storage node.

use std::sync::Arc;

use tracing::{error, info};

use crate::catchup::CatchupScheduler;
use crate::config::{NodeConfig, NodeRole};
use crate::log::{FileLog, LogService};
use crate::meta::{FileMetaStore, MetaStore};
use crate::model::SnapshotInfo;
use crate::partition::{ExternalStorage, KvPartitionFactory, LocalFsStorage, PartitionFactory};
use crate::processor::LogProcessor;
use crate::routing::PartitionMap;
use crate::service::StoreNodeService;
use crate::store::StoreService;
use crate::types::{Result, StoreError};
use crate::writer::{LoggingCommitClient, SnapshotCommitClient, WriterAgent};

/// External collaborators of a node.
pub struct NodeDeps {
    /// Replicated mutation log.
    pub log: Arc<dyn LogService>,
    /// Local metadata store for queue offsets.
    pub meta: Arc<dyn MetaStore>,
    /// Coordinator client receiving snapshot commits.
    pub commit_client: Arc<dyn SnapshotCommitClient>,
    /// Opens the node's partitions.
    pub partitions: Arc<dyn PartitionFactory>,
    /// Source of bulk-load files.
    pub storage: Arc<dyn ExternalStorage>,
}

impl NodeDeps {
    /// File-backed collaborators rooted at the configured directories.
    pub fn local(config: &NodeConfig) -> Result<Self> {
        Ok(Self {
            log: Arc::new(FileLog::open(&config.log_dir)?),
            meta: Arc::new(FileMetaStore::open(&config.meta_dir)?),
            commit_client: Arc::new(LoggingCommitClient),
            partitions: Arc::new(KvPartitionFactory::from_config(config)?),
            storage: Arc::new(LocalFsStorage),
        })
    }
}

/// A storage node: store, writer, log processor and, on secondaries, the
/// catch-up scheduler.
pub struct StoreNode {
    config: NodeConfig,
    store: Arc<StoreService>,
    writer: Arc<WriterAgent>,
    processor: Arc<LogProcessor>,
    catchup: Option<CatchupScheduler>,
}

impl StoreNode {
    /// Builds a node whose partitions are spread round-robin over the
    /// configured node count.
    pub fn new(config: NodeConfig, deps: NodeDeps) -> Result<Self> {
        let map = PartitionMap::round_robin(config.partition_count, config.node_count)?;
        Self::with_partition_map(config, map, deps)
    }

    /// Builds a node with an explicit partition map.
    pub fn with_partition_map(config: NodeConfig, map: PartitionMap, deps: NodeDeps) -> Result<Self> {
        config
            .validate()
            .map_err(|err| StoreError::invalid(err.to_string()))?;
        let map = Arc::new(map);
        let store = Arc::new(StoreService::new(
            &config,
            Arc::clone(&map),
            deps.partitions,
            deps.storage,
        ));
        let writer = Arc::new(WriterAgent::new(
            &config,
            Arc::clone(&store),
            deps.commit_client,
        ));
        let processor = Arc::new(LogProcessor::new(
            &config,
            map,
            deps.log,
            deps.meta,
            Arc::clone(&writer),
        ));
        let catchup = (config.role == NodeRole::Secondary).then(|| {
            CatchupScheduler::new(
                Arc::clone(&store),
                config.catchup_interval(),
                config.shutdown_timeout(),
            )
        });
        Ok(Self {
            config,
            store,
            writer,
            processor,
            catchup,
        })
    }

    /// Recovers local state and starts every component.
    ///
    /// Any failure stops whatever already started and is returned.
    pub fn start(&self) -> Result<()> {
        if let Err(err) = self.start_components() {
            error!(node = %self.config.node_id, error = %err, "node.start.failed");
            self.stop();
            return Err(err);
        }
        info!(
            node = %self.config.node_id,
            role = ?self.config.role,
            snapshot = self.writer.snapshot_info().snapshot_id,
            "node.started"
        );
        Ok(())
    }

    fn start_components(&self) -> Result<()> {
        self.store.start()?;
        let snapshot_id = self.store.recover()?;
        let offsets = self.processor.recover()?;
        self.writer.init(snapshot_id, offsets)?;
        self.writer.start()?;
        self.processor.start()?;
        if let Some(catchup) = &self.catchup {
            catchup.start()?;
        }
        Ok(())
    }

    /// Stops components in reverse start order.
    pub fn stop(&self) {
        if let Some(catchup) = &self.catchup {
            catchup.stop();
        }
        self.processor.stop();
        self.writer.stop();
        self.processor.persist_offsets();
        self.store.stop();
        info!(node = %self.config.node_id, "node.stopped");
    }

    /// Configuration the node runs with.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Latest published watermark.
    pub fn snapshot_info(&self) -> Arc<SnapshotInfo> {
        self.writer.snapshot_info()
    }

    /// Error that stopped log consumption, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.processor.fatal_error()
    }

    /// Request surface for the RPC layer.
    pub fn service(&self) -> StoreNodeService {
        StoreNodeService::new(Arc::clone(&self.store), Arc::clone(&self.processor))
    }

    /// The node's store.
    pub fn store(&self) -> &Arc<StoreService> {
        &self.store
    }

    /// The node's writer.
    pub fn writer(&self) -> &Arc<WriterAgent> {
        &self.writer
    }

    /// The node's log processor.
    pub fn processor(&self) -> &Arc<LogProcessor> {
        &self.processor
    }

    /// The catch-up scheduler, on secondaries.
    pub fn catchup(&self) -> Option<&CatchupScheduler> {
        self.catchup.as_ref()
    }
}
