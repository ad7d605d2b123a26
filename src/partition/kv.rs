#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{NodeConfig, NodeRole};
use crate::model::{EntityKind, OperationBatch, OperationBlob, OperationType};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{PartitionId, Result, SnapshotId, StoreError, NO_SNAPSHOT};

use super::journal::{
    read_frames, read_header, Journal, JournalFrame, JournalHeader, JournalRecord, FILE_HEADER_LEN,
};
use super::{partition_dir, GraphPartition, PartitionFactory, JOURNAL_FILE_NAME};

type EntityKey = (EntityKind, i64);

#[derive(Clone, Debug, Eq, PartialEq)]
struct Version {
    snapshot_id: SnapshotId,
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
}

/// In-memory image of a partition, rebuilt from journal frames.
#[derive(Debug)]
struct PartitionState {
    /// Versions per entity, ascending by snapshot.
    entities: BTreeMap<EntityKey, Vec<Version>>,
    vertex_types: BTreeSet<String>,
    edge_types: BTreeSet<String>,
    edge_kinds: BTreeSet<String>,
    pending_loads: BTreeSet<String>,
    durable_snapshot: SnapshotId,
    ddl_snapshot: SnapshotId,
    gc_snapshot: SnapshotId,
}

impl PartitionState {
    fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            vertex_types: BTreeSet::new(),
            edge_types: BTreeSet::new(),
            edge_kinds: BTreeSet::new(),
            pending_loads: BTreeSet::new(),
            durable_snapshot: NO_SNAPSHOT,
            ddl_snapshot: NO_SNAPSHOT,
            gc_snapshot: NO_SNAPSHOT,
        }
    }

    fn apply(&mut self, frame: &JournalFrame) {
        match &frame.record {
            JournalRecord::Batch { ops } => {
                self.apply_batch(frame.snapshot_id, ops);
            }
            JournalRecord::Gc => self.prune(frame.snapshot_id),
            JournalRecord::Checkpoint {
                ddl_snapshot_id,
                gc_snapshot_id,
            } => {
                self.ddl_snapshot = self.ddl_snapshot.max(*ddl_snapshot_id);
                self.gc_snapshot = self.gc_snapshot.max(*gc_snapshot_id);
                self.durable_snapshot = self.durable_snapshot.max(frame.snapshot_id);
            }
        }
    }

    /// Applies one batch; returns whether it carried schema operations.
    fn apply_batch(&mut self, snapshot_id: SnapshotId, ops: &OperationBatch) -> bool {
        let mut has_ddl = false;
        for op in ops {
            if let Some(kind) = op.op_type.entity_kind() {
                let value = (!op.op_type.is_delete()).then(|| op.payload.clone());
                self.put_version((kind, op.partition_key), snapshot_id, value);
                continue;
            }
            let name = String::from_utf8_lossy(&op.payload).into_owned();
            match op.op_type {
                OperationType::CreateVertexType => {
                    self.vertex_types.insert(name);
                }
                OperationType::CreateEdgeType => {
                    self.edge_types.insert(name);
                }
                OperationType::DropVertexType => {
                    self.vertex_types.remove(&name);
                }
                OperationType::DropEdgeType => {
                    self.edge_types.remove(&name);
                }
                OperationType::AddEdgeKind => {
                    self.edge_kinds.insert(name);
                }
                OperationType::RemoveEdgeKind => {
                    self.edge_kinds.remove(&name);
                }
                OperationType::PrepareDataLoad => {
                    self.pending_loads.insert(name);
                }
                OperationType::CommitDataLoad => {
                    self.pending_loads.remove(&name);
                }
                _ => {}
            }
            if op.op_type.is_ddl() {
                has_ddl = true;
                self.ddl_snapshot = self.ddl_snapshot.max(snapshot_id);
            }
        }
        self.durable_snapshot = self.durable_snapshot.max(snapshot_id);
        has_ddl
    }

    /// A version written twice at the same snapshot is replaced, so replays
    /// converge on the same state.
    fn put_version(&mut self, key: EntityKey, snapshot_id: SnapshotId, value: Option<Vec<u8>>) {
        let versions = self.entities.entry(key).or_default();
        match versions.binary_search_by_key(&snapshot_id, |v| v.snapshot_id) {
            Ok(idx) => versions[idx].value = value,
            Err(idx) => versions.insert(idx, Version { snapshot_id, value }),
        }
    }

    fn get(&self, key: &EntityKey, snapshot_id: SnapshotId) -> Option<&[u8]> {
        self.entities
            .get(key)?
            .iter()
            .rev()
            .find(|v| v.snapshot_id <= snapshot_id)?
            .value
            .as_deref()
    }

    fn prune(&mut self, snapshot_id: SnapshotId) {
        self.gc_snapshot = self.gc_snapshot.max(snapshot_id);
        self.entities.retain(|_, versions| {
            if let Some(idx) = versions.iter().rposition(|v| v.snapshot_id <= snapshot_id) {
                let keep_from = if versions[idx].value.is_none() {
                    idx + 1
                } else {
                    idx
                };
                versions.drain(..keep_from);
            }
            !versions.is_empty()
        });
    }

    /// Minimal frame sequence that rebuilds this state.
    fn to_frames(&self) -> Vec<JournalFrame> {
        let mut frames = Vec::new();
        let schema: OperationBatch = self
            .vertex_types
            .iter()
            .map(|name| (OperationType::CreateVertexType, name))
            .chain(
                self.edge_types
                    .iter()
                    .map(|name| (OperationType::CreateEdgeType, name)),
            )
            .chain(self.edge_kinds.iter().map(|name| (OperationType::AddEdgeKind, name)))
            .chain(
                self.pending_loads
                    .iter()
                    .map(|name| (OperationType::PrepareDataLoad, name)),
            )
            .map(|(op_type, name)| OperationBlob::broadcast(op_type, name.as_bytes().to_vec()))
            .collect();
        if !schema.is_empty() {
            frames.push(JournalFrame::batch(self.ddl_snapshot, schema));
        }

        let mut by_snapshot: BTreeMap<SnapshotId, OperationBatch> = BTreeMap::new();
        for ((kind, key), versions) in &self.entities {
            for version in versions {
                let op_type = match (kind, &version.value) {
                    (EntityKind::Vertex, Some(_)) => OperationType::OverwriteVertex,
                    (EntityKind::Vertex, None) => OperationType::DeleteVertex,
                    (EntityKind::Edge, Some(_)) => OperationType::OverwriteEdge,
                    (EntityKind::Edge, None) => OperationType::DeleteEdge,
                };
                by_snapshot
                    .entry(version.snapshot_id)
                    .or_insert_with(|| OperationBatch::new(Vec::new()))
                    .push(OperationBlob::new(
                        op_type,
                        *key,
                        version.value.clone().unwrap_or_default(),
                    ));
            }
        }
        frames.extend(
            by_snapshot
                .into_iter()
                .map(|(snapshot_id, ops)| JournalFrame::batch(snapshot_id, ops)),
        );
        frames.push(JournalFrame {
            snapshot_id: self.durable_snapshot,
            record: JournalRecord::Checkpoint {
                ddl_snapshot_id: self.ddl_snapshot,
                gc_snapshot_id: self.gc_snapshot,
            },
        });
        frames
    }
}

enum Backend {
    /// Owns the journal; `None` until recovered.
    Primary { journal: Option<Journal> },
    /// Tails another node's journal read-only.
    Secondary {
        primary_journal: PathBuf,
        generation: Option<u32>,
        tail: u64,
    },
    Closed,
}

/// Multi-version key/value partition persisted as an append-only journal.
///
/// Every entity keeps one version per snapshot it was written at, so reads
/// can ask for any snapshot not yet garbage collected. In secondary mode the
/// partition never writes to disk; it follows the primary's journal and keeps
/// schema operations from the log in memory.
pub struct KvPartition {
    id: PartitionId,
    dir: PathBuf,
    sync_writes: bool,
    state: PartitionState,
    backend: Backend,
}

impl KvPartition {
    /// Opens a primary partition stored under `dir`.
    pub fn open(id: PartitionId, dir: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            id,
            dir,
            sync_writes,
            state: PartitionState::new(),
            backend: Backend::Primary { journal: None },
        })
    }

    /// Opens a replica of the primary partition stored under `primary_dir`.
    pub fn open_secondary(
        id: PartitionId,
        dir: impl AsRef<Path>,
        primary_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            id,
            dir,
            sync_writes: false,
            state: PartitionState::new(),
            backend: Backend::Secondary {
                primary_journal: primary_dir.as_ref().join(JOURNAL_FILE_NAME),
                generation: None,
                tail: FILE_HEADER_LEN as u64,
            },
        })
    }

    /// Highest snapshot applied.
    pub fn durable_snapshot_id(&self) -> SnapshotId {
        self.state.durable_snapshot
    }

    /// Highest snapshot that changed the schema.
    pub fn ddl_snapshot_id(&self) -> SnapshotId {
        self.state.ddl_snapshot
    }

    /// Highest snapshot garbage collected.
    pub fn gc_snapshot_id(&self) -> SnapshotId {
        self.state.gc_snapshot
    }

    /// Value of an entity as of `snapshot_id`.
    pub fn get(&self, kind: EntityKind, key: i64, snapshot_id: SnapshotId) -> Option<Vec<u8>> {
        self.state.get(&(kind, key), snapshot_id).map(<[u8]>::to_vec)
    }

    /// Latest value of an entity.
    pub fn get_latest(&self, kind: EntityKind, key: i64) -> Option<Vec<u8>> {
        self.get(kind, key, SnapshotId::MAX)
    }

    /// Number of stored versions of an entity, tombstones included.
    pub fn version_count(&self, kind: EntityKind, key: i64) -> usize {
        self.state.entities.get(&(kind, key)).map_or(0, Vec::len)
    }

    /// Number of entities whose latest version is live.
    pub fn live_entity_count(&self) -> usize {
        self.state
            .entities
            .values()
            .filter(|versions| versions.last().is_some_and(|v| v.value.is_some()))
            .count()
    }

    /// Registered vertex types.
    pub fn vertex_types(&self) -> Vec<String> {
        self.state.vertex_types.iter().cloned().collect()
    }

    /// Registered edge types.
    pub fn edge_types(&self) -> Vec<String> {
        self.state.edge_types.iter().cloned().collect()
    }

    /// Registered edge kinds.
    pub fn edge_kinds(&self) -> Vec<String> {
        self.state.edge_kinds.iter().cloned().collect()
    }

    /// Bulk loads prepared but not yet committed.
    pub fn pending_loads(&self) -> Vec<String> {
        self.state.pending_loads.iter().cloned().collect()
    }

    /// Returns `true` for replicas.
    pub fn is_secondary(&self) -> bool {
        matches!(self.backend, Backend::Secondary { .. })
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE_NAME)
    }

    fn catch_up(&mut self) -> Result<usize> {
        let id = self.id;
        let Backend::Secondary {
            primary_journal,
            generation,
            tail,
        } = &mut self.backend
        else {
            return Err(StoreError::NotSecondary);
        };
        let io = match StdFileIo::open_read_only(&*primary_journal) {
            Ok(io) => io,
            Err(StoreError::MissingFile(path)) => {
                debug!(partition = %id, path = %path.display(), "partition.catchup.no_primary");
                return Ok(0);
            }
            Err(err) => return Err(err),
        };
        let Some(header) = read_header(&io)? else {
            return Ok(0);
        };
        if header.partition != id {
            return Err(StoreError::partition(
                id,
                format!("primary journal belongs to partition {}", header.partition),
            ));
        }
        if *generation != Some(header.generation) {
            if generation.is_some() {
                info!(partition = %id, generation = header.generation, "partition.catchup.reload");
            }
            self.state = PartitionState::new();
            *generation = Some(header.generation);
            *tail = FILE_HEADER_LEN as u64;
        }
        let scan = read_frames(&io, *tail)?;
        for frame in &scan.frames {
            self.state.apply(frame);
        }
        *tail = scan.valid_up_to;
        Ok(scan.frames.len())
    }
}

fn closed(id: PartitionId) -> StoreError {
    StoreError::partition(id, "partition is closed")
}

fn not_recovered(id: PartitionId) -> StoreError {
    StoreError::partition(id, "partition has not been recovered")
}

impl GraphPartition for KvPartition {
    fn id(&self) -> PartitionId {
        self.id
    }

    fn write_batch(&mut self, snapshot_id: SnapshotId, ops: &OperationBatch) -> Result<bool> {
        match &mut self.backend {
            Backend::Primary { journal: Some(journal) } => {
                journal.append(&JournalFrame::batch(snapshot_id, ops.clone()))?;
            }
            Backend::Primary { journal: None } => return Err(not_recovered(self.id)),
            Backend::Secondary { .. } => {}
            Backend::Closed => return Err(closed(self.id)),
        }
        Ok(self.state.apply_batch(snapshot_id, ops))
    }

    fn recover(&mut self) -> Result<SnapshotId> {
        match self.backend {
            Backend::Closed => return Err(closed(self.id)),
            Backend::Secondary { .. } => {
                self.catch_up()?;
            }
            Backend::Primary { .. } => {
                let (journal, frames) =
                    Journal::open(&self.journal_path(), self.id, self.sync_writes)?;
                let mut state = PartitionState::new();
                for frame in &frames {
                    state.apply(frame);
                }
                info!(
                    partition = %self.id,
                    snapshot = state.durable_snapshot,
                    frames = frames.len(),
                    generation = journal.header().generation,
                    "partition.recovered"
                );
                self.state = state;
                self.backend = Backend::Primary {
                    journal: Some(journal),
                };
            }
        }
        Ok(self.state.durable_snapshot)
    }

    fn ingest_external_file(&mut self, local_file: &Path) -> Result<()> {
        let id = self.id;
        let journal = match &mut self.backend {
            Backend::Primary { journal: Some(journal) } => journal,
            Backend::Primary { journal: None } => return Err(not_recovered(self.id)),
            Backend::Secondary { .. } => {
                return Err(StoreError::partition(
                    id,
                    "secondary partitions do not ingest bulk files",
                ))
            }
            Backend::Closed => return Err(closed(self.id)),
        };
        let io = StdFileIo::open_read_only(local_file)?;
        let header = read_header(&io)?.ok_or_else(|| {
            StoreError::corruption(format!("{}: bulk file too short", local_file.display()))
        })?;
        if header.partition != id {
            return Err(StoreError::partition(
                id,
                format!(
                    "{} was built for partition {}",
                    local_file.display(),
                    header.partition
                ),
            ));
        }
        let scan = read_frames(&io, FILE_HEADER_LEN as u64)?;
        if scan.valid_up_to != io.len()? {
            return Err(StoreError::corruption(format!(
                "{}: truncated bulk file",
                local_file.display()
            )));
        }
        journal.append_all(&scan.frames)?;
        for frame in &scan.frames {
            self.state.apply(frame);
        }
        info!(partition = %id, frames = scan.frames.len(), file = %local_file.display(), "partition.ingested");
        Ok(())
    }

    fn garbage_collect(&mut self, snapshot_id: SnapshotId) -> Result<()> {
        if snapshot_id <= self.state.gc_snapshot {
            return Ok(());
        }
        match &mut self.backend {
            Backend::Primary { journal: Some(journal) } => {
                journal.append(&JournalFrame {
                    snapshot_id,
                    record: JournalRecord::Gc,
                })?;
            }
            Backend::Primary { journal: None } => return Err(not_recovered(self.id)),
            Backend::Secondary { .. } => {}
            Backend::Closed => return Err(closed(self.id)),
        }
        self.state.prune(snapshot_id);
        debug!(partition = %self.id, snapshot = snapshot_id, "partition.gc");
        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        let path = self.journal_path();
        let frames = self.state.to_frames();
        let sync = self.sync_writes;
        match &mut self.backend {
            Backend::Primary { journal: Some(journal) } => {
                let header = JournalHeader {
                    generation: journal.header().generation.wrapping_add(1),
                    ..journal.header()
                };
                let before = journal.len();
                *journal = Journal::rewrite(&path, header, &frames, sync)?;
                info!(
                    partition = %self.id,
                    generation = header.generation,
                    bytes_before = before,
                    bytes_after = journal.len(),
                    "partition.compacted"
                );
                Ok(())
            }
            Backend::Primary { journal: None } => Err(not_recovered(self.id)),
            Backend::Secondary { .. } => Ok(()),
            Backend::Closed => Err(closed(self.id)),
        }
    }

    fn try_catch_up_with_primary(&mut self) -> Result<()> {
        let applied = self.catch_up()?;
        if applied > 0 {
            debug!(partition = %self.id, frames = applied, "partition.catchup.applied");
        }
        Ok(())
    }

    fn data_dir(&self) -> Option<&Path> {
        Some(&self.dir)
    }

    fn close(&mut self) -> Result<()> {
        if let Backend::Primary { journal: Some(journal) } = &self.backend {
            journal.sync()?;
        }
        self.backend = Backend::Closed;
        Ok(())
    }
}

/// Opens [`KvPartition`]s under a node's data directory.
#[derive(Clone, Debug)]
pub struct KvPartitionFactory {
    data_dir: PathBuf,
    sync_writes: bool,
    primary_data_dir: Option<PathBuf>,
}

impl KvPartitionFactory {
    /// Factory for a primary node.
    pub fn primary(data_dir: impl Into<PathBuf>, sync_writes: bool) -> Self {
        Self {
            data_dir: data_dir.into(),
            sync_writes,
            primary_data_dir: None,
        }
    }

    /// Factory for a secondary node following `primary_data_dir`.
    pub fn secondary(data_dir: impl Into<PathBuf>, primary_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sync_writes: false,
            primary_data_dir: Some(primary_data_dir.into()),
        }
    }

    /// Factory matching the node's role.
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        match (config.role, &config.primary_data_dir) {
            (NodeRole::Primary, _) => Ok(Self::primary(&config.data_dir, config.sync_writes)),
            (NodeRole::Secondary, Some(primary)) => Ok(Self::secondary(&config.data_dir, primary)),
            (NodeRole::Secondary, None) => Err(StoreError::invalid(
                "secondary nodes require primary_data_dir",
            )),
        }
    }
}

impl PartitionFactory for KvPartitionFactory {
    fn open(&self, id: PartitionId) -> Result<Box<dyn GraphPartition>> {
        let dir = partition_dir(&self.data_dir, id);
        let partition = match &self.primary_data_dir {
            None => KvPartition::open(id, dir, self.sync_writes)?,
            Some(primary) => KvPartition::open_secondary(id, dir, partition_dir(primary, id))?,
        };
        Ok(Box::new(partition))
    }
}
