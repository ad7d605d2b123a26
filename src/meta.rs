//! Local metadata store for small records such as the persisted queue offsets.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::types::{Result, StoreError};

/// Metadata key holding the JSON array of per-queue consumed offsets.
pub const QUEUE_OFFSETS_KEY: &str = "queue_offsets";

/// Durable key/value store for node metadata.
pub trait MetaStore: Send + Sync {
    /// Reads the value stored under `key`.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Replaces the value stored under `key`.
    fn write(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// One file per key inside a directory; writes go through a temp file that is
/// fsynced and atomically renamed over the previous value.
#[derive(Debug)]
pub struct FileMetaStore {
    dir: PathBuf,
}

impl FileMetaStore {
    /// Opens the store, creating `dir` if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(StoreError::invalid(format!("illegal metadata key `{key}`")));
        }
        Ok(self.dir.join(key))
    }
}

impl MetaStore for FileMetaStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let target = self.path_for(key)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(value)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|err| StoreError::Io(err.error))?;
        Ok(())
    }
}

/// Volatile metadata store.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryMetaStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemoryMetaStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
