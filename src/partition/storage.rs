use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::debug;

use crate::types::{Result, StoreError};

/// Remote file store holding bulk-load output.
pub trait ExternalStorage: Send + Sync {
    /// Copies `remote` to `local`, replacing any existing file.
    fn download(&self, remote: &Path, local: &Path) -> Result<()>;
}

/// Treats "remote" paths as paths on a locally mounted filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFsStorage;

impl ExternalStorage for LocalFsStorage {
    fn download(&self, remote: &Path, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = fs::copy(remote, local).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::MissingFile(remote.to_path_buf())
            } else {
                StoreError::from(err)
            }
        })?;
        debug!(remote = %remote.display(), local = %local.display(), bytes, "storage.download");
        Ok(())
    }
}
