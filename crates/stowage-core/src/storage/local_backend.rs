use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use stowage_types::error::{Result, StowageError};

use crate::storage::StorageBackend;

/// Prefix of scratch files written during `put`; never listed.
const SCRATCH_PREFIX: &str = ".stowage-tmp";

/// A remote that is a flat directory of volume files.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Open (creating if needed) the directory at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            StowageError::Config(format!("cannot create remote folder '{}': {e}", root.display()))
        })?;
        let root = fs::canonicalize(root)?;
        debug!(root = %root.display(), "local remote opened");
        Ok(Self { root })
    }

    /// Volumes are stored flat, so a key must be a plain file name.
    fn path_of(&self, key: &str) -> Result<PathBuf> {
        let plain = !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(['/', '\\'])
            && !key.starts_with(SCRATCH_PREFIX);
        if !plain {
            return Err(StowageError::InvalidFormat(format!(
                "invalid remote file name: '{key}'"
            )));
        }
        Ok(self.root.join(key))
    }

    fn metadata(&self, key: &str) -> Result<Option<fs::Metadata>> {
        match fs::metadata(self.path_of(key)?) {
            Ok(meta) if meta.is_file() => Ok(Some(meta)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl StorageBackend for LocalBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_of(key)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Readers never see a partial volume: data is synced into a scratch
    /// file that is then renamed over `key`.
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let target = self.path_of(key)?;
        let mut scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempfile_in(&self.root)?;
        scratch.write_all(data)?;
        scratch.as_file().sync_all()?;
        scratch.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_of(key)?) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.metadata(key)?.is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with(prefix) && !name.starts_with(SCRATCH_PREFIX) {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.metadata(key)?.map(|m| m.len()))
    }
}
