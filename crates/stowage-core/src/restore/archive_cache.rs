use std::fs::File;
use std::io::BufReader;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use tracing::debug;

use stowage_types::block_hash::BlockHash;
use stowage_types::error::{Result, StowageError};

use crate::compress::Compression;
use crate::volume::BlockVolumeReader;

/// Open block volumes kept by one restore run.
pub const MAX_OPEN_ARCHIVES: usize = 20;

type Archive = BlockVolumeReader<BufReader<File>>;

/// Bounded set of open block volumes, evicting the least recently used.
///
/// Owned by a single restore; not shared between threads.
pub struct ArchiveCache {
    folder: PathBuf,
    archives: LruCache<String, Archive>,
    opened: u64,
}

impl ArchiveCache {
    /// Cache over the volumes in `folder` holding [`MAX_OPEN_ARCHIVES`] open.
    pub fn new(folder: &Path) -> Self {
        Self::with_capacity(folder, MAX_OPEN_ARCHIVES)
    }

    pub fn with_capacity(folder: &Path, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            folder: folder.to_path_buf(),
            archives: LruCache::new(capacity),
            opened: 0,
        }
    }

    /// Decode block `hash` from `volume` into `buf`.
    pub fn read_block(&mut self, volume: &str, hash: &BlockHash, buf: &mut Vec<u8>) -> Result<usize> {
        if !self.archives.contains(volume) {
            let archive = self.open(volume)?;
            if let Some((evicted, _)) = self.archives.push(volume.to_string(), archive) {
                debug!(volume = %evicted, "closed least recently used archive");
            }
        }
        let archive = self
            .archives
            .get_mut(volume)
            .ok_or_else(|| StowageError::VolumeNotFound(volume.to_string()))?;
        archive.read_block(hash, buf)
    }

    /// Number of archives currently open.
    pub fn open_count(&self) -> usize {
        self.archives.len()
    }

    /// Number of times an archive was opened, re-opens included.
    pub fn opened_total(&self) -> u64 {
        self.opened
    }

    pub fn is_open(&self, volume: &str) -> bool {
        self.archives.contains(volume)
    }

    fn open(&mut self, volume: &str) -> Result<Archive> {
        let path = Path::new(volume);
        let plain_name = path.file_name().is_some_and(|n| n == path.as_os_str());
        if !plain_name {
            return Err(StowageError::InvalidFormat(format!(
                "volume name '{volume}' is not a plain file name"
            )));
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| StowageError::UnknownCompression(String::new()))?;
        let compression = Compression::from_extension(ext)?;

        let file = match File::open(self.folder.join(volume)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StowageError::VolumeNotFound(volume.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let archive = BlockVolumeReader::open(BufReader::new(file), compression)?;
        self.opened += 1;
        debug!(volume = %volume, blocks = archive.block_count(), "opened archive");
        Ok(archive)
    }
}
