mod blocks;
mod delete;

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use stowage_types::block_hash::{BlockHash, HashAlgorithm};
use stowage_types::error::{Result, StowageError};
use stowage_types::volume_id::VolumeId;

pub use self::blocks::{BlockUse, VolumeUsage};
use crate::volume::VolumeKind;

/// Lifecycle of a remote volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeState {
    /// Writer opened locally; nothing confirmed remotely yet.
    Temporary,
    /// Upload confirmed by the transfer pipeline.
    Uploaded,
    /// Seen with the expected size in a remote listing.
    Verified,
    /// Scheduled for removal.
    Deleting,
    /// Remote delete confirmed.
    Deleted,
}

impl VolumeState {
    /// Whether the volume can be relied on to hold its blocks.
    pub fn is_live(self) -> bool {
        matches!(self, VolumeState::Uploaded | VolumeState::Verified)
    }

    /// Whether the volume is on its way out.
    pub fn is_leaving(self) -> bool {
        matches!(self, VolumeState::Deleting | VolumeState::Deleted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVolumeRecord {
    pub id: VolumeId,
    pub name: String,
    pub kind: VolumeKind,
    pub state: VolumeState,
    /// Remote size in bytes, `-1` until known.
    pub size: i64,
    pub hash: Option<BlockHash>,
}

/// A referenced block and the volume that holds its primary copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub size: u32,
    pub volume_id: VolumeId,
    pub refcount: u32,
}

/// A stored block nothing references any more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedBlock {
    pub hash: BlockHash,
    pub size: u32,
    pub volume_id: VolumeId,
}

/// Block layout of one file's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksetRecord {
    pub length: u64,
    pub blocks: Vec<BlockHash>,
    /// One hash per group of `hashes_per_block` entries of `blocks`.
    pub blocklists: Vec<BlockHash>,
    pub refcount: u32,
}

/// Block layout the stored blocksets were cut with. Blocklist grouping
/// depends on it, so it cannot change over the life of a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSettings {
    pub blocksize: u64,
    pub block_hash: HashAlgorithm,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogState {
    next_volume_id: i64,
    volumes: BTreeMap<VolumeId, RemoteVolumeRecord>,
    /// `(index volume, block volume)` pairs.
    index_links: BTreeSet<(VolumeId, VolumeId)>,
    blocks: BTreeMap<BlockHash, BlockRecord>,
    /// Extra copies of live blocks, keyed by the volume holding the copy.
    duplicates: BTreeSet<(BlockHash, VolumeId)>,
    deleted_blocks: Vec<DeletedBlock>,
    blocksets: BTreeMap<BlockHash, BlocksetRecord>,
    terminated_with_active_uploads: bool,
    #[serde(default)]
    block_settings: Option<BlockSettings>,
}

/// Local record of every remote volume and the blocks it holds.
///
/// Mutations go to a working copy; `commit` persists it and `rollback`
/// returns to the last committed state.
pub struct Catalog {
    path: Option<PathBuf>,
    committed: CatalogState,
    state: CatalogState,
}

impl Catalog {
    /// A catalog that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            committed: CatalogState::default(),
            state: CatalogState::default(),
        }
    }

    /// Load the catalog at `path`, or start an empty one if it does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        let committed = match std::fs::read(path) {
            Ok(data) => rmp_serde::from_slice::<CatalogState>(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogState::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            path = %path.display(),
            volumes = committed.volumes.len(),
            blocks = committed.blocks.len(),
            "catalog opened"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: committed.clone(),
            committed,
        })
    }

    /// Persist the working copy.
    pub fn commit(&mut self, label: &str) -> Result<()> {
        if let Some(path) = &self.path {
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            std::fs::create_dir_all(&dir)?;
            let bytes = rmp_serde::to_vec(&self.state)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(path).map_err(|e| e.error)?;
        }
        self.committed = self.state.clone();
        debug!(label, "catalog committed");
        Ok(())
    }

    /// Discard every change since the last commit.
    pub fn rollback(&mut self) {
        self.state = self.committed.clone();
        debug!("catalog rolled back");
    }

    // --- Remote volumes ---

    pub fn register_remote_volume(
        &mut self,
        name: &str,
        kind: VolumeKind,
        state: VolumeState,
    ) -> Result<VolumeId> {
        if self
            .state
            .volumes
            .values()
            .any(|v| v.name == name && v.state != VolumeState::Deleted)
        {
            return Err(StowageError::Consistency(format!(
                "remote volume '{name}' is already registered"
            )));
        }
        self.state.next_volume_id += 1;
        let id = VolumeId(self.state.next_volume_id);
        self.state.volumes.insert(
            id,
            RemoteVolumeRecord {
                id,
                name: name.to_string(),
                kind,
                state,
                size: -1,
                hash: None,
            },
        );
        Ok(id)
    }

    /// Drop a volume and everything that points at it.
    ///
    /// Live blocks whose primary copy is in this volume move to another
    /// copy; if none exists the removal is refused.
    pub fn remove_remote_volume(&mut self, name: &str) -> Result<()> {
        let id = self.remote_volume_id(name)?;
        self.relocate_blocks_from(id, &[id])?;
        self.state.volumes.remove(&id);
        self.forget_volume_contents(id);
        self.state
            .index_links
            .retain(|(index, block)| *index != id && *block != id);
        Ok(())
    }

    pub fn update_remote_volume(
        &mut self,
        name: &str,
        state: VolumeState,
        size: i64,
        hash: Option<BlockHash>,
    ) -> Result<()> {
        let id = self.remote_volume_id(name)?;
        if let Some(record) = self.state.volumes.get_mut(&id) {
            record.state = state;
            record.size = size;
            record.hash = hash;
        }
        if state == VolumeState::Deleted {
            self.state
                .index_links
                .retain(|(index, block)| *index != id && *block != id);
        }
        Ok(())
    }

    /// Change only the state of a volume, keeping size and hash.
    pub fn set_volume_state(&mut self, name: &str, state: VolumeState) -> Result<()> {
        let record = self.remote_volume(name).cloned().ok_or_else(|| {
            StowageError::VolumeNotFound(name.to_string())
        })?;
        self.update_remote_volume(name, state, record.size, record.hash)
    }

    pub fn add_index_block_link(&mut self, index_id: VolumeId, block_id: VolumeId) -> Result<()> {
        for (id, kind) in [(index_id, VolumeKind::Index), (block_id, VolumeKind::Blocks)] {
            match self.state.volumes.get(&id) {
                Some(v) if v.kind == kind => {}
                Some(v) => {
                    return Err(StowageError::Consistency(format!(
                        "volume '{}' is not a {kind} volume",
                        v.name
                    )))
                }
                None => return Err(StowageError::VolumeNotFound(id.to_string())),
            }
        }
        self.state.index_links.insert((index_id, block_id));
        Ok(())
    }

    /// Volumes whose state is in `states`; every volume when `states` is empty.
    pub fn remote_volumes(&self, states: &[VolumeState]) -> Vec<RemoteVolumeRecord> {
        self.state
            .volumes
            .values()
            .filter(|v| states.is_empty() || states.contains(&v.state))
            .cloned()
            .collect()
    }

    pub fn remote_volume(&self, name: &str) -> Option<&RemoteVolumeRecord> {
        self.state
            .volumes
            .values()
            .filter(|v| v.name == name)
            .max_by_key(|v| v.state != VolumeState::Deleted)
    }

    pub fn remote_volume_id(&self, name: &str) -> Result<VolumeId> {
        self.remote_volume(name)
            .map(|v| v.id)
            .ok_or_else(|| StowageError::VolumeNotFound(name.to_string()))
    }

    /// Index volumes linked to `block_id`.
    pub fn index_volumes_for(&self, block_id: VolumeId) -> Vec<VolumeId> {
        self.state
            .index_links
            .iter()
            .filter(|(_, block)| *block == block_id)
            .map(|(index, _)| *index)
            .collect()
    }

    // --- Block settings ---

    pub fn block_settings(&self) -> Option<BlockSettings> {
        self.state.block_settings
    }

    /// Check `settings` against the ones recorded in the catalog. A catalog
    /// without recorded settings adopts `settings`; they are persisted with
    /// the next commit.
    pub fn verify_block_settings(&mut self, settings: BlockSettings) -> Result<()> {
        match self.state.block_settings {
            None => {
                debug!(
                    blocksize = settings.blocksize,
                    block_hash = %settings.block_hash,
                    "recording block settings"
                );
                self.state.block_settings = Some(settings);
                Ok(())
            }
            Some(recorded) if recorded.blocksize != settings.blocksize => {
                Err(StowageError::Config(format!(
                    "blocksize is {} but the catalog was built with {}; blocksize cannot change",
                    settings.blocksize, recorded.blocksize
                )))
            }
            Some(recorded) if recorded.block_hash != settings.block_hash => {
                Err(StowageError::Config(format!(
                    "block hash is {} but the catalog was built with {}; block hash cannot change",
                    settings.block_hash, recorded.block_hash
                )))
            }
            Some(_) => Ok(()),
        }
    }

    // --- Crash-safety flag ---

    /// Set while a compaction may have uploads the catalog has not committed.
    pub fn terminated_with_active_uploads(&self) -> bool {
        self.state.terminated_with_active_uploads
    }

    pub fn set_terminated_with_active_uploads(&mut self, value: bool) {
        self.state.terminated_with_active_uploads = value;
    }

    /// Drop duplicate and deleted-block entries held by `id`.
    fn forget_volume_contents(&mut self, id: VolumeId) {
        self.state.duplicates.retain(|(_, v)| *v != id);
        self.state.deleted_blocks.retain(|b| b.volume_id != id);
    }
}
