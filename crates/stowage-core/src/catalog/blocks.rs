use std::collections::{BTreeMap, HashSet};

use stowage_types::block_hash::BlockHash;
use stowage_types::error::{Result, StowageError};
use stowage_types::volume_id::VolumeId;

use super::{BlockRecord, BlocksetRecord, Catalog, DeletedBlock};
use crate::volume::VolumeKind;

/// What a stored copy of a block means for a volume about to be repacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockUse {
    /// Referenced, and no copy survives outside the volumes being replaced.
    Needed,
    /// Referenced, but another surviving volume already holds it.
    SatisfiedElsewhere,
    /// Not referenced by any blockset (or a different block with the same hash).
    Unreferenced,
}

/// Per block-volume figures for the compaction planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeUsage {
    pub id: VolumeId,
    pub name: String,
    /// Remote size of the volume.
    pub size: u64,
    /// Bytes of referenced blocks whose primary copy lives here.
    pub active_bytes: u64,
    /// Bytes of unreferenced blocks and redundant copies.
    pub wasted_bytes: u64,
    pub live_blocks: usize,
}

impl Catalog {
    /// Record a newly stored block. Returns `false` if the hash is already
    /// referenced, in which case nothing changes.
    pub fn register_block(&mut self, hash: &BlockHash, size: u32, volume_id: VolumeId) -> Result<bool> {
        if !self.state.volumes.contains_key(&volume_id) {
            return Err(StowageError::VolumeNotFound(volume_id.to_string()));
        }
        if self.state.blocks.contains_key(hash) {
            return Ok(false);
        }
        self.state.blocks.insert(
            hash.clone(),
            BlockRecord {
                size,
                volume_id,
                refcount: 0,
            },
        );
        Ok(true)
    }

    pub fn block(&self, hash: &BlockHash) -> Option<&BlockRecord> {
        self.state.blocks.get(hash)
    }

    /// Number of referenced blocks.
    pub fn live_block_count(&self) -> usize {
        self.state.blocks.len()
    }

    /// Every volume holding a copy of `hash`, primary first.
    pub fn block_holders(&self, hash: &BlockHash) -> Vec<VolumeId> {
        let mut holders = Vec::new();
        if let Some(block) = self.state.blocks.get(hash) {
            holders.push(block.volume_id);
        }
        holders.extend(
            self.state
                .duplicates
                .iter()
                .filter(|(h, _)| h == hash)
                .map(|(_, v)| *v),
        );
        holders
    }

    pub fn deleted_blocks(&self) -> &[DeletedBlock] {
        &self.state.deleted_blocks
    }

    /// Register (or add a reference to) the layout of a file's content.
    ///
    /// Every hash in `blocks` and `blocklists` must already be registered.
    pub fn register_blockset(
        &mut self,
        full_hash: &BlockHash,
        length: u64,
        blocks: Vec<BlockHash>,
        blocklists: Vec<BlockHash>,
    ) -> Result<()> {
        if let Some(existing) = self.state.blocksets.get_mut(full_hash) {
            existing.refcount += 1;
            return Ok(());
        }
        if let Some(missing) = blocks
            .iter()
            .chain(blocklists.iter())
            .find(|h| !self.state.blocks.contains_key(*h))
        {
            return Err(StowageError::BlockNotFound(missing.to_base64()));
        }
        for hash in blocks.iter().chain(blocklists.iter()) {
            if let Some(block) = self.state.blocks.get_mut(hash) {
                block.refcount += 1;
            }
        }
        self.state.blocksets.insert(
            full_hash.clone(),
            BlocksetRecord {
                length,
                blocks,
                blocklists,
                refcount: 1,
            },
        );
        Ok(())
    }

    /// Drop one reference to a blockset. Blocks left without references move
    /// to the deleted set together with their redundant copies. Returns the
    /// number of blocks that became unreferenced.
    pub fn release_blockset(&mut self, full_hash: &BlockHash) -> Result<usize> {
        let record = self
            .state
            .blocksets
            .get_mut(full_hash)
            .ok_or_else(|| StowageError::BlockNotFound(full_hash.to_base64()))?;
        record.refcount = record.refcount.saturating_sub(1);
        if record.refcount > 0 {
            return Ok(0);
        }
        let Some(record) = self.state.blocksets.remove(full_hash) else {
            return Ok(0);
        };

        let mut released = 0;
        for hash in record.blocks.iter().chain(record.blocklists.iter()) {
            let Some(block) = self.state.blocks.get_mut(hash) else {
                continue;
            };
            block.refcount = block.refcount.saturating_sub(1);
            if block.refcount > 0 {
                continue;
            }
            if let Some(block) = self.state.blocks.remove(hash) {
                released += 1;
                self.state.deleted_blocks.push(DeletedBlock {
                    hash: hash.clone(),
                    size: block.size,
                    volume_id: block.volume_id,
                });
                let copies: Vec<VolumeId> = self
                    .state
                    .duplicates
                    .iter()
                    .filter(|(h, _)| h == hash)
                    .map(|(_, v)| *v)
                    .collect();
                for volume_id in copies {
                    self.state.duplicates.remove(&(hash.clone(), volume_id));
                    self.state.deleted_blocks.push(DeletedBlock {
                        hash: hash.clone(),
                        size: block.size,
                        volume_id,
                    });
                }
            }
        }
        Ok(released)
    }

    /// Classify the copy of `hash` stored in `volume_id` while the volumes
    /// in `leaving` are being replaced.
    pub fn block_disposition(
        &self,
        hash: &BlockHash,
        size: u32,
        volume_id: VolumeId,
        leaving: &HashSet<VolumeId>,
    ) -> BlockUse {
        let Some(block) = self.state.blocks.get(hash) else {
            return BlockUse::Unreferenced;
        };
        if block.size != size {
            return BlockUse::Unreferenced;
        }
        let holds_copy = block.volume_id == volume_id
            || self.state.duplicates.contains(&(hash.clone(), volume_id));
        if !holds_copy {
            return BlockUse::Unreferenced;
        }
        let survives_elsewhere = self
            .block_holders(hash)
            .into_iter()
            .any(|v| v != volume_id && !leaving.contains(&v) && self.volume_survives(v));
        if survives_elsewhere {
            BlockUse::SatisfiedElsewhere
        } else {
            BlockUse::Needed
        }
    }

    /// Whether the copy in `volume_id` must be carried into a new volume.
    pub fn use_block(
        &self,
        hash: &BlockHash,
        size: u32,
        volume_id: VolumeId,
        leaving: &HashSet<VolumeId>,
    ) -> bool {
        self.block_disposition(hash, size, volume_id, leaving) == BlockUse::Needed
    }

    /// Record that `volume_id` now holds an extra copy of a referenced block.
    pub fn register_duplicated_block(
        &mut self,
        hash: &BlockHash,
        size: u32,
        volume_id: VolumeId,
    ) -> Result<()> {
        let block = self
            .state
            .blocks
            .get(hash)
            .ok_or_else(|| StowageError::BlockNotFound(hash.to_base64()))?;
        if block.size != size {
            return Err(StowageError::SizeMismatch {
                hash: hash.to_base64(),
                expected: block.size as u64,
                actual: size as u64,
            });
        }
        if block.volume_id != volume_id {
            self.state.duplicates.insert((hash.clone(), volume_id));
        }
        Ok(())
    }

    /// Blocklists whose own block is stored in `volume_id`, as
    /// `(blocklist hash, concatenated child hashes)`.
    pub fn blocklists(
        &self,
        volume_id: VolumeId,
        hashes_per_block: usize,
    ) -> Vec<(BlockHash, Vec<u8>)> {
        let hashes_per_block = hashes_per_block.max(1);
        let mut found: BTreeMap<BlockHash, Vec<u8>> = BTreeMap::new();
        for blockset in self.state.blocksets.values() {
            for (chunk, blocklist_hash) in blockset
                .blocks
                .chunks(hashes_per_block)
                .zip(blockset.blocklists.iter())
            {
                if found.contains_key(blocklist_hash) {
                    continue;
                }
                if !self.block_holders(blocklist_hash).contains(&volume_id) {
                    continue;
                }
                let data = chunk.iter().flat_map(|h| h.as_bytes().iter().copied()).collect();
                found.insert(blocklist_hash.clone(), data);
            }
        }
        found.into_iter().collect()
    }

    /// Usage figures for every live block volume, in id order.
    pub fn volume_usage(&self) -> Vec<VolumeUsage> {
        let mut usage: BTreeMap<VolumeId, VolumeUsage> = self
            .state
            .volumes
            .values()
            .filter(|v| v.kind == VolumeKind::Blocks && v.state.is_live())
            .map(|v| {
                (
                    v.id,
                    VolumeUsage {
                        id: v.id,
                        name: v.name.clone(),
                        size: v.size.max(0) as u64,
                        active_bytes: 0,
                        wasted_bytes: 0,
                        live_blocks: 0,
                    },
                )
            })
            .collect();

        for block in self.state.blocks.values() {
            if let Some(u) = usage.get_mut(&block.volume_id) {
                u.active_bytes += block.size as u64;
                u.live_blocks += 1;
            }
        }
        for (hash, volume_id) in &self.state.duplicates {
            if let (Some(u), Some(block)) = (usage.get_mut(volume_id), self.state.blocks.get(hash)) {
                u.wasted_bytes += block.size as u64;
            }
        }
        for deleted in &self.state.deleted_blocks {
            if let Some(u) = usage.get_mut(&deleted.volume_id) {
                u.wasted_bytes += deleted.size as u64;
            }
        }
        usage.into_values().collect()
    }

    /// A copy counts as surviving unless its volume is being removed.
    fn volume_survives(&self, id: VolumeId) -> bool {
        self.state
            .volumes
            .get(&id)
            .is_some_and(|v| !v.state.is_leaving())
    }
}
