use std::collections::{BTreeSet, HashSet};

use stowage_types::error::{Result, StowageError};
use stowage_types::volume_id::VolumeId;

use super::{Catalog, RemoteVolumeRecord, VolumeState};
use crate::volume::VolumeKind;

impl Catalog {
    /// Order a deletion batch so every index volume comes before the block
    /// volumes it describes.
    ///
    /// Index volumes whose block volumes are all in the batch are added even
    /// when the caller did not list them.
    pub fn reorder_deletable_volumes(
        &self,
        volumes: &[RemoteVolumeRecord],
    ) -> Vec<RemoteVolumeRecord> {
        let block_ids: HashSet<VolumeId> = volumes
            .iter()
            .filter(|v| v.kind == VolumeKind::Blocks)
            .map(|v| v.id)
            .collect();

        // Index volumes that become useless once the batch is gone.
        let mut orphaned: BTreeSet<VolumeId> = BTreeSet::new();
        for (index_id, _) in &self.state.index_links {
            let mut targets = self
                .state
                .index_links
                .iter()
                .filter(|(i, _)| i == index_id)
                .map(|(_, b)| b);
            if targets.all(|b| block_ids.contains(b)) {
                orphaned.insert(*index_id);
            }
        }

        let mut ordered: Vec<RemoteVolumeRecord> = Vec::with_capacity(volumes.len());
        let mut emitted: HashSet<VolumeId> = HashSet::new();
        let mut emit = |record: &RemoteVolumeRecord, ordered: &mut Vec<RemoteVolumeRecord>| {
            if emitted.insert(record.id) {
                ordered.push(record.clone());
            }
        };

        for volume in volumes {
            if volume.kind == VolumeKind::Blocks {
                for index_id in self.index_volumes_for(volume.id) {
                    let listed = volumes.iter().find(|v| v.id == index_id);
                    let cascaded = orphaned
                        .contains(&index_id)
                        .then(|| self.state.volumes.get(&index_id))
                        .flatten()
                        .filter(|v| v.state != VolumeState::Deleted);
                    if let Some(index) = listed.or(cascaded) {
                        emit(index, &mut ordered);
                    }
                }
            }
            emit(volume, &mut ordered);
        }
        ordered
    }

    /// Detach every block reference from `name` before it is deleted.
    ///
    /// Referenced blocks whose primary copy lives in the volume move to a
    /// copy outside `removing`. Fails without changes when a referenced
    /// block would lose its last copy.
    pub fn prepare_for_delete(&mut self, name: &str, removing: &[VolumeId]) -> Result<()> {
        let id = self.remote_volume_id(name)?;
        self.relocate_blocks_from(id, removing)?;
        self.forget_volume_contents(id);
        Ok(())
    }

    /// Move primary copies out of `id` onto surviving duplicates.
    pub(super) fn relocate_blocks_from(&mut self, id: VolumeId, removing: &[VolumeId]) -> Result<()> {
        let mut moves = Vec::new();
        for (hash, block) in &self.state.blocks {
            if block.volume_id != id {
                continue;
            }
            let target = self
                .state
                .duplicates
                .iter()
                .filter(|(h, v)| h == hash && *v != id && !removing.contains(v))
                .map(|(_, v)| *v)
                .find(|v| {
                    self.state
                        .volumes
                        .get(v)
                        .is_some_and(|r| !r.state.is_leaving())
                });
            match target {
                Some(target) => moves.push((hash.clone(), target)),
                None => {
                    let volume = self
                        .state
                        .volumes
                        .get(&id)
                        .map_or_else(|| id.to_string(), |v| v.name.clone());
                    return Err(StowageError::Consistency(format!(
                        "block {} would lose its last copy if volume '{volume}' is deleted",
                        hash.to_base64()
                    )));
                }
            }
        }
        for (hash, target) in moves {
            self.state.duplicates.remove(&(hash.clone(), target));
            if let Some(block) = self.state.blocks.get_mut(&hash) {
                block.volume_id = target;
            }
        }
        Ok(())
    }
}
