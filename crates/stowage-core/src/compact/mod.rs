pub mod report;

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::AtomicBool;

use tracing::{info, warn};

use stowage_types::block_hash::{BlockHash, HashAlgorithm};
use stowage_types::error::Result;
use stowage_types::volume_id::VolumeId;

use crate::backend::{
    upload_verification_file, verify_remote_list, IndexFinishedHook, TransferEvent,
    TransferPipeline, VerifyMode,
};
use crate::catalog::{BlockSettings, BlockUse, Catalog, RemoteVolumeRecord, VolumeState};
use crate::compress::Compression;
use crate::config::{IndexFilePolicy, StowageConfig};
use crate::util::{format_bytes, is_cancelled};
use crate::volume::{BlockVolumeReader, BlockVolumeWriter, IndexVolumeWriter, VolumeKind, VolumeName};

pub use self::report::{plan, CompactReport};

/// Settings for one compaction run.
#[derive(Debug, Clone)]
pub struct CompactOptions {
    pub prefix: String,
    pub volume_size: u64,
    pub blocksize: u64,
    pub block_hash: HashAlgorithm,
    pub hashes_per_block: usize,
    pub compression: Compression,
    pub index_policy: IndexFilePolicy,
    pub dry_run: bool,
    /// The remote listing was already checked in this session.
    pub remote_verified: bool,
    pub upload_verification_file: bool,
}

impl CompactOptions {
    pub fn from_config(config: &StowageConfig, dry_run: bool) -> Self {
        let volumes = &config.volumes;
        Self {
            prefix: volumes.prefix.clone(),
            volume_size: volumes.volume_size,
            blocksize: volumes.blocksize,
            block_hash: volumes.block_hash,
            hashes_per_block: volumes.hashes_per_block() as usize,
            compression: volumes.compression.compression(),
            index_policy: volumes.index_policy,
            dry_run,
            remote_verified: false,
            upload_verification_file: config.compact.upload_verification_file,
        }
    }

    fn block_settings(&self) -> BlockSettings {
        BlockSettings {
            blocksize: self.blocksize,
            block_hash: self.block_hash,
        }
    }

    /// A replacement volume is sealed once it grows past this size.
    fn finish_threshold(&self) -> u64 {
        self.volume_size.saturating_sub(self.blocksize)
    }
}

/// Totals reported by a compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionOutcome {
    pub deleted_count: u64,
    pub deleted_size: u64,
    pub downloaded_count: u64,
    pub downloaded_size: u64,
    pub uploaded_count: u64,
    pub uploaded_size: u64,

    /// Block copies read from downloaded volumes.
    pub blocks_examined: u64,
    /// Copies written into replacement volumes.
    pub blocks_migrated: u64,
    /// Referenced copies skipped because a surviving volume holds the block.
    pub blocks_satisfied_elsewhere: u64,
    /// Copies of blocks nothing references.
    pub blocks_unreferenced: u64,
    /// Copies that could not be migrated.
    pub blocks_failed: u64,
    /// Source volumes kept because some of their blocks failed to migrate.
    pub degraded_volumes: Vec<String>,

    /// Cancelled before the repack pass completed.
    pub interrupted: bool,
    pub dry_run: bool,
}

impl CompactionOutcome {
    pub fn made_progress(&self) -> bool {
        self.deleted_count + self.uploaded_count > 0
    }
}

/// Execute a compaction plan.
///
/// Deletes fully unused volumes first, then (if the plan asks for it)
/// repacks the referenced blocks of the compactable volumes into new
/// volumes and deletes the originals. The catalog is committed at every
/// finished replacement volume. On error nothing after the last commit is
/// kept and the crash-safety flag stays set if the repack pass had begun.
///
/// Fails with `Config` before touching anything when the block settings
/// differ from the ones the catalog was built with.
pub fn run(
    catalog: &mut Catalog,
    pipeline: &mut TransferPipeline,
    report: &CompactReport,
    options: &CompactOptions,
    cancel: Option<&AtomicBool>,
) -> Result<CompactionOutcome> {
    catalog.verify_block_settings(options.block_settings())?;

    if report.is_noop() {
        info!("compacting not required");
        return Ok(CompactionOutcome {
            dry_run: options.dry_run,
            ..Default::default()
        });
    }

    if options.dry_run {
        return Ok(dry_run(catalog, report, options));
    }

    let mut compactor = Compactor {
        catalog,
        pipeline,
        options,
        cancel,
        outcome: CompactionOutcome::default(),
    };
    match compactor.execute(report) {
        Ok(()) => Ok(compactor.outcome),
        Err(e) => {
            if let Err(drain) = compactor.pipeline.wait_for_empty(compactor.catalog) {
                warn!("draining transfers after failed compaction: {drain}");
            }
            compactor.catalog.rollback();
            Err(e)
        }
    }
}

/// Replacement volume being filled, with its index volume.
struct RepackWriters {
    block_id: VolumeId,
    block: BlockVolumeWriter,
    index: Option<IndexVolumeWriter>,
}

struct Compactor<'a> {
    catalog: &'a mut Catalog,
    pipeline: &'a mut TransferPipeline,
    options: &'a CompactOptions,
    cancel: Option<&'a AtomicBool>,
    outcome: CompactionOutcome,
}

impl Compactor<'_> {
    fn execute(&mut self, report: &CompactReport) -> Result<()> {
        if !self.options.remote_verified {
            verify_remote_list(
                self.pipeline,
                self.catalog,
                &self.options.prefix,
                VerifyMode::Strict,
            )?;
        }

        let remote_list = self
            .catalog
            .remote_volumes(&[VolumeState::Uploaded, VolumeState::Verified]);

        let fully_deletable = select(&remote_list, &report.deletable_volumes);
        self.delete_volumes(&fully_deletable)?;

        let mut superseded = Vec::new();
        if report.should_compact {
            let to_download = select(&remote_list, &report.compactable_volumes);
            match self.repack(to_download)? {
                Some(done) => superseded = done,
                None => {
                    self.outcome.interrupted = true;
                    info!("compaction interrupted; finished volumes are recorded");
                    return Ok(());
                }
            }
        }

        self.delete_volumes(&superseded)?;
        self.drain()?;
        self.catalog.commit("compact")?;
        self.log_results();

        if self.options.upload_verification_file && self.outcome.made_progress() {
            upload_verification_file(self.pipeline, self.catalog, &self.options.prefix)?;
        }
        Ok(())
    }

    /// Mark a batch `Deleting`, commit, then remove the files.
    fn delete_volumes(&mut self, volumes: &[RemoteVolumeRecord]) -> Result<()> {
        if volumes.is_empty() {
            return Ok(());
        }
        let ordered = self.catalog.reorder_deletable_volumes(volumes);
        let removing: Vec<VolumeId> = ordered.iter().map(|v| v.id).collect();

        for volume in &ordered {
            self.catalog.prepare_for_delete(&volume.name, &removing)?;
            self.catalog.update_remote_volume(
                &volume.name,
                VolumeState::Deleting,
                volume.size,
                volume.hash.clone(),
            )?;
        }

        self.drain()?;
        self.catalog.commit("delete")?;

        for volume in &ordered {
            self.pipeline.delete(&volume.name, volume.size)?;
            self.outcome.deleted_count += 1;
            self.outcome.deleted_size += volume.size.max(0) as u64;
        }
        Ok(())
    }

    /// Carry every needed block of `sources` into new volumes.
    ///
    /// Returns the sources that can now be deleted, or `None` when cancelled.
    fn repack(&mut self, sources: Vec<RemoteVolumeRecord>) -> Result<Option<Vec<RemoteVolumeRecord>>> {
        // Writers are registered before the commit that precedes their upload,
        // so every remote file of an interrupted run is known to the catalog.
        let mut writers = self.open_writers()?;
        self.catalog.set_terminated_with_active_uploads(true);
        self.catalog.commit("compact-start")?;

        let leaving: HashSet<VolumeId> = sources.iter().map(|v| v.id).collect();
        let mut buffer = Vec::with_capacity(self.options.blocksize as usize);
        let mut superseded = Vec::with_capacity(sources.len());

        let downloads = self.pipeline.get_files_overlapped(sources.clone());
        for item in downloads.iter() {
            let downloaded = item?;
            if is_cancelled(self.cancel) {
                self.drain()?;
                self.discard(writers)?;
                self.catalog.commit("compact-interrupted")?;
                return Ok(None);
            }

            self.outcome.downloaded_count += 1;
            self.outcome.downloaded_size += downloaded.size;

            let volume_id = self.catalog.remote_volume_id(&downloaded.name)?;
            let compression = VolumeName::parse(&downloaded.name)?.compression;
            let mut reader = BlockVolumeReader::open(downloaded.file.reopen()?, compression)?;
            let blocks: Vec<(BlockHash, u32)> =
                reader.blocks().map(|(h, s)| (h.clone(), s)).collect();

            let mut failures = 0u64;
            for (hash, size) in blocks {
                self.outcome.blocks_examined += 1;
                match self.catalog.block_disposition(&hash, size, volume_id, &leaving) {
                    BlockUse::Unreferenced => self.outcome.blocks_unreferenced += 1,
                    BlockUse::SatisfiedElsewhere => self.outcome.blocks_satisfied_elsewhere += 1,
                    BlockUse::Needed => {
                        if let Err(e) =
                            self.migrate_block(&mut reader, &mut writers, &hash, size, &mut buffer)
                        {
                            warn!(volume = %downloaded.name, block = %hash, "cannot migrate block: {e}");
                            self.outcome.blocks_failed += 1;
                            failures += 1;
                            continue;
                        }
                        self.outcome.blocks_migrated += 1;

                        if writers.block.filesize() > self.options.finish_threshold() {
                            let full = std::mem::replace(&mut writers, self.open_writers()?);
                            self.finish_and_upload(full)?;
                            self.drain()?;
                            self.catalog.commit("compact-checkpoint")?;
                        }
                    }
                }
            }

            if failures > 0 {
                warn!(
                    volume = %downloaded.name,
                    failures,
                    "volume is degraded and will not be deleted"
                );
                self.outcome.degraded_volumes.push(downloaded.name.clone());
            } else if let Some(source) = sources.iter().find(|v| v.name == downloaded.name) {
                superseded.push(source.clone());
            }
        }

        if writers.block.is_empty() {
            self.discard(writers)?;
        } else {
            self.finish_and_upload(writers)?;
        }

        self.catalog.set_terminated_with_active_uploads(false);
        Ok(Some(superseded))
    }

    fn migrate_block(
        &mut self,
        reader: &mut BlockVolumeReader<std::fs::File>,
        writers: &mut RepackWriters,
        hash: &BlockHash,
        size: u32,
        buffer: &mut Vec<u8>,
    ) -> Result<()> {
        reader.read_block(hash, buffer)?;
        writers.block.add_block(hash, &buffer[..])?;
        if let Some(index) = writers.index.as_mut() {
            index.add_block(hash, size)?;
        }
        self.catalog
            .register_duplicated_block(hash, size, writers.block_id)
    }

    fn open_writers(&mut self) -> Result<RepackWriters> {
        let options = self.options;
        let block_name =
            VolumeName::generate(&options.prefix, VolumeKind::Blocks, options.compression)
                .file_name();
        let block_id = self.catalog.register_remote_volume(
            &block_name,
            VolumeKind::Blocks,
            VolumeState::Temporary,
        )?;

        let index = if options.index_policy == IndexFilePolicy::None {
            None
        } else {
            let index_name =
                VolumeName::generate(&options.prefix, VolumeKind::Index, options.compression)
                    .file_name();
            let index_id = self.catalog.register_remote_volume(
                &index_name,
                VolumeKind::Index,
                VolumeState::Temporary,
            )?;
            self.catalog.add_index_block_link(index_id, block_id)?;
            let mut writer = IndexVolumeWriter::new(index_name, options.compression);
            writer.start_volume(&block_name);
            Some(writer)
        };

        Ok(RepackWriters {
            block_id,
            block: BlockVolumeWriter::new(block_name, options.compression),
            index,
        })
    }

    /// Queue a replacement volume for upload. With the `Full` index policy
    /// the index volume also receives the blocklists stored in it.
    fn finish_and_upload(&mut self, writers: RepackWriters) -> Result<()> {
        let hook: Option<IndexFinishedHook> = match (&writers.index, self.options.index_policy) {
            (Some(_), IndexFilePolicy::Full) => {
                let blocklists = self
                    .catalog
                    .blocklists(writers.block_id, self.options.hashes_per_block);
                Some(Box::new(move |index: &mut IndexVolumeWriter| {
                    for (hash, data) in &blocklists {
                        index.write_blocklist(hash, data);
                    }
                }))
            }
            _ => None,
        };
        info!(
            volume = %writers.block.name(),
            blocks = writers.block.block_count(),
            size = writers.block.filesize(),
            "uploading replacement volume"
        );
        self.pipeline.put(writers.block, writers.index, hook)
    }

    /// Drop an unfinished replacement volume and its catalog records.
    fn discard(&mut self, writers: RepackWriters) -> Result<()> {
        self.catalog.remove_remote_volume(writers.block.name())?;
        if let Some(index) = &writers.index {
            self.catalog.remove_remote_volume(index.name())?;
        }
        Ok(())
    }

    /// Wait for the pipeline and count finished uploads.
    fn drain(&mut self) -> Result<()> {
        for event in self.pipeline.wait_for_empty(self.catalog)? {
            if let TransferEvent::Uploaded { size, .. } = event {
                self.outcome.uploaded_count += 1;
                self.outcome.uploaded_size += size;
            }
        }
        Ok(())
    }

    fn log_results(&self) {
        let o = &self.outcome;
        if o.downloaded_count == 0 {
            info!(
                deleted = o.deleted_count,
                deleted_size = o.deleted_size,
                "Deleted {} file(s), which reduced storage by {}",
                o.deleted_count,
                format_bytes(o.deleted_size)
            );
        } else {
            info!(
                downloaded = o.downloaded_count,
                deleted = o.deleted_count,
                uploaded = o.uploaded_count,
                migrated = o.blocks_migrated,
                "Downloaded {} file(s) ({}), deleted {} file(s) ({}), compacted to {} file(s) ({}), which reduced storage by {} file(s) and {}",
                o.downloaded_count,
                format_bytes(o.downloaded_size),
                o.deleted_count,
                format_bytes(o.deleted_size),
                o.uploaded_count,
                format_bytes(o.uploaded_size),
                o.deleted_count as i64 - o.uploaded_count as i64,
                format_bytes(o.deleted_size.saturating_sub(o.uploaded_size))
            );
        }
    }
}

/// Report what a real run would do, without downloading or changing anything.
fn dry_run(catalog: &Catalog, report: &CompactReport, options: &CompactOptions) -> CompactionOutcome {
    let mut outcome = CompactionOutcome {
        dry_run: true,
        ..Default::default()
    };
    let remote_list = catalog.remote_volumes(&[VolumeState::Uploaded, VolumeState::Verified]);

    let deletable = select(&remote_list, &report.deletable_volumes);
    let mut doomed = catalog.reorder_deletable_volumes(&deletable);

    if report.should_compact {
        let sources = select(&remote_list, &report.compactable_volumes);
        let usage = catalog.volume_usage();
        let mut live_bytes = 0u64;
        for source in &sources {
            outcome.downloaded_count += 1;
            outcome.downloaded_size += source.size.max(0) as u64;
            live_bytes += usage
                .iter()
                .find(|u| u.id == source.id)
                .map_or(0, |u| u.active_bytes);
        }
        if live_bytes > 0 {
            let per_volume = options.finish_threshold().max(1);
            let volumes = live_bytes.div_ceil(per_volume);
            let per_upload = if options.index_policy == IndexFilePolicy::None { 1 } else { 2 };
            outcome.uploaded_count = volumes * per_upload;
            outcome.uploaded_size = live_bytes;
            info!(
                "Would upload {} generated volume(s) with about {} of block data",
                volumes,
                format_bytes(live_bytes)
            );
        }
        doomed.extend(catalog.reorder_deletable_volumes(&sources));
    }

    for volume in &doomed {
        info!(
            volume = %volume.name,
            "Would delete remote file: {}, size: {}",
            volume.name,
            format_bytes(volume.size.max(0) as u64)
        );
        outcome.deleted_count += 1;
        outcome.deleted_size += volume.size.max(0) as u64;
    }

    if outcome.downloaded_count == 0 {
        info!(
            "Would delete {} file(s), which would reduce storage by {}",
            outcome.deleted_count,
            format_bytes(outcome.deleted_size)
        );
    } else {
        info!(
            "Would download {} file(s) ({}), delete {} file(s) ({}) and compact to {} file(s) ({})",
            outcome.downloaded_count,
            format_bytes(outcome.downloaded_size),
            outcome.deleted_count,
            format_bytes(outcome.deleted_size),
            outcome.uploaded_count,
            format_bytes(outcome.uploaded_size)
        );
    }
    outcome
}

fn select(volumes: &[RemoteVolumeRecord], names: &BTreeSet<String>) -> Vec<RemoteVolumeRecord> {
    volumes
        .iter()
        .filter(|v| v.kind == VolumeKind::Blocks && names.contains(&v.name))
        .cloned()
        .collect()
}
