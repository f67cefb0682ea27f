pub mod archive_cache;
pub mod filelist;
pub mod hash_index;
pub mod reconstruct;

use std::path::Path;
use std::sync::atomic::AtomicBool;

use tracing::{info, warn};

use stowage_types::block_hash::HashAlgorithm;
use stowage_types::error::{Result, StowageError};

pub use self::archive_cache::{ArchiveCache, MAX_OPEN_ARCHIVES};
pub use self::filelist::{FileEntry, Fileset};
pub use self::hash_index::{build_index_file, BlockLocation, HashIndex};
pub use self::reconstruct::{
    common_prefix, map_to_restore_path, restore_file, FileOutcome, RestoreLayout,
};
use crate::config::validate_block_settings;
use crate::util::{format_bytes, is_cancelled};

/// Inputs of a restore from a folder of downloaded volumes.
#[derive(Debug, Clone)]
pub struct RestoreOptions<'a> {
    /// Folder holding block volumes and file lists.
    pub folder: &'a Path,
    pub index_file: &'a Path,
    /// Restore below this folder instead of the original locations.
    pub target: Option<&'a Path>,
    /// File list selector; the newest list when `None`.
    pub fileset: Option<&'a str>,
    pub blocksize: u64,
    pub block_hash: HashAlgorithm,
    pub file_hash: HashAlgorithm,
    /// Glob over recorded paths; everything when `None`.
    pub filter: Option<&'a str>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreStats {
    pub files: u64,
    pub restored: u64,
    pub damaged: u64,
    pub skipped_existing: u64,
    pub failed: u64,
    pub block_errors: u64,
    pub bytes: u64,
    pub interrupted: bool,
}

impl RestoreStats {
    pub fn is_clean(&self) -> bool {
        self.damaged == 0
            && self.skipped_existing == 0
            && self.failed == 0
            && self.block_errors == 0
            && !self.interrupted
    }
}

/// Restore every selected file of one file list.
///
/// Precondition failures (missing folder or index, bad block settings,
/// invalid filter) are `Config` errors raised before anything is written.
/// Per-file failures are logged and counted.
pub fn run(opts: &RestoreOptions<'_>, cancel: Option<&AtomicBool>) -> Result<RestoreStats> {
    validate_block_settings(opts.blocksize, opts.block_hash)?;
    if !opts.folder.is_dir() {
        return Err(StowageError::Config(format!(
            "folder not found: {}",
            opts.folder.display()
        )));
    }
    if !opts.index_file.is_file() {
        return Err(StowageError::Config(format!(
            "index file not found: {}, run the index command first",
            opts.index_file.display()
        )));
    }
    let filter = opts
        .filter
        .map(|p| {
            globset::GlobBuilder::new(p)
                .literal_separator(false)
                .build()
                .map(|g| g.compile_matcher())
        })
        .transpose()
        .map_err(|e| StowageError::Config(format!("invalid filter: {e}")))?;

    let fileset = match opts.fileset {
        Some(selector) => filelist::select_fileset(opts.folder, selector)?,
        None => filelist::select_fileset(opts.folder, "0")?,
    };
    info!(time = %fileset.time, "using file list {}", fileset.path.display());

    let entries: Vec<FileEntry> = filelist::read_file_list(&fileset.path)?
        .into_iter()
        .filter(|e| filter.as_ref().map_or(true, |m| m.is_match(&e.path)))
        .collect();

    let prefix = match opts.target {
        Some(_) => common_prefix(entries.iter().map(|e| e.path.as_str())),
        None => String::new(),
    };
    if !prefix.is_empty() {
        info!(prefix = %prefix, "removing common prefix from files");
    }

    let layout = RestoreLayout::new(opts.blocksize, opts.block_hash, opts.file_hash);
    let mut index = HashIndex::build(opts.index_file, opts.block_hash.hash_size())?;
    let mut cache = ArchiveCache::new(opts.folder);
    info!(
        files = entries.len(),
        target = %opts.target.map_or("original position".into(), |t| t.display().to_string()),
        "restoring files"
    );

    let mut stats = RestoreStats::default();
    for entry in &entries {
        if is_cancelled(cancel) {
            warn!(remaining = entries.len() as u64 - stats.files, "restore interrupted");
            stats.interrupted = true;
            break;
        }
        stats.files += 1;

        let result = map_to_restore_path(&entry.path, &prefix, opts.target)
            .map(|path| match opts.target {
                Some(_) => path,
                // Relative recorded paths resolve against the volume folder.
                None => opts.folder.join(path),
            })
            .and_then(|target| {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                restore_file(entry, &mut index, &mut cache, &target, &layout)
            });
        match result {
            Ok(done) => {
                stats.bytes += done.bytes;
                stats.block_errors += done.block_errors;
                match done.outcome {
                    FileOutcome::Restored => stats.restored += 1,
                    FileOutcome::Damaged => stats.damaged += 1,
                    FileOutcome::SkippedExisting => stats.skipped_existing += 1,
                }
            }
            Err(e) => {
                warn!(path = %entry.path, "failed to restore file: {e}");
                stats.failed += 1;
            }
        }
    }

    info!(
        restored = stats.restored,
        damaged = stats.damaged,
        skipped = stats.skipped_existing,
        failed = stats.failed,
        "restored {} of {} file(s), {}",
        stats.restored,
        stats.files,
        format_bytes(stats.bytes)
    );
    Ok(stats)
}
