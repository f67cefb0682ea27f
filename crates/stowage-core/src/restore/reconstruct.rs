use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use stowage_types::block_hash::{BlockHash, HashAlgorithm};
use stowage_types::error::{Result, StowageError};

use super::archive_cache::ArchiveCache;
use super::filelist::FileEntry;
use super::hash_index::HashIndex;

/// Block geometry and hash algorithm of the backup being restored.
#[derive(Debug, Clone, Copy)]
pub struct RestoreLayout {
    pub blocksize: u64,
    pub hashes_per_block: u64,
    pub file_hash: HashAlgorithm,
}

impl RestoreLayout {
    pub fn new(blocksize: u64, block_hash: HashAlgorithm, file_hash: HashAlgorithm) -> Self {
        Self {
            blocksize,
            hashes_per_block: blocksize / block_hash.hash_size() as u64,
            file_hash,
        }
    }

    /// Position of child `child` of blocklist `blocklist` in the file.
    pub fn block_offset(&self, blocklist: u64, child: u64) -> u64 {
        blocklist * self.hashes_per_block * self.blocksize + child * self.blocksize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Content hash matched; target written.
    Restored,
    /// Hash mismatch and no existing target; damaged content written.
    Damaged,
    /// Hash mismatch and the target already existed; left untouched.
    SkippedExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRestore {
    pub outcome: FileOutcome,
    /// Block bytes written into the scratch file.
    pub bytes: u64,
    /// Blocks or blocklists that could not be read.
    pub block_errors: u64,
}

/// Rebuild one file at `target` from its blocks.
///
/// Blocks go into a scratch file in the target's directory at their computed
/// offsets, so a block that fails to read leaves only its own range empty.
/// The scratch file replaces the target when the content hash matches. On a
/// mismatch an existing target is kept and the scratch file discarded;
/// without one, the damaged content is kept for the operator.
pub fn restore_file(
    entry: &FileEntry,
    index: &mut HashIndex,
    cache: &mut ArchiveCache,
    target: &Path,
    layout: &RestoreLayout,
) -> Result<FileRestore> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut scratch = NamedTempFile::new_in(dir)?;
    let mut buf = Vec::new();
    let mut bytes = 0u64;
    let mut block_errors = 0u64;

    match &entry.blocklist_hashes {
        None => {
            let hash = BlockHash::from_base64(&entry.hash)?;
            match index.read_block(&hash, cache, &mut buf) {
                Ok(len) => {
                    scratch.write_all(&buf[..len])?;
                    bytes += len as u64;
                }
                Err(e) => {
                    warn!(path = %entry.path, hash = %entry.hash, "failed to read block: {e}");
                    block_errors += 1;
                }
            }
        }
        Some(blocklists) => {
            for (blhi, blocklist) in blocklists.iter().enumerate() {
                let children = BlockHash::from_base64(blocklist)
                    .and_then(|hash| index.expand_blocklist(&hash, cache));
                let children = match children {
                    Ok(children) => children,
                    Err(e) => {
                        warn!(path = %entry.path, blocklist = %blocklist, "failed to read blocklist: {e}");
                        block_errors += 1;
                        continue;
                    }
                };
                for (bi, child) in children.iter().enumerate() {
                    let offset = layout.block_offset(blhi as u64, bi as u64);
                    match index.read_block(child, cache, &mut buf) {
                        Ok(len) => {
                            let file = scratch.as_file_mut();
                            file.seek(SeekFrom::Start(offset))?;
                            file.write_all(&buf[..len])?;
                            bytes += len as u64;
                        }
                        Err(e) => {
                            warn!(path = %entry.path, hash = %child, offset, "failed to read block: {e}");
                            block_errors += 1;
                        }
                    }
                }
            }
        }
    }
    scratch.as_file_mut().flush()?;

    let actual = hash_file(scratch.as_file_mut(), layout.file_hash)?;
    let outcome = if actual.to_base64() == entry.hash {
        persist(scratch, target)?;
        FileOutcome::Restored
    } else if target.exists() {
        warn!(path = %target.display(), "restored file hash mismatch; not overwriting existing file");
        FileOutcome::SkippedExisting
    } else {
        warn!(path = %target.display(), "restored file hash mismatch; restoring file in damaged condition");
        persist(scratch, target)?;
        FileOutcome::Damaged
    };
    debug!(path = %target.display(), bytes, block_errors, ?outcome, "restored file");

    Ok(FileRestore {
        outcome,
        bytes,
        block_errors,
    })
}

fn hash_file(file: &mut std::fs::File, algorithm: HashAlgorithm) -> Result<BlockHash> {
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = algorithm.hasher();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hasher.finalize())
}

fn persist(scratch: NamedTempFile, target: &Path) -> Result<()> {
    scratch.as_file().sync_all()?;
    scratch.persist(target).map_err(|e| e.error)?;
    Ok(())
}

fn is_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn separator_of(path: &str) -> char {
    if is_drive_path(path) || (path.contains('\\') && !path.contains('/')) {
        '\\'
    } else {
        '/'
    }
}

/// Longest directory prefix shared by every path, compared component-wise.
///
/// The result ends with the path separator, or is empty when the paths
/// share nothing (for example files from different drives).
pub fn common_prefix<'a, I>(paths: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut iter = paths.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let sep = separator_of(first);
    let dir_parts = |path: &'a str| -> Vec<&'a str> {
        let mut parts: Vec<&str> = path.split(sep).collect();
        parts.pop();
        parts
    };

    let mut prefix = dir_parts(first);
    for path in iter {
        let parts = dir_parts(path);
        let shared = prefix
            .iter()
            .zip(&parts)
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(shared);
        if prefix.is_empty() {
            break;
        }
    }

    if prefix.is_empty() {
        return String::new();
    }
    let mut joined = prefix.join(&sep.to_string());
    joined.push(sep);
    joined
}

/// Where `path` is written: unchanged without a target folder, otherwise
/// below `target` with `prefix` removed.
///
/// Drive-letter paths restored with an empty prefix land under
/// `<target>/<drive letter>/...` so no colon ends up in the output path.
pub fn map_to_restore_path(path: &str, prefix: &str, target: Option<&Path>) -> Result<PathBuf> {
    let Some(target) = target else {
        return Ok(PathBuf::from(path));
    };

    let mut out = target.to_path_buf();
    let relative = if prefix.is_empty() {
        if is_drive_path(path) {
            out.push(&path[..1]);
            &path[2..]
        } else {
            path
        }
    } else {
        path.strip_prefix(prefix).ok_or_else(|| {
            StowageError::InvalidFormat(format!("path '{path}' is outside prefix '{prefix}'"))
        })?
    };

    let mut pushed = false;
    for part in relative.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                return Err(StowageError::InvalidFormat(format!(
                    "refusing to restore unsafe path: {path}"
                )))
            }
            part => {
                out.push(part);
                pushed = true;
            }
        }
    }
    if !pushed {
        return Err(StowageError::InvalidFormat(format!(
            "refusing to restore empty path: {path}"
        )));
    }
    Ok(out)
}
