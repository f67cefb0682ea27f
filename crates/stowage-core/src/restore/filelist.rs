use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use stowage_types::error::{Result, StowageError};

const FILESET_SUFFIX: &str = ".dlist.json";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// One file recorded in a snapshot file list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    /// Base64 whole-file hash.
    pub hash: String,
    /// Base64 blocklist hashes. `None` when the file is a single block
    /// whose hash is `hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocklist_hashes: Option<Vec<String>>,
}

/// A file list document found in a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fileset {
    pub time: DateTime<Utc>,
    pub path: PathBuf,
}

/// `<prefix>-<YYYYMMDDTHHMMSSZ>.dlist.json`
pub fn fileset_name(prefix: &str, time: DateTime<Utc>) -> String {
    format!("{prefix}-{}{FILESET_SUFFIX}", time.format(TIMESTAMP_FORMAT))
}

fn parse_fileset_name(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(FILESET_SUFFIX)?;
    let (_, stamp) = stem.rsplit_once('-')?;
    parse_timestamp(stamp)
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// File lists in `folder`, newest first.
pub fn list_filesets(folder: &Path) -> Result<Vec<Fileset>> {
    let mut sets = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(time) = name.to_str().and_then(parse_fileset_name) else {
            continue;
        };
        sets.push(Fileset {
            time,
            path: entry.path(),
        });
    }
    sets.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| a.path.cmp(&b.path)));
    Ok(sets)
}

/// Pick a file list by index (`0` is the newest) or by timestamp.
///
/// A timestamp selects the newest list taken at or before it.
pub fn select_fileset(folder: &Path, selector: &str) -> Result<Fileset> {
    let sets = list_filesets(folder)?;
    if sets.is_empty() {
        return Err(StowageError::Config(format!(
            "no file lists found in {}",
            folder.display()
        )));
    }

    if let Ok(index) = selector.trim().parse::<usize>() {
        return sets.get(index).cloned().ok_or_else(|| {
            StowageError::Config(format!(
                "file list index {index} out of range, {} available",
                sets.len()
            ))
        });
    }

    let time = parse_timestamp(selector.trim()).ok_or_else(|| {
        StowageError::Config(format!("invalid file list selector: '{selector}'"))
    })?;
    sets.into_iter()
        .find(|set| set.time <= time)
        .ok_or_else(|| StowageError::Config(format!("no file list at or before {time}")))
}

pub fn read_file_list(path: &Path) -> Result<Vec<FileEntry>> {
    let data = std::fs::read(path)?;
    let entries: Vec<FileEntry> = serde_json::from_slice(&data)?;
    debug!(files = entries.len(), "loaded file list {}", path.display());
    Ok(entries)
}

/// Write a file list for `time` into `folder` and return its path.
pub fn write_file_list(
    folder: &Path,
    prefix: &str,
    time: DateTime<Utc>,
    entries: &[FileEntry],
) -> Result<PathBuf> {
    let path = folder.join(fileset_name(prefix, time));
    let data = serde_json::to_vec_pretty(entries)?;
    std::fs::write(&path, data)?;
    Ok(path)
}
