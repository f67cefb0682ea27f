use std::collections::{BTreeSet, HashMap};

use tracing::{info, warn};

use stowage_types::error::{Result, StowageError};

use super::TransferPipeline;
use crate::catalog::{Catalog, VolumeState};
use crate::volume::VolumeName;

/// How to treat a remote listing that disagrees with the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Any missing, resized or unknown volume is a consistency error.
    #[default]
    Strict,
    /// Disagreements are logged and skipped.
    Relaxed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub verified: usize,
    /// Catalogued volumes absent from the remote (or with the wrong size).
    pub missing: Vec<String>,
    /// Remote volumes the catalog does not know.
    pub unknown: Vec<String>,
    /// Leftover temporary volumes removed from the remote and the catalog.
    pub removed_temporary: Vec<String>,
    /// Volumes stuck in `Deleting` whose delete was completed.
    pub completed_deletes: Vec<String>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.unknown.is_empty()
    }
}

/// Cross-check the remote listing against the catalog and settle leftovers.
///
/// Nothing is changed when a strict check fails. Otherwise uploaded volumes
/// seen with the right size become `Verified`, pending deletes are finished,
/// temporary volumes left by an interrupted run are removed and the
/// crash-safety flag is cleared. The caller commits.
pub fn verify_remote_list(
    pipeline: &mut TransferPipeline,
    catalog: &mut Catalog,
    prefix: &str,
    mode: VerifyMode,
) -> Result<VerifyReport> {
    let listing_prefix = format!("{prefix}-");
    let mut remote: HashMap<String, u64> = HashMap::new();
    for key in pipeline.backend().list(&listing_prefix)? {
        let matches_prefix = VolumeName::parse(&key).is_ok_and(|n| n.prefix == prefix);
        if !matches_prefix {
            continue;
        }
        if let Some(size) = pipeline.backend().size(&key)? {
            remote.insert(key, size);
        }
    }

    let mut report = VerifyReport::default();
    let mut known: BTreeSet<String> = BTreeSet::new();
    let mut to_verify = Vec::new();

    for volume in catalog.remote_volumes(&[]) {
        if volume.state != VolumeState::Deleted {
            known.insert(volume.name.clone());
        }
        match volume.state {
            VolumeState::Uploaded | VolumeState::Verified => match remote.get(&volume.name) {
                Some(size) if volume.size < 0 || *size == volume.size as u64 => {
                    to_verify.push(volume.name.clone());
                }
                Some(size) => {
                    warn!(
                        volume = %volume.name,
                        expected = volume.size,
                        actual = size,
                        "remote volume has unexpected size"
                    );
                    report.missing.push(volume.name.clone());
                }
                None => {
                    warn!(volume = %volume.name, "remote volume is missing");
                    report.missing.push(volume.name.clone());
                }
            },
            VolumeState::Temporary => report.removed_temporary.push(volume.name.clone()),
            VolumeState::Deleting => report.completed_deletes.push(volume.name.clone()),
            VolumeState::Deleted => {}
        }
    }

    let mut unknown: Vec<String> = remote
        .keys()
        .filter(|name| !known.contains(*name))
        .cloned()
        .collect();
    unknown.sort();

    // After an interrupted compaction, stray volumes are its partial uploads.
    let interrupted = catalog.terminated_with_active_uploads();
    let stray = if interrupted {
        std::mem::take(&mut unknown)
    } else {
        Vec::new()
    };
    for name in &unknown {
        warn!(volume = %name, "remote volume is not in the catalog");
    }
    report.unknown = unknown;

    if mode == VerifyMode::Strict && !report.is_consistent() {
        return Err(StowageError::Consistency(format!(
            "remote listing does not match the catalog: {} missing, {} unknown",
            report.missing.len(),
            report.unknown.len()
        )));
    }

    for name in &to_verify {
        let size = remote.get(name).copied().unwrap_or_default() as i64;
        let hash = catalog.remote_volume(name).and_then(|v| v.hash.clone());
        catalog.update_remote_volume(name, VolumeState::Verified, size, hash)?;
    }
    report.verified = to_verify.len();

    for name in &report.completed_deletes {
        match remote.get(name) {
            Some(size) => pipeline.delete(name, *size as i64)?,
            None => catalog.set_volume_state(name, VolumeState::Deleted)?,
        }
    }
    for name in &report.removed_temporary {
        if let Some(size) = remote.get(name) {
            pipeline.backend().delete(name)?;
            info!(volume = %name, size, "removed leftover temporary volume");
        }
        catalog.remove_remote_volume(name)?;
    }
    for name in &stray {
        pipeline.backend().delete(name)?;
        info!(volume = %name, "removed stray volume of an interrupted compaction");
    }
    pipeline.wait_for_empty(catalog)?;

    if interrupted {
        warn!(
            removed = report.removed_temporary.len() + stray.len(),
            "previous compaction was interrupted; leftovers reconciled"
        );
        report.removed_temporary.extend(stray);
        catalog.set_terminated_with_active_uploads(false);
    }
    Ok(report)
}
