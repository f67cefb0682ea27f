use std::collections::BTreeSet;

use tracing::info;

use stowage_types::error::Result;

use crate::catalog::{Catalog, VolumeUsage};
use crate::config::validate_compact_settings;
use crate::util::format_bytes;

/// Outcome of planning: which volumes to delete outright and which to repack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactReport {
    pub should_compact: bool,
    pub should_reclaim: bool,
    pub deletable_volumes: BTreeSet<String>,
    pub compactable_volumes: BTreeSet<String>,

    pub volume_size: u64,
    pub volume_count: usize,
    /// Remote size of the volumes that still hold referenced blocks.
    pub total_size: u64,
    pub wasted_size: u64,
    pub deletable_size: u64,
    pub small_count: usize,
    pub small_size: u64,
    pub under_utilized_count: usize,
}

impl CompactReport {
    pub fn is_noop(&self) -> bool {
        !self.should_compact && !self.should_reclaim
    }

    /// Fraction of the remaining data that is wasted, `0.0` for an empty store.
    pub fn wasted_ratio(&self) -> f64 {
        if self.total_size == 0 {
            0.0
        } else {
            self.wasted_size as f64 / self.total_size as f64
        }
    }

    pub fn log_summary(&self) {
        if !self.deletable_volumes.is_empty() {
            info!(
                volumes = self.deletable_volumes.len(),
                size = self.deletable_size,
                "found {} fully deletable volume(s) ({})",
                self.deletable_volumes.len(),
                format_bytes(self.deletable_size)
            );
        }
        if self.small_count > 0 {
            info!(
                volumes = self.small_count,
                size = self.small_size,
                "found {} small volume(s) with a combined size of {}",
                self.small_count,
                format_bytes(self.small_size)
            );
        }
        if self.wasted_size > 0 {
            info!(
                wasted = self.wasted_size,
                total = self.total_size,
                "{} of {} is wasted ({:.1}%), about {:.1} volume(s) worth",
                format_bytes(self.wasted_size),
                format_bytes(self.total_size),
                self.wasted_ratio() * 100.0,
                self.wasted_size as f64 / self.volume_size.max(1) as f64
            );
        }
        if self.should_compact {
            info!(
                compactable = self.compactable_volumes.len(),
                under_utilized = self.under_utilized_count,
                "compaction is warranted"
            );
        } else if self.should_reclaim {
            info!("only fully deletable volumes will be removed");
        } else {
            info!("compacting not required");
        }
    }
}

/// Decide what compaction should do from the catalog's usage figures.
///
/// Pure read; calling it twice on an unchanged catalog gives equal reports.
pub fn plan(
    catalog: &Catalog,
    volume_size: u64,
    threshold: f64,
    small_file_size: u64,
    small_file_max_count: usize,
) -> Result<CompactReport> {
    validate_compact_settings(volume_size, threshold, small_file_size, small_file_max_count)?;
    Ok(plan_from_usage(
        &catalog.volume_usage(),
        volume_size,
        threshold,
        small_file_size,
        small_file_max_count,
    ))
}

fn plan_from_usage(
    usage: &[VolumeUsage],
    volume_size: u64,
    threshold: f64,
    small_file_size: u64,
    small_file_max_count: usize,
) -> CompactReport {
    let mut report = CompactReport {
        volume_size,
        volume_count: usage.len(),
        ..Default::default()
    };

    let mut candidates: BTreeSet<String> = BTreeSet::new();
    for volume in usage {
        if volume.live_blocks == 0 {
            report.deletable_volumes.insert(volume.name.clone());
            report.deletable_size += volume.size;
            continue;
        }

        report.total_size += volume.size;
        report.wasted_size += volume.wasted_bytes;

        let stored = volume.active_bytes + volume.wasted_bytes;
        let utilization = if stored == 0 {
            1.0
        } else {
            volume.active_bytes as f64 / stored as f64
        };
        if utilization < threshold {
            report.under_utilized_count += 1;
            candidates.insert(volume.name.clone());
        }
        if volume.size <= small_file_size {
            report.small_count += 1;
            report.small_size += volume.size;
            candidates.insert(volume.name.clone());
        }
    }

    // Wasted bytes are measured decoded while sizes are remote; compare
    // against the decoded total when it is the larger of the two.
    let decoded_total: u64 = usage
        .iter()
        .filter(|v| v.live_blocks > 0)
        .map(|v| v.active_bytes + v.wasted_bytes)
        .sum();
    let reference = report.total_size.max(decoded_total);

    report.should_reclaim = !report.deletable_volumes.is_empty();
    report.should_compact = candidates.len() > small_file_max_count
        || (report.wasted_size > 0
            && report.wasted_size as f64 > (1.0 - threshold) * reference as f64);
    if report.should_compact {
        report.compactable_volumes = candidates;
    }
    report
}
