use std::sync::atomic::AtomicBool;

use stowage_core::commands;
use stowage_core::config::StowageConfig;
use stowage_core::util::format_bytes;

pub(crate) fn run_compact(
    config: &StowageConfig,
    dry_run: bool,
    shutdown: Option<&AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (report, outcome) = commands::compact(config, dry_run, shutdown)?;

    if report.is_noop() {
        println!(
            "Nothing to compact: {} volume(s), {} wasted",
            report.volume_count,
            format_bytes(report.wasted_size),
        );
        return Ok(());
    }

    if outcome.dry_run {
        println!(
            "Dry run: would delete {} volume(s) ({}), download {} volume(s) ({}) and upload {} new volume(s)",
            outcome.deleted_count,
            format_bytes(outcome.deleted_size),
            outcome.downloaded_count,
            format_bytes(outcome.downloaded_size),
            outcome.uploaded_count,
        );
        return Ok(());
    }

    println!(
        "Compaction {}: deleted {} volume(s) ({}), downloaded {} ({}), uploaded {} ({})",
        if outcome.interrupted { "interrupted" } else { "complete" },
        outcome.deleted_count,
        format_bytes(outcome.deleted_size),
        outcome.downloaded_count,
        format_bytes(outcome.downloaded_size),
        outcome.uploaded_count,
        format_bytes(outcome.uploaded_size),
    );
    println!(
        "  {} block(s) migrated, {} already stored elsewhere, {} unreferenced",
        outcome.blocks_migrated, outcome.blocks_satisfied_elsewhere, outcome.blocks_unreferenced,
    );
    if !outcome.degraded_volumes.is_empty() {
        println!(
            "  Warning: {} block(s) could not be migrated; kept {} volume(s):",
            outcome.blocks_failed,
            outcome.degraded_volumes.len(),
        );
        for name in &outcome.degraded_volumes {
            println!("    {name}");
        }
    }
    Ok(())
}
