use std::path::Path;
use std::sync::atomic::AtomicBool;

use tracing::info;

use stowage_types::error::Result;

use crate::backend::{verify_remote_list, TransferPipeline, VerifyMode, VerifyReport};
use crate::catalog::{BlockSettings, Catalog};
use crate::compact::{self, CompactOptions, CompactReport, CompactionOutcome};
use crate::config::StowageConfig;
use crate::storage;

/// Catalog and transfer pipeline opened from a configuration.
pub struct Session {
    pub catalog: Catalog,
    pub pipeline: TransferPipeline,
}

impl Session {
    pub fn open(config: &StowageConfig) -> Result<Self> {
        let backend = storage::backend_from_config(&config.repository)?;
        let catalog = Catalog::open(Path::new(&config.catalog.path))?;
        let pipeline = TransferPipeline::new(
            backend,
            config.repository.max_in_flight_uploads,
            config.repository.read_ahead,
        );
        Ok(Self { catalog, pipeline })
    }
}

/// Plan and run a compaction of the configured store.
pub fn compact(
    config: &StowageConfig,
    dry_run: bool,
    cancel: Option<&AtomicBool>,
) -> Result<(CompactReport, CompactionOutcome)> {
    let mut session = Session::open(config)?;
    let settings = &config.compact;
    let report = compact::plan(
        &session.catalog,
        config.volumes.volume_size,
        settings.threshold,
        settings.small_file_size,
        settings.small_file_max_count,
    )?;
    report.log_summary();

    let options = CompactOptions::from_config(config, dry_run);
    let outcome = compact::run(
        &mut session.catalog,
        &mut session.pipeline,
        &report,
        &options,
        cancel,
    )?;
    Ok((report, outcome))
}

/// Check the remote listing against the catalog and commit the settled state.
pub fn verify(config: &StowageConfig, mode: VerifyMode) -> Result<VerifyReport> {
    let mut session = Session::open(config)?;
    session.catalog.verify_block_settings(BlockSettings {
        blocksize: config.volumes.blocksize,
        block_hash: config.volumes.block_hash,
    })?;
    let report = verify_remote_list(
        &mut session.pipeline,
        &mut session.catalog,
        &config.volumes.prefix,
        mode,
    )?;
    session.pipeline.wait_for_empty(&mut session.catalog)?;
    session.catalog.commit("verify")?;
    info!(
        verified = report.verified,
        missing = report.missing.len(),
        unknown = report.unknown.len(),
        "remote listing checked"
    );
    Ok(report)
}
