use std::sync::atomic::AtomicBool;

use stowage_core::config::StowageConfig;
use stowage_types::error::StowageError;

use crate::cli::Commands;
use crate::cmd;
use crate::cmd::restore::RestoreArgs;

/// Exit status when a command cannot start.
pub(crate) const EXIT_PRECONDITION: u8 = 100;

pub(crate) fn dispatch_command(
    command: &Commands,
    config: Option<&StowageConfig>,
    shutdown: Option<&AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Compact { dry_run } => {
            cmd::compact::run_compact(require(config)?, *dry_run, shutdown)
        }
        Commands::Verify { relaxed } => cmd::verify::run_verify(require(config)?, *relaxed),
        Commands::Index { folder, index_file } => {
            cmd::index::run_index(folder, index_file.as_deref())
        }
        Commands::Restore {
            folder,
            fileset,
            index_file,
            target_path,
            blocksize,
            block_hash_algorithm,
            file_hash_algorithm,
            filter,
        } => {
            let args = RestoreArgs {
                folder,
                fileset: fileset.as_deref(),
                index_file: index_file.as_deref(),
                target_path: target_path.as_deref(),
                blocksize,
                block_hash_algorithm,
                file_hash_algorithm,
                filter: filter.as_deref(),
            };
            cmd::restore::run_restore(&args, shutdown)
        }
    }
}

fn require(config: Option<&StowageConfig>) -> Result<&StowageConfig, StowageError> {
    config.ok_or_else(|| StowageError::Config("no configuration loaded".into()))
}

/// Process exit status for a failed command.
pub(crate) fn exit_code(err: &(dyn std::error::Error + 'static)) -> u8 {
    match err.downcast_ref::<StowageError>() {
        Some(StowageError::Config(_)) => EXIT_PRECONDITION,
        _ => 1,
    }
}
