use std::path::Path;
use std::sync::atomic::AtomicBool;

use stowage_core::config::parse_size;
use stowage_core::restore::{self, RestoreOptions};
use stowage_core::util::format_bytes;
use stowage_types::block_hash::HashAlgorithm;

use super::index::index_path;

pub(crate) struct RestoreArgs<'a> {
    pub folder: &'a str,
    pub fileset: Option<&'a str>,
    pub index_file: Option<&'a str>,
    pub target_path: Option<&'a str>,
    pub blocksize: &'a str,
    pub block_hash_algorithm: &'a str,
    pub file_hash_algorithm: &'a str,
    pub filter: Option<&'a str>,
}

pub(crate) fn run_restore(
    args: &RestoreArgs<'_>,
    shutdown: Option<&AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let folder = Path::new(args.folder);
    let index_file = index_path(folder, args.index_file);
    let target = args.target_path.map(Path::new);

    let opts = RestoreOptions {
        folder,
        index_file: &index_file,
        target,
        fileset: args.fileset,
        blocksize: parse_size(args.blocksize)?,
        block_hash: HashAlgorithm::from_name(args.block_hash_algorithm)?,
        file_hash: HashAlgorithm::from_name(args.file_hash_algorithm)?,
        filter: args.filter,
    };
    let stats = restore::run(&opts, shutdown)?;

    println!(
        "Restored {} of {} file(s), {}",
        stats.restored,
        stats.files,
        format_bytes(stats.bytes),
    );
    if stats.damaged > 0 {
        println!("  {} file(s) restored with damaged content", stats.damaged);
    }
    if stats.skipped_existing > 0 {
        println!(
            "  {} file(s) not overwritten: restored content did not match",
            stats.skipped_existing
        );
    }
    if stats.failed > 0 {
        println!("  {} file(s) failed", stats.failed);
    }
    if stats.block_errors > 0 {
        println!("  {} block(s) could not be read", stats.block_errors);
    }
    if stats.interrupted {
        println!("  Interrupted before all files were restored");
    }
    Ok(())
}
