use std::path::{Path, PathBuf};

use stowage_core::restore::build_index_file;
use stowage_types::error::StowageError;

pub(crate) const DEFAULT_INDEX_FILE: &str = "index.txt";

/// `--indexfile` or the default file inside `folder`.
pub(crate) fn index_path(folder: &Path, index_file: Option<&str>) -> PathBuf {
    index_file.map_or_else(|| folder.join(DEFAULT_INDEX_FILE), PathBuf::from)
}

pub(crate) fn run_index(
    folder: &str,
    index_file: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let folder = Path::new(folder);
    if !folder.is_dir() {
        return Err(StowageError::Config(format!("folder not found: {}", folder.display())).into());
    }
    let output = index_path(folder, index_file);
    let count = build_index_file(folder, &output)?;
    println!("Indexed {count} block(s) into {}", output.display());
    Ok(())
}
