use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "stowage",
    version,
    about = "Compaction and recovery for a deduplicated volume store",
    after_help = "\
Configuration file lookup order (compact, verify):
  1. --config <path>                 (explicit flag)
  2. $STOWAGE_CONFIG                 (environment variable)
  3. ./stowage.yaml                  (project)
  4. $XDG_CONFIG_HOME/stowage/config.yaml or ~/.config/stowage/config.yaml
  5. /etc/stowage/config.yaml

The index and restore commands work on a folder of downloaded volumes and
need no configuration file.

Exit status 100 means the command could not start: missing folder or index
file, invalid block size or hash algorithm, or an invalid configuration."
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides STOWAGE_CONFIG and default search)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Repack sparse volumes and delete unused ones
    Compact {
        /// Only report what would be done
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Check the remote listing against the catalog
    Verify {
        /// Report disagreements instead of failing on them
        #[arg(long)]
        relaxed: bool,
    },

    /// Build the sorted hash index of a folder of block volumes
    Index {
        /// Folder holding downloaded block volumes
        folder: String,

        /// Where to write the index (default: <folder>/index.txt)
        #[arg(long = "indexfile")]
        index_file: Option<String>,
    },

    /// Restore files from a folder of downloaded volumes
    Restore {
        /// Folder holding block volumes and file lists
        folder: String,

        /// File list to restore: index (0 is newest) or timestamp
        fileset: Option<String>,

        /// Hash index built by the index command (default: <folder>/index.txt)
        #[arg(long = "indexfile")]
        index_file: Option<String>,

        /// Restore below this folder instead of the original locations
        #[arg(long = "targetpath")]
        target_path: Option<String>,

        /// Block size the backup was made with (e.g. 100KiB)
        #[arg(long, default_value = "100KiB")]
        blocksize: String,

        /// Block hash algorithm the backup was made with
        #[arg(long = "block-hash-algorithm", default_value = "SHA256")]
        block_hash_algorithm: String,

        /// File hash algorithm the backup was made with
        #[arg(long = "file-hash-algorithm", default_value = "SHA256")]
        file_hash_algorithm: String,

        /// Only restore paths matching this glob pattern
        #[arg(long)]
        filter: Option<String>,
    },
}

impl Commands {
    /// Whether the command reads the configuration file.
    pub(crate) fn needs_config(&self) -> bool {
        matches!(self, Self::Compact { .. } | Self::Verify { .. })
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Compact { .. } => "compact",
            Self::Verify { .. } => "verify",
            Self::Index { .. } => "index",
            Self::Restore { .. } => "restore",
        }
    }
}
