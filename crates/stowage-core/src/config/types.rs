use serde::{Deserialize, Serialize};

use stowage_types::block_hash::HashAlgorithm;
use stowage_types::error::{Result, StowageError};

use super::defaults::*;
use crate::compress::Compression;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StowageConfig {
    pub repository: RepositoryConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub volumes: VolumeConfig,
    #[serde(default)]
    pub compact: CompactConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Remote location. The bundled backend takes a local directory path.
    pub url: String,
    /// Upper bound on concurrently running volume uploads.
    #[serde(default = "default_max_in_flight_uploads")]
    pub max_in_flight_uploads: usize,
    /// Number of volumes the download producer may fetch ahead of the consumer.
    #[serde(default = "default_read_ahead")]
    pub read_ahead: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Path of the persisted volume catalog.
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Zstd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: CompressionAlgorithm,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            zstd_level: default_zstd_level(),
        }
    }
}

impl CompressionConfig {
    pub fn compression(&self) -> Compression {
        match self.algorithm {
            CompressionAlgorithm::None => Compression::None,
            CompressionAlgorithm::Lz4 => Compression::Lz4,
            CompressionAlgorithm::Zstd => Compression::Zstd {
                level: self.zstd_level,
            },
        }
    }
}

/// Which index volumes accompany new block volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexFilePolicy {
    /// No index volumes.
    None,
    /// Index volumes list the blocks of their block volume.
    Lookup,
    /// Like `Lookup`, and also carry the blocklists stored in the block volume.
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(default = "default_volume_prefix")]
    pub prefix: String,
    #[serde(
        default = "default_volume_size",
        deserialize_with = "deserialize_size"
    )]
    pub volume_size: u64,
    #[serde(default = "default_blocksize", deserialize_with = "deserialize_size")]
    pub blocksize: u64,
    #[serde(default = "default_hash_algorithm")]
    pub block_hash: HashAlgorithm,
    #[serde(default = "default_hash_algorithm")]
    pub file_hash: HashAlgorithm,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default = "default_index_policy")]
    pub index_policy: IndexFilePolicy,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            prefix: default_volume_prefix(),
            volume_size: default_volume_size(),
            blocksize: default_blocksize(),
            block_hash: default_hash_algorithm(),
            file_hash: default_hash_algorithm(),
            compression: CompressionConfig::default(),
            index_policy: default_index_policy(),
        }
    }
}

impl VolumeConfig {
    /// Number of child hashes a single blocklist block can hold.
    pub fn hashes_per_block(&self) -> u64 {
        self.blocksize / self.block_hash.hash_size() as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactConfig {
    /// Utilization cutoff in `(0, 1]`; volumes below it are compaction candidates.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Volumes at or below this remote size count as small.
    #[serde(
        default = "default_small_file_size",
        deserialize_with = "deserialize_size"
    )]
    pub small_file_size: u64,
    /// Compaction starts once more than this many small or sparse volumes exist.
    #[serde(default = "default_small_file_max_count")]
    pub small_file_max_count: usize,
    /// Write `<prefix>-verification.json` after a compaction that changed the remote.
    #[serde(default)]
    pub upload_verification_file: bool,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            small_file_size: default_small_file_size(),
            small_file_max_count: default_small_file_max_count(),
            upload_verification_file: false,
        }
    }
}

impl StowageConfig {
    /// Reject configurations that would make compaction or restore unsafe.
    pub fn validate(&self) -> Result<()> {
        validate_block_settings(self.volumes.blocksize, self.volumes.block_hash)?;
        if self.volumes.volume_size <= self.volumes.blocksize {
            return Err(StowageError::Config(format!(
                "volume size ({}) must be larger than the block size ({})",
                self.volumes.volume_size, self.volumes.blocksize
            )));
        }
        if self.volumes.prefix.is_empty() || self.volumes.prefix.contains(['-', '.', '/']) {
            return Err(StowageError::Config(format!(
                "invalid volume prefix '{}': must be non-empty without '-', '.' or '/'",
                self.volumes.prefix
            )));
        }
        validate_compact_settings(
            self.volumes.volume_size,
            self.compact.threshold,
            self.compact.small_file_size,
            self.compact.small_file_max_count,
        )?;
        if self.repository.max_in_flight_uploads == 0 {
            return Err(StowageError::Config(
                "max_in_flight_uploads must be at least 1".into(),
            ));
        }
        if self.repository.read_ahead == 0 {
            return Err(StowageError::Config("read_ahead must be at least 1".into()));
        }
        Ok(())
    }
}

/// Block size must be positive and hold a whole number of hashes.
pub fn validate_block_settings(blocksize: u64, block_hash: HashAlgorithm) -> Result<()> {
    let hash_size = block_hash.hash_size() as u64;
    if blocksize == 0 {
        return Err(StowageError::Config("block size must be positive".into()));
    }
    if blocksize < hash_size || blocksize % hash_size != 0 {
        return Err(StowageError::Config(format!(
            "block size ({blocksize}) must be a positive multiple of the {block_hash} hash size ({hash_size})"
        )));
    }
    Ok(())
}

/// All compaction scalars must be positive and the threshold a fraction.
pub fn validate_compact_settings(
    volume_size: u64,
    threshold: f64,
    small_file_size: u64,
    small_file_max_count: usize,
) -> Result<()> {
    if volume_size == 0 {
        return Err(StowageError::Config("volume size must be positive".into()));
    }
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(StowageError::Config(format!(
            "compact threshold must be in (0, 1], got {threshold}"
        )));
    }
    if small_file_size == 0 {
        return Err(StowageError::Config(
            "small file size must be positive".into(),
        ));
    }
    if small_file_max_count == 0 {
        return Err(StowageError::Config(
            "small file max count must be positive".into(),
        ));
    }
    Ok(())
}
