use serde::de::{self, Deserializer};
use serde::Deserialize;

use stowage_types::block_hash::HashAlgorithm;
use stowage_types::error::{Result, StowageError};

use super::types::{CompressionAlgorithm, IndexFilePolicy};

pub(super) fn default_volume_prefix() -> String {
    "stowage".to_string()
}

pub(super) fn default_volume_size() -> u64 {
    50 * 1024 * 1024 // 50 MiB
}

pub(super) fn default_blocksize() -> u64 {
    100 * 1024 // 100 KiB
}

pub(super) fn default_hash_algorithm() -> HashAlgorithm {
    HashAlgorithm::Sha256
}

pub(super) fn default_algorithm() -> CompressionAlgorithm {
    CompressionAlgorithm::Zstd
}

pub(super) fn default_zstd_level() -> i32 {
    3
}

pub(super) fn default_index_policy() -> IndexFilePolicy {
    IndexFilePolicy::Full
}

pub(super) fn default_threshold() -> f64 {
    0.75
}

pub(super) fn default_small_file_size() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}

pub(super) fn default_small_file_max_count() -> usize {
    20
}

pub(super) fn default_max_in_flight_uploads() -> usize {
    4
}

pub(super) fn default_read_ahead() -> usize {
    2
}

/// Parse a human-readable size like "50MiB", "100kb", "2g" or "4096".
///
/// Units are binary (`kb` and `kib` both mean 1024 bytes).
pub fn parse_size(raw: &str) -> Result<u64> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(StowageError::Config("size must not be empty".into()));
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(input.len());
    let (num_part, unit_part) = input.split_at(split);

    let value: f64 = num_part
        .parse()
        .map_err(|_| StowageError::Config(format!("invalid size: '{raw}'")))?;

    let multiplier: u64 = match unit_part.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        "t" | "tb" | "tib" => 1024 * 1024 * 1024 * 1024,
        other => {
            return Err(StowageError::Config(format!(
                "unsupported size suffix '{other}' in '{raw}'"
            )))
        }
    };

    Ok((value * multiplier as f64) as u64)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(u64),
    Text(String),
}

/// Accept either a plain byte count or a human size string.
pub(super) fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Bytes(n) => Ok(n),
        SizeValue::Text(s) => parse_size(&s).map_err(de::Error::custom),
    }
}
