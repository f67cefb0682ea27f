use std::fmt;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Blake2b512, Digest};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Result, StowageError};

type Blake2b256 = Blake2b<U32>;

/// Content digest identifying a block, a blocklist or a whole file.
///
/// The length depends on the configured [`HashAlgorithm`]. Ordering is byte
/// order of the digest; index files are sorted by the base64 text instead.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHash(pub Vec<u8>);

impl BlockHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        BlockHash(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Standard-alphabet, padded base64. This is the form used in index
    /// files and file lists.
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.0)
    }

    pub fn from_base64(text: &str) -> Result<Self> {
        BASE64_STANDARD
            .decode(text.trim())
            .map(BlockHash)
            .map_err(|e| StowageError::InvalidFormat(format!("invalid base64 hash '{text}': {e}")))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "BlockHash({})", &hex[..hex.len().min(16)])
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// Digest algorithm used for block and file hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "SHA256")]
    Sha256,
    #[serde(rename = "BLAKE2b-256")]
    Blake2b256,
    #[serde(rename = "BLAKE2b-512")]
    Blake2b512,
}

impl HashAlgorithm {
    /// Parse an algorithm name as written in options and config files.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "SHA256" | "SHA-256" => Ok(HashAlgorithm::Sha256),
            "BLAKE2B-256" | "BLAKE2B256" => Ok(HashAlgorithm::Blake2b256),
            "BLAKE2B-512" | "BLAKE2B512" => Ok(HashAlgorithm::Blake2b512),
            _ => Err(StowageError::Config(format!(
                "unsupported hash algorithm: '{name}'"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Blake2b256 => "BLAKE2b-256",
            HashAlgorithm::Blake2b512 => "BLAKE2b-512",
        }
    }

    /// Digest size in bytes.
    pub fn hash_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 | HashAlgorithm::Blake2b256 => 32,
            HashAlgorithm::Blake2b512 => 64,
        }
    }

    pub fn digest(&self, data: &[u8]) -> BlockHash {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn hasher(&self) -> FileHasher {
        match self {
            HashAlgorithm::Sha256 => FileHasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake2b256 => FileHasher::Blake2b256(Blake2b256::new()),
            HashAlgorithm::Blake2b512 => FileHasher::Blake2b512(Blake2b512::new()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Streaming hasher for one of the supported algorithms.
pub enum FileHasher {
    Sha256(Sha256),
    Blake2b256(Blake2b256),
    Blake2b512(Blake2b512),
}

impl FileHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            FileHasher::Sha256(h) => Digest::update(h, data),
            FileHasher::Blake2b256(h) => Digest::update(h, data),
            FileHasher::Blake2b512(h) => Digest::update(h, data),
        }
    }

    pub fn finalize(self) -> BlockHash {
        match self {
            FileHasher::Sha256(h) => BlockHash(h.finalize().to_vec()),
            FileHasher::Blake2b256(h) => BlockHash(h.finalize().to_vec()),
            FileHasher::Blake2b512(h) => BlockHash(h.finalize().to_vec()),
        }
    }
}
