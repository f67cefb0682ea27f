use serde::{Deserialize, Serialize};

use stowage_types::block_hash::BlockHash;
use stowage_types::error::{Result, StowageError};

use super::block::{FinishedVolume, VOLUME_HASH};
use super::VOLUME_HEADER_SIZE;
use crate::compress::{self, Compression};

/// Magic bytes at the start of every index volume.
pub const INDEX_VOLUME_MAGIC: &[u8; 8] = b"STOWIDX\0";
/// Index volume format version.
pub const INDEX_VOLUME_VERSION: u8 = 1;

/// Block listing of one block volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedVolume {
    pub name: String,
    pub blocks: Vec<(BlockHash, u32)>,
}

/// Serialized body of an index volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub volumes: Vec<IndexedVolume>,
    /// Blocklists stored in the described volumes: `(blocklist hash, child hashes)`.
    pub blocklists: Vec<(BlockHash, Vec<u8>)>,
}

/// Builds the index volume that accompanies a block volume.
pub struct IndexVolumeWriter {
    name: String,
    compression: Compression,
    doc: IndexDocument,
    current: Option<IndexedVolume>,
}

impl IndexVolumeWriter {
    pub fn new(name: String, compression: Compression) -> Self {
        Self {
            name,
            compression,
            doc: IndexDocument::default(),
            current: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Begin describing the block volume `volume_name`.
    pub fn start_volume(&mut self, volume_name: &str) {
        if let Some(done) = self.current.take() {
            self.doc.volumes.push(done);
        }
        self.current = Some(IndexedVolume {
            name: volume_name.to_string(),
            blocks: Vec::new(),
        });
    }

    pub fn add_block(&mut self, hash: &BlockHash, size: u32) -> Result<()> {
        let current = self.current.as_mut().ok_or_else(|| {
            StowageError::Other(format!(
                "index volume {}: add_block before start_volume",
                self.name
            ))
        })?;
        current.blocks.push((hash.clone(), size));
        Ok(())
    }

    pub fn write_blocklist(&mut self, hash: &BlockHash, data: &[u8]) {
        self.doc.blocklists.push((hash.clone(), data.to_vec()));
    }

    pub fn block_count(&self) -> usize {
        self.doc.volumes.iter().map(|v| v.blocks.len()).sum::<usize>()
            + self.current.as_ref().map_or(0, |v| v.blocks.len())
    }

    pub fn finish(mut self) -> Result<FinishedVolume> {
        if let Some(done) = self.current.take() {
            self.doc.volumes.push(done);
        }
        let body = rmp_serde::to_vec(&self.doc)?;
        let stored = compress::compress(self.compression, &body)?;

        let mut data = Vec::with_capacity(VOLUME_HEADER_SIZE + stored.len());
        data.extend_from_slice(INDEX_VOLUME_MAGIC);
        data.push(INDEX_VOLUME_VERSION);
        data.extend_from_slice(&stored);

        let hash = VOLUME_HASH.digest(&data);
        Ok(FinishedVolume {
            name: self.name,
            data,
            hash,
        })
    }
}

/// Parses index volumes.
pub struct IndexVolumeReader;

impl IndexVolumeReader {
    pub fn parse(data: &[u8], compression: Compression) -> Result<IndexDocument> {
        if data.len() < VOLUME_HEADER_SIZE + 1 {
            return Err(StowageError::InvalidFormat("index volume too small".into()));
        }
        if &data[..8] != INDEX_VOLUME_MAGIC {
            return Err(StowageError::InvalidFormat("invalid index volume magic".into()));
        }
        if data[8] != INDEX_VOLUME_VERSION {
            return Err(StowageError::InvalidFormat(format!(
                "unsupported index volume version {}",
                data[8]
            )));
        }
        let body = compress::decompress_expect(compression, &data[VOLUME_HEADER_SIZE..])?;
        Ok(rmp_serde::from_slice(&body)?)
    }
}
