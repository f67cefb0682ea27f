use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};

use serde::{Deserialize, Serialize};

use stowage_types::block_hash::{BlockHash, HashAlgorithm};
use stowage_types::error::{Result, StowageError};

use super::VOLUME_HEADER_SIZE;
use crate::compress::{self, Compression};

/// Magic bytes at the start of every block volume.
pub const BLOCK_VOLUME_MAGIC: &[u8; 8] = b"STOWBLK\0";
/// Block volume format version.
pub const BLOCK_VOLUME_VERSION: u8 = 1;

/// Algorithm used for whole-volume hashes recorded in the catalog.
pub const VOLUME_HASH: HashAlgorithm = HashAlgorithm::Sha256;

/// One entry in the volume's trailing table. Describes a single block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEntry {
    pub hash: BlockHash,
    /// Decoded block size.
    pub size: u32,
    /// Offset of the stored bytes, past the 4-byte length prefix.
    pub offset: u64,
    /// Stored (compressed) length.
    pub length: u32,
}

/// A sealed volume ready for upload.
#[derive(Debug)]
pub struct FinishedVolume {
    pub name: String,
    pub data: Vec<u8>,
    pub hash: BlockHash,
}

impl FinishedVolume {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Accumulates compressed blocks for one remote volume.
///
/// Layout: `magic | version | ([u32 LE len][block])* | rmp trailer | u32 LE trailer len`.
pub struct BlockVolumeWriter {
    name: String,
    compression: Compression,
    bytes: Vec<u8>,
    entries: Vec<BlockEntry>,
    seen: HashSet<BlockHash>,
}

impl BlockVolumeWriter {
    pub fn new(name: String, compression: Compression) -> Self {
        let mut bytes = Vec::with_capacity(VOLUME_HEADER_SIZE);
        bytes.extend_from_slice(BLOCK_VOLUME_MAGIC);
        bytes.push(BLOCK_VOLUME_VERSION);
        Self {
            name,
            compression,
            bytes,
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Append a block. Returns `false` without writing when the volume
    /// already holds a block with this hash.
    pub fn add_block(&mut self, hash: &BlockHash, data: &[u8]) -> Result<bool> {
        if self.seen.contains(hash) {
            return Ok(false);
        }
        let size = u32::try_from(data.len())
            .map_err(|_| StowageError::Other(format!("block {hash:?} too large")))?;
        let stored = compress::compress(self.compression, data)?;
        let length = u32::try_from(stored.len())
            .map_err(|_| StowageError::Other(format!("block {hash:?} too large")))?;

        let offset = self.bytes.len() as u64 + 4;
        self.bytes.extend_from_slice(&length.to_le_bytes());
        self.bytes.extend_from_slice(&stored);

        self.seen.insert(hash.clone());
        self.entries.push(BlockEntry {
            hash: hash.clone(),
            size,
            offset,
            length,
        });
        Ok(true)
    }

    /// Bytes written so far, excluding the trailer.
    pub fn filesize(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hash, decoded size)` of every block in write order.
    pub fn blocks(&self) -> impl Iterator<Item = (&BlockHash, u32)> {
        self.entries.iter().map(|e| (&e.hash, e.size))
    }

    /// Append the trailer and hash the finished file.
    pub fn finish(mut self) -> Result<FinishedVolume> {
        let trailer = rmp_serde::to_vec(&self.entries)?;
        let trailer_len = u32::try_from(trailer.len())
            .map_err(|_| StowageError::Other("block volume trailer too large".into()))?;
        self.bytes.extend_from_slice(&trailer);
        self.bytes.extend_from_slice(&trailer_len.to_le_bytes());

        let hash = VOLUME_HASH.digest(&self.bytes);
        Ok(FinishedVolume {
            name: self.name,
            data: self.bytes,
            hash,
        })
    }
}

/// Random-access reader over a block volume held in any seekable source.
pub struct BlockVolumeReader<R> {
    reader: R,
    compression: Compression,
    entries: Vec<BlockEntry>,
    lookup: HashMap<BlockHash, usize>,
    scratch: Vec<u8>,
}

impl<R: Read + Seek> BlockVolumeReader<R> {
    /// Validate the header and load the block table from the trailer.
    pub fn open(mut reader: R, compression: Compression) -> Result<Self> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        if file_len < (VOLUME_HEADER_SIZE + 4) as u64 {
            return Err(StowageError::InvalidFormat("block volume too small".into()));
        }

        reader.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; VOLUME_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        if &header[..8] != BLOCK_VOLUME_MAGIC {
            return Err(StowageError::InvalidFormat("invalid block volume magic".into()));
        }
        if header[8] != BLOCK_VOLUME_VERSION {
            return Err(StowageError::InvalidFormat(format!(
                "unsupported block volume version {}",
                header[8]
            )));
        }

        reader.seek(SeekFrom::End(-4))?;
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let trailer_len = u32::from_le_bytes(len_bytes) as u64;
        let blocks_end = file_len - 4;
        if trailer_len > blocks_end - VOLUME_HEADER_SIZE as u64 {
            return Err(StowageError::InvalidFormat(
                "invalid block volume trailer length".into(),
            ));
        }
        let trailer_start = blocks_end - trailer_len;

        reader.seek(SeekFrom::Start(trailer_start))?;
        let mut trailer = vec![0u8; trailer_len as usize];
        reader.read_exact(&mut trailer)?;
        let entries: Vec<BlockEntry> = rmp_serde::from_slice(&trailer)?;

        let mut lookup = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if entry.offset + entry.length as u64 > trailer_start {
                return Err(StowageError::InvalidFormat(format!(
                    "block {:?} extends past the block area",
                    entry.hash
                )));
            }
            lookup.entry(entry.hash.clone()).or_insert(i);
        }

        Ok(Self {
            reader,
            compression,
            entries,
            lookup,
            scratch: Vec::new(),
        })
    }

    /// `(hash, decoded size)` of every stored block in stored order.
    pub fn blocks(&self) -> impl Iterator<Item = (&BlockHash, u32)> {
        self.entries.iter().map(|e| (&e.hash, e.size))
    }

    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.lookup.contains_key(hash)
    }

    /// Decode a block into `buf` (replacing its contents) and return its length.
    pub fn read_block(&mut self, hash: &BlockHash, buf: &mut Vec<u8>) -> Result<usize> {
        let idx = *self
            .lookup
            .get(hash)
            .ok_or_else(|| StowageError::BlockNotFound(hash.to_base64()))?;
        let entry = &self.entries[idx];

        self.reader.seek(SeekFrom::Start(entry.offset))?;
        self.scratch.resize(entry.length as usize, 0);
        self.reader.read_exact(&mut self.scratch)?;

        let decoded = compress::decompress_expect(self.compression, &self.scratch)?;
        if decoded.len() != entry.size as usize {
            return Err(StowageError::SizeMismatch {
                hash: hash.to_base64(),
                expected: entry.size as u64,
                actual: decoded.len() as u64,
            });
        }
        buf.clear();
        buf.extend_from_slice(&decoded);
        Ok(decoded.len())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn hash(data: &[u8]) -> BlockHash {
        HashAlgorithm::Sha256.digest(data)
    }

    #[test]
    fn written_blocks_read_back_in_order() {
        let mut writer = BlockVolumeWriter::new("v".into(), Compression::Lz4);
        let blocks: Vec<&[u8]> = vec![b"alpha", b"bravo-bravo", b"charlie"];
        for data in &blocks {
            assert!(writer.add_block(&hash(data), data).unwrap());
        }
        let finished = writer.finish().unwrap();
        assert_eq!(finished.hash, VOLUME_HASH.digest(&finished.data));

        let mut reader =
            BlockVolumeReader::open(Cursor::new(finished.data), Compression::Lz4).unwrap();
        let listed: Vec<_> = reader.blocks().map(|(h, s)| (h.clone(), s)).collect();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[1], (hash(b"bravo-bravo"), 11));

        let mut buf = Vec::new();
        for data in &blocks {
            let n = reader.read_block(&hash(data), &mut buf).unwrap();
            assert_eq!(n, data.len());
            assert_eq!(&buf[..], *data);
        }
    }

    #[test]
    fn duplicate_hashes_are_stored_once() {
        let mut writer = BlockVolumeWriter::new("v".into(), Compression::None);
        assert!(writer.add_block(&hash(b"x"), b"x").unwrap());
        let size = writer.filesize();
        assert!(!writer.add_block(&hash(b"x"), b"x").unwrap());
        assert_eq!(writer.filesize(), size);
        assert_eq!(writer.block_count(), 1);
    }

    #[test]
    fn missing_block_is_block_not_found() {
        let mut writer = BlockVolumeWriter::new("v".into(), Compression::None);
        writer.add_block(&hash(b"x"), b"x").unwrap();
        let data = writer.finish().unwrap().data;
        let mut reader = BlockVolumeReader::open(Cursor::new(data), Compression::None).unwrap();
        let mut buf = Vec::new();
        assert!(matches!(
            reader.read_block(&hash(b"y"), &mut buf),
            Err(StowageError::BlockNotFound(_))
        ));
    }

    #[test]
    fn wrong_codec_is_rejected_on_read() {
        let mut writer = BlockVolumeWriter::new("v".into(), Compression::Lz4);
        writer.add_block(&hash(b"x"), b"x").unwrap();
        let data = writer.finish().unwrap().data;
        let mut reader = BlockVolumeReader::open(Cursor::new(data), Compression::None).unwrap();
        let mut buf = Vec::new();
        assert!(matches!(
            reader.read_block(&hash(b"x"), &mut buf),
            Err(StowageError::Decompression(_))
        ));
    }

    #[test]
    fn corrupt_volumes_are_rejected() {
        assert!(BlockVolumeReader::open(Cursor::new(vec![0u8; 4]), Compression::None).is_err());

        let mut writer = BlockVolumeWriter::new("v".into(), Compression::None);
        writer.add_block(&hash(b"x"), b"x").unwrap();
        let mut data = writer.finish().unwrap().data;
        data[0] = b'X';
        assert!(matches!(
            BlockVolumeReader::open(Cursor::new(data), Compression::None),
            Err(StowageError::InvalidFormat(_))
        ));
    }
}
