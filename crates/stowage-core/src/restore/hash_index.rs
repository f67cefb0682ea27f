use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use stowage_types::block_hash::BlockHash;
use stowage_types::error::{Result, StowageError};

use super::archive_cache::ArchiveCache;
use crate::compress::Compression;
use crate::volume::{BlockVolumeReader, VolumeKind, VolumeName};

/// Upper bound on the number of entries in the in-memory lookup table.
pub const LOOKUP_TABLE_SIZE: usize = 2048;

/// Longest accepted index line, separator included.
const MAX_LINE_LEN: u64 = 1024;

const SEPARATOR: &str = ", ";

/// Where a block lives according to the index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocation {
    /// File name of the block volume holding the block.
    pub volume: String,
    /// Byte offset of the matching line in the index file.
    pub offset: u64,
}

struct IndexLine {
    offset: u64,
    key: String,
    volume: String,
}

/// Line reader over the index file that tracks the byte offset of each line.
struct LineReader {
    reader: BufReader<File>,
    pos: u64,
    buf: Vec<u8>,
}

impl LineReader {
    fn seek(&mut self, offset: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.pos = offset;
        Ok(())
    }

    /// Next non-blank line, or `None` at end of file.
    fn next_line(&mut self) -> Result<Option<IndexLine>> {
        loop {
            let offset = self.pos;
            self.buf.clear();
            let read = (&mut self.reader)
                .take(MAX_LINE_LEN + 1)
                .read_until(b'\n', &mut self.buf)?;
            if read == 0 {
                return Ok(None);
            }
            self.pos += read as u64;

            let terminated = self.buf.last() == Some(&b'\n');
            if !terminated && read as u64 > MAX_LINE_LEN {
                return Err(StowageError::InvalidFormat(format!(
                    "index line at offset {offset} exceeds {MAX_LINE_LEN} bytes"
                )));
            }

            let mut line = self.buf.as_slice();
            if let Some(rest) = line.strip_suffix(b"\n") {
                line = rest;
            }
            if let Some(rest) = line.strip_suffix(b"\r") {
                line = rest;
            }
            if line.is_empty() {
                continue;
            }

            let text = std::str::from_utf8(line).map_err(|_| {
                StowageError::InvalidFormat(format!("index line at offset {offset} is not UTF-8"))
            })?;
            let (key, volume) = text.split_once(SEPARATOR).ok_or_else(|| {
                StowageError::InvalidFormat(format!(
                    "failed to parse index line at offset {offset}: '{text}'"
                ))
            })?;
            return Ok(Some(IndexLine {
                offset,
                key: key.to_string(),
                volume: volume.to_string(),
            }));
        }
    }
}

/// Disk-backed lookup from block hash to block volume.
///
/// The index file holds `"<base64 hash>, <volume file name>"` lines sorted
/// by hash text. Only a sparse sample of at most [`LOOKUP_TABLE_SIZE`] hashes
/// is kept in memory; a lookup binary-searches the sample and scans forward
/// in the file from there.
pub struct HashIndex {
    path: PathBuf,
    lines: LineReader,
    hash_size: usize,
    distinct: u64,
    lookup: Vec<String>,
    offsets: Vec<u64>,
}

impl HashIndex {
    /// Scan the index file twice: once to count distinct hashes, once to
    /// sample the lookup table.
    pub fn build(path: &Path, hash_size: usize) -> Result<Self> {
        if hash_size == 0 {
            return Err(StowageError::Config("hash size must be positive".into()));
        }
        let file = File::open(path).map_err(|e| {
            StowageError::Config(format!("cannot open index file {}: {e}", path.display()))
        })?;
        let mut lines = LineReader {
            reader: BufReader::new(file),
            pos: 0,
            buf: Vec::with_capacity(128),
        };

        let mut distinct = 0u64;
        let mut prev: Option<String> = None;
        while let Some(line) = lines.next_line()? {
            if prev.as_deref() == Some(line.key.as_str()) {
                continue;
            }
            if prev.as_deref().is_some_and(|p| p > line.key.as_str()) {
                return Err(StowageError::InvalidFormat(format!(
                    "index file is not sorted at offset {}",
                    line.offset
                )));
            }
            distinct += 1;
            prev = Some(line.key);
        }
        info!(hashes = distinct, "index file has {distinct} hashes in total");

        let step = lookup_step(distinct);
        let mut lookup = Vec::new();
        let mut offsets = Vec::new();
        if step > 0 {
            lines.seek(0)?;
            let mut prev: Option<String> = None;
            let mut seen = 0u64;
            while let Some(line) = lines.next_line()? {
                if prev.as_deref() == Some(line.key.as_str()) {
                    continue;
                }
                if seen % step == 0 {
                    lookup.push(line.key.clone());
                    offsets.push(line.offset);
                }
                seen += 1;
                prev = Some(line.key);
            }
        }
        debug!(
            entries = lookup.len(),
            step, "built lookup table for {}",
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            lines,
            hash_size,
            distinct,
            lookup,
            offsets,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of distinct hashes in the index file.
    pub fn distinct_hashes(&self) -> u64 {
        self.distinct
    }

    pub fn lookup_table_len(&self) -> usize {
        self.lookup.len()
    }

    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    /// Locate the volume holding `hash`.
    pub fn resolve(&mut self, hash: &BlockHash) -> Result<BlockLocation> {
        self.resolve_key(&hash.to_base64())
    }

    /// Locate the volume holding the block whose base64 hash is `key`.
    pub fn resolve_key(&mut self, key: &str) -> Result<BlockLocation> {
        if self.lookup.is_empty() {
            return Err(StowageError::BlockNotFound(key.to_string()));
        }
        // Last sampled entry not greater than the key; the first one when
        // the key sorts before every sample.
        let idx = self
            .lookup
            .partition_point(|sample| sample.as_str() <= key)
            .saturating_sub(1);

        self.lines.seek(self.offsets[idx])?;
        while let Some(line) = self.lines.next_line()? {
            match line.key.as_str().cmp(key) {
                std::cmp::Ordering::Equal => {
                    return Ok(BlockLocation {
                        volume: line.volume,
                        offset: line.offset,
                    })
                }
                std::cmp::Ordering::Greater => break,
                std::cmp::Ordering::Less => {}
            }
        }
        Err(StowageError::BlockNotFound(key.to_string()))
    }

    /// Read the block `hash` into `buf` through the archive cache.
    pub fn read_block(
        &mut self,
        hash: &BlockHash,
        cache: &mut ArchiveCache,
        buf: &mut Vec<u8>,
    ) -> Result<usize> {
        let location = self.resolve(hash)?;
        cache.read_block(&location.volume, hash, buf)
    }

    /// Child block hashes listed by the blocklist `hash`, in stored order.
    pub fn expand_blocklist(
        &mut self,
        hash: &BlockHash,
        cache: &mut ArchiveCache,
    ) -> Result<Vec<BlockHash>> {
        let mut buf = Vec::new();
        self.read_block(hash, cache, &mut buf)?;
        if buf.len() % self.hash_size != 0 {
            return Err(StowageError::InvalidFormat(format!(
                "blocklist {hash} has {} bytes, not a multiple of the hash size {}",
                buf.len(),
                self.hash_size
            )));
        }
        Ok(buf
            .chunks_exact(self.hash_size)
            .map(BlockHash::from_bytes)
            .collect())
    }
}

/// Distinct-hash interval between sampled entries; `0` for an empty index.
fn lookup_step(distinct: u64) -> u64 {
    if distinct == 0 {
        return 0;
    }
    let entries = distinct.min(LOOKUP_TABLE_SIZE as u64);
    distinct.div_ceil(entries)
}

/// Write the index file for every block volume found in `folder`.
///
/// Each stored block produces one `"<base64 hash>, <volume>"` line; the file
/// is sorted and written atomically. Returns the number of lines written.
pub fn build_index_file(folder: &Path, output: &Path) -> Result<usize> {
    let mut names: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        match VolumeName::parse(&name) {
            Ok(parsed) if parsed.kind == VolumeKind::Blocks => names.push(name),
            _ => debug!(file = %name, "skipping non block volume"),
        }
    }
    names.sort();

    let mut lines: Vec<(String, String)> = Vec::new();
    for name in &names {
        let compression = VolumeName::parse(name)
            .map(|n| n.compression)
            .unwrap_or(Compression::None);
        let file = File::open(folder.join(name))?;
        let reader = BlockVolumeReader::open(BufReader::new(file), compression)?;
        let before = lines.len();
        lines.extend(reader.blocks().map(|(hash, _)| (hash.to_base64(), name.clone())));
        debug!(volume = %name, blocks = lines.len() - before, "indexed block volume");
    }
    lines.sort();
    lines.dedup();

    let dir = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut out = std::io::BufWriter::new(tmp.as_file_mut());
        for (key, volume) in &lines {
            writeln!(out, "{key}{SEPARATOR}{volume}")?;
        }
        out.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(output).map_err(|e| e.error)?;

    info!(
        volumes = names.len(),
        lines = lines.len(),
        "wrote index file {}",
        output.display()
    );
    Ok(lines.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_index(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("index.txt");
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn step_caps_table_size() {
        assert_eq!(lookup_step(0), 0);
        assert_eq!(lookup_step(1), 1);
        assert_eq!(lookup_step(2048), 1);
        assert_eq!(lookup_step(2049), 2);
        assert_eq!(lookup_step(10_000), 5);
        for n in [1u64, 7, 2047, 2048, 2049, 4097, 100_000] {
            let step = lookup_step(n);
            assert!(n.div_ceil(step) <= LOOKUP_TABLE_SIZE as u64, "n={n}");
        }
    }

    #[test]
    fn resolves_keys_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_index(
            dir.path(),
            "AAAA, vol-1\r\nBBBB, vol-1\n\nBBBB, vol-2\nCCCC, vol-3\n",
        );
        let mut index = HashIndex::build(&path, 3).unwrap();
        assert_eq!(index.distinct_hashes(), 3);

        assert_eq!(index.resolve_key("AAAA").unwrap().volume, "vol-1");
        assert_eq!(index.resolve_key("BBBB").unwrap().volume, "vol-1");
        assert_eq!(index.resolve_key("CCCC").unwrap().volume, "vol-3");
        for missing in ["0000", "ABBB", "ZZZZ"] {
            assert!(matches!(
                index.resolve_key(missing),
                Err(StowageError::BlockNotFound(_))
            ));
        }
    }

    #[test]
    fn line_offsets_point_at_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_index(dir.path(), "AAAA, a\nBBBB, b\n");
        let mut index = HashIndex::build(&path, 3).unwrap();
        assert_eq!(index.resolve_key("AAAA").unwrap().offset, 0);
        assert_eq!(index.resolve_key("BBBB").unwrap().offset, 8);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_index(dir.path(), "AAAA vol-1\n");
        assert!(matches!(
            HashIndex::build(&path, 3),
            Err(StowageError::InvalidFormat(_))
        ));

        let long = format!("{}, v\n", "A".repeat(2000));
        let path = write_index(dir.path(), &long);
        assert!(matches!(
            HashIndex::build(&path, 3),
            Err(StowageError::InvalidFormat(_))
        ));

        let path = write_index(dir.path(), "BBBB, v\nAAAA, v\n");
        assert!(matches!(
            HashIndex::build(&path, 3),
            Err(StowageError::InvalidFormat(_))
        ));
    }

    #[test]
    fn empty_index_finds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_index(dir.path(), "");
        let mut index = HashIndex::build(&path, 32).unwrap();
        assert_eq!(index.lookup_table_len(), 0);
        assert!(index.resolve_key("AAAA").is_err());
    }
}
