use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use stowage_types::block_hash::{BlockHash, HashAlgorithm};
use stowage_types::error::{Result, StowageError};
use stowage_types::volume_id::VolumeId;

use crate::backend::TransferPipeline;
use crate::catalog::{Catalog, VolumeState};
use crate::compress::Compression;
use crate::storage::StorageBackend;
use crate::volume::{BlockVolumeWriter, IndexVolumeWriter, VolumeKind, VolumeName};

pub const TEST_PREFIX: &str = "stowage";

/// Remote held in memory, keyed by volume name.
#[derive(Default)]
pub struct MemoryBackend {
    volumes: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> T) -> T {
        f(&mut self.volumes.lock().unwrap())
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.with(|v| v.get(key).cloned()))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.with(|v| v.insert(key.to_owned(), data.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with(|v| v.remove(key));
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.with(|v| v.contains_key(key)))
    }

    /// Names come back sorted since the map is ordered.
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.with(|v| {
            v.range(prefix.to_owned()..)
                .map(|(name, _)| name)
                .take_while(|name| name.starts_with(prefix))
                .cloned()
                .collect()
        }))
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.with(|v| v.get(key).map(|d| d.len() as u64)))
    }
}

/// Storage wrapper that logs `get`, `put` and `delete` calls as
/// `"<op>:<key>"` and can be told to fail uploads.
pub struct RecordingBackend {
    inner: MemoryBackend,
    log: Mutex<Vec<String>>,
    fail_puts: AtomicBool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            log: Mutex::new(Vec::new()),
            fail_puts: AtomicBool::new(false),
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Logged operations of one kind (`"get"`, `"put"`, `"delete"`), keys only.
    pub fn ops_of(&self, op: &str) -> Vec<String> {
        let tag = format!("{op}:");
        self.ops()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix(&tag).map(str::to_string))
            .collect()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Overwrite an object without logging, e.g. to corrupt it.
    pub fn put_raw(&self, key: &str, data: &[u8]) {
        self.inner.put(key, data).unwrap();
    }

    fn record(&self, op: &str, key: &str) {
        self.log.lock().unwrap().push(format!("{op}:{key}"));
    }
}

impl StorageBackend for RecordingBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.record("get", key);
        self.inner.get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.record("put", key);
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StowageError::Other(format!("injected put failure: {key}")));
        }
        self.inner.put(key, data)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.record("delete", key);
        self.inner.delete(key)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        self.inner.size(key)
    }
}

/// Deterministic block content of exactly `len` bytes.
pub fn block_data(tag: &str, i: usize, len: usize) -> Vec<u8> {
    let pattern = format!("{tag}:{i};");
    pattern.bytes().cycle().take(len).collect()
}

pub fn block_hash(data: &[u8]) -> BlockHash {
    HashAlgorithm::Sha256.digest(data)
}

/// A block volume written by [`TestStore::add_volume`].
#[derive(Debug, Clone)]
pub struct StoredVolume {
    pub id: VolumeId,
    pub name: String,
    pub hashes: Vec<BlockHash>,
}

/// A catalog and a recording backend kept in step, as after a backup.
pub struct TestStore {
    pub backend: Arc<RecordingBackend>,
    pub catalog: Catalog,
    pub compression: Compression,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_catalog(Catalog::in_memory())
    }

    pub fn with_catalog(catalog: Catalog) -> Self {
        Self {
            backend: Arc::new(RecordingBackend::new()),
            catalog,
            compression: Compression::None,
        }
    }

    pub fn pipeline(&self) -> TransferPipeline {
        let backend: Arc<dyn StorageBackend> = self.backend.clone();
        TransferPipeline::new(backend, 2, 2)
    }

    /// Upload a block volume holding `blocks` and record it as `Uploaded`.
    /// Blocks already known to the catalog are recorded as extra copies.
    pub fn add_volume(&mut self, blocks: &[Vec<u8>]) -> StoredVolume {
        let name =
            VolumeName::generate(TEST_PREFIX, VolumeKind::Blocks, self.compression).file_name();
        let id = self
            .catalog
            .register_remote_volume(&name, VolumeKind::Blocks, VolumeState::Temporary)
            .unwrap();

        let mut writer = BlockVolumeWriter::new(name.clone(), self.compression);
        let mut hashes = Vec::with_capacity(blocks.len());
        for data in blocks {
            let hash = block_hash(data);
            writer.add_block(&hash, data).unwrap();
            let size = data.len() as u32;
            if !self.catalog.register_block(&hash, size, id).unwrap() {
                self.catalog.register_duplicated_block(&hash, size, id).unwrap();
            }
            hashes.push(hash);
        }

        let sealed = writer.finish().unwrap();
        self.backend.put_raw(&sealed.name, &sealed.data);
        self.catalog
            .update_remote_volume(&name, VolumeState::Uploaded, sealed.size() as i64, Some(sealed.hash))
            .unwrap();
        StoredVolume { id, name, hashes }
    }

    /// Upload an index volume describing `volume` and link the two.
    pub fn add_index_volume(&mut self, volume: &StoredVolume) -> String {
        let name =
            VolumeName::generate(TEST_PREFIX, VolumeKind::Index, self.compression).file_name();
        let id = self
            .catalog
            .register_remote_volume(&name, VolumeKind::Index, VolumeState::Temporary)
            .unwrap();
        self.catalog.add_index_block_link(id, volume.id).unwrap();

        let mut writer = IndexVolumeWriter::new(name.clone(), self.compression);
        writer.start_volume(&volume.name);
        for hash in &volume.hashes {
            let size = self.catalog.block(hash).map_or(0, |b| b.size);
            writer.add_block(hash, size).unwrap();
        }
        let sealed = writer.finish().unwrap();
        self.backend.put_raw(&sealed.name, &sealed.data);
        self.catalog
            .update_remote_volume(&name, VolumeState::Uploaded, sealed.size() as i64, Some(sealed.hash))
            .unwrap();
        name
    }

    /// Reference `hashes` from a new blockset, as a file in a snapshot would.
    pub fn reference(&mut self, hashes: &[BlockHash]) -> BlockHash {
        let mut hasher = HashAlgorithm::Sha256.hasher();
        hasher.update(b"blockset");
        for hash in hashes {
            hasher.update(hash.as_bytes());
        }
        let full = hasher.finalize();
        let length = hashes
            .iter()
            .filter_map(|h| self.catalog.block(h))
            .map(|b| b.size as u64)
            .sum();
        self.catalog
            .register_blockset(&full, length, hashes.to_vec(), Vec::new())
            .unwrap();
        full
    }

    /// Reference `hashes` and drop the reference again, leaving the blocks
    /// unreferenced the way a pruned snapshot does.
    pub fn release(&mut self, hashes: &[BlockHash]) {
        let full = self.reference(hashes);
        self.catalog.release_blockset(&full).unwrap();
    }

    pub fn commit(&mut self) {
        self.catalog.commit("test").unwrap();
    }
}
