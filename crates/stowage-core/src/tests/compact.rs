use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stowage_types::block_hash::{BlockHash, HashAlgorithm};
use stowage_types::error::{Result, StowageError};

use crate::backend::{verification_file_name, TransferPipeline, VerificationEntry};
use crate::catalog::{BlockSettings, Catalog, VolumeState};
use crate::compact::{self, plan, CompactOptions, CompactReport};
use crate::compress::Compression;
use crate::config::IndexFilePolicy;
use crate::storage::StorageBackend;
use crate::testutil::{block_data, block_hash, StoredVolume, TestStore, TEST_PREFIX};
use crate::volume::block::VOLUME_HASH;
use crate::volume::{BlockVolumeReader, IndexVolumeReader, VolumeKind};

const KB: u64 = 1024;

fn options() -> CompactOptions {
    CompactOptions {
        prefix: TEST_PREFIX.into(),
        volume_size: 16 * KB,
        blocksize: KB,
        block_hash: HashAlgorithm::Sha256,
        hashes_per_block: 32,
        compression: Compression::None,
        index_policy: IndexFilePolicy::Lookup,
        dry_run: false,
        remote_verified: false,
        upload_verification_file: false,
    }
}

fn plan_default(catalog: &Catalog) -> CompactReport {
    plan(catalog, 16 * KB, 0.75, KB, 4).unwrap()
}

/// Five volumes of ten 1 KiB blocks, four of each still referenced.
fn fill_sparse(store: &mut TestStore) -> (Vec<StoredVolume>, Vec<BlockHash>) {
    let mut volumes = Vec::new();
    let mut live = Vec::new();
    for v in 0..5 {
        let blocks: Vec<Vec<u8>> = (0..10)
            .map(|i| block_data(&format!("v{v}"), i, KB as usize))
            .collect();
        let volume = store.add_volume(&blocks);
        live.extend(volume.hashes[..4].iter().cloned());
        store.release(&volume.hashes[4..]);
        volumes.push(volume);
    }
    store.reference(&live);
    store.commit();
    (volumes, live)
}

fn new_block_volumes(store: &TestStore, old: &[StoredVolume]) -> Vec<String> {
    let old: HashSet<&str> = old.iter().map(|v| v.name.as_str()).collect();
    store
        .catalog
        .remote_volumes(&[VolumeState::Uploaded, VolumeState::Verified])
        .into_iter()
        .filter(|v| v.kind == VolumeKind::Blocks && !old.contains(v.name.as_str()))
        .map(|v| v.name)
        .collect()
}

fn stored_hashes(store: &TestStore, names: &[String]) -> HashSet<BlockHash> {
    let mut hashes = HashSet::new();
    for name in names {
        let data = store.backend.get(name).unwrap().unwrap();
        let reader = BlockVolumeReader::open(Cursor::new(data), Compression::None).unwrap();
        hashes.extend(reader.blocks().map(|(h, _)| h.clone()));
    }
    hashes
}

#[test]
fn planning_twice_gives_the_same_report() {
    let mut store = TestStore::new();
    fill_sparse(&mut store);
    let first = plan_default(&store.catalog);
    let second = plan_default(&store.catalog);
    assert_eq!(first, second);
}

#[test]
fn small_backup_is_compacted_into_few_volumes() {
    let mut store = TestStore::new();
    let (sources, live) = fill_sparse(&mut store);

    let report = plan_default(&store.catalog);
    assert!(report.should_compact);
    assert!(!report.should_reclaim);
    assert_eq!(report.compactable_volumes.len(), 5);

    let mut pipeline = store.pipeline();
    let outcome =
        compact::run(&mut store.catalog, &mut pipeline, &report, &options(), None).unwrap();

    assert_eq!(outcome.downloaded_count, 5);
    assert_eq!(outcome.blocks_examined, 50);
    assert_eq!(outcome.blocks_unreferenced, 30);
    assert_eq!(
        outcome.blocks_migrated + outcome.blocks_satisfied_elsewhere,
        live.len() as u64
    );
    assert!(outcome.degraded_volumes.is_empty());
    assert!(!outcome.interrupted);

    for source in &sources {
        let record = store.catalog.remote_volume(&source.name).unwrap();
        assert_eq!(record.state, VolumeState::Deleted);
        assert!(!store.backend.exists(&source.name).unwrap());
    }

    let outputs = new_block_volumes(&store, &sources);
    assert!(!outputs.is_empty() && outputs.len() <= 3, "{outputs:?}");
    let expected: HashSet<BlockHash> = live.iter().cloned().collect();
    assert_eq!(stored_hashes(&store, &outputs), expected);

    let output_ids: HashSet<_> = outputs
        .iter()
        .map(|n| store.catalog.remote_volume_id(n).unwrap())
        .collect();
    for hash in &live {
        let block = store.catalog.block(hash).unwrap();
        assert!(output_ids.contains(&block.volume_id));
    }

    assert!(!store.catalog.terminated_with_active_uploads());
    assert!(plan_default(&store.catalog).is_noop());
}

#[test]
fn blocks_held_by_surviving_volumes_are_not_copied() {
    let mut store = TestStore::new();
    let (sources, live) = fill_sparse(&mut store);

    // A dense volume with its own blocks plus copies of the first source's
    // live blocks.
    let mut blocks: Vec<Vec<u8>> = (0..20)
        .map(|i| block_data("dense", i, KB as usize))
        .collect();
    blocks.extend((0..4).map(|i| block_data("v0", i, KB as usize)));
    let dense = store.add_volume(&blocks);
    store.reference(&dense.hashes[..20]);
    store.commit();

    let report = plan_default(&store.catalog);
    assert!(report.should_compact);
    assert!(!report.compactable_volumes.contains(&dense.name));

    let mut pipeline = store.pipeline();
    let outcome =
        compact::run(&mut store.catalog, &mut pipeline, &report, &options(), None).unwrap();

    assert_eq!(outcome.blocks_satisfied_elsewhere, 4);
    assert_eq!(outcome.blocks_migrated, 16);
    assert_eq!(
        outcome.blocks_migrated + outcome.blocks_satisfied_elsewhere,
        live.len() as u64
    );
    for hash in &sources[0].hashes[..4] {
        assert_eq!(store.catalog.block(hash).unwrap().volume_id, dense.id);
    }
}

#[test]
fn pure_reclaim_deletes_without_downloading() {
    let mut store = TestStore::new();
    let keep_a = store.add_volume(&[block_data("a", 0, 512), block_data("a", 1, 512)]);
    let keep_b = store.add_volume(&[block_data("b", 0, 512), block_data("b", 1, 512)]);
    let empty = store.add_volume(&[block_data("c", 0, 512), block_data("c", 1, 512)]);
    store.reference(&keep_a.hashes);
    store.reference(&keep_b.hashes);
    store.release(&empty.hashes);
    let empty_index = store.add_index_volume(&empty);
    store.commit();

    let report = plan_default(&store.catalog);
    assert!(report.should_reclaim);
    assert!(!report.should_compact);
    assert_eq!(report.deletable_volumes, [empty.name.clone()].into());

    store.backend.clear_log();
    let mut pipeline = store.pipeline();
    let outcome =
        compact::run(&mut store.catalog, &mut pipeline, &report, &options(), None).unwrap();

    assert_eq!(outcome.downloaded_count, 0);
    assert_eq!(outcome.deleted_count, 2);
    assert!(store.backend.ops_of("get").is_empty());
    assert!(store.backend.ops_of("put").is_empty());
    // The index volume goes before the block volume it describes.
    assert_eq!(
        store.backend.ops_of("delete"),
        vec![empty_index.clone(), empty.name.clone()]
    );
    assert!(store.backend.exists(&keep_a.name).unwrap());
    assert!(store.backend.exists(&keep_b.name).unwrap());
    assert_eq!(
        store.catalog.remote_volume(&empty_index).unwrap().state,
        VolumeState::Deleted
    );
}

#[test]
fn dry_run_changes_nothing() {
    let mut store = TestStore::new();
    fill_sparse(&mut store);
    let before = store.catalog.remote_volumes(&[]);

    let report = plan_default(&store.catalog);
    let mut opts = options();
    opts.dry_run = true;
    store.backend.clear_log();
    let mut pipeline = store.pipeline();
    let outcome = compact::run(&mut store.catalog, &mut pipeline, &report, &opts, None).unwrap();

    assert!(outcome.dry_run);
    assert_eq!(outcome.downloaded_count, 5);
    assert!(outcome.deleted_count >= 5);
    assert!(outcome.uploaded_count >= 1);
    assert!(store.backend.ops().is_empty());
    assert_eq!(store.catalog.remote_volumes(&[]), before);
    assert!(!store.catalog.terminated_with_active_uploads());
}

#[test]
fn failed_upload_leaves_crash_flag_until_a_clean_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog");
    let mut store = TestStore::with_catalog(Catalog::open(&path).unwrap());
    let (sources, live) = fill_sparse(&mut store);

    store.backend.set_fail_puts(true);
    let report = plan_default(&store.catalog);
    let mut pipeline = store.pipeline();
    assert!(compact::run(&mut store.catalog, &mut pipeline, &report, &options(), None).is_err());

    let reopened = Catalog::open(&path).unwrap();
    assert!(reopened.terminated_with_active_uploads());
    for source in &sources {
        assert!(reopened.remote_volume(&source.name).unwrap().state.is_live());
        assert!(store.backend.exists(&source.name).unwrap());
    }

    store.catalog = reopened;
    store.backend.set_fail_puts(false);
    let report = plan_default(&store.catalog);
    let mut pipeline = store.pipeline();
    let outcome =
        compact::run(&mut store.catalog, &mut pipeline, &report, &options(), None).unwrap();
    assert_eq!(outcome.blocks_migrated, live.len() as u64);
    assert!(!Catalog::open(&path).unwrap().terminated_with_active_uploads());
    assert!(store
        .catalog
        .remote_volumes(&[VolumeState::Temporary])
        .is_empty());
}

#[test]
fn corrupt_download_aborts_the_run() {
    let mut store = TestStore::new();
    let (sources, _) = fill_sparse(&mut store);

    let name = &sources[2].name;
    let mut data = store.backend.get(name).unwrap().unwrap();
    data[20] ^= 0xff;
    store.backend.put_raw(name, &data);

    let report = plan_default(&store.catalog);
    let mut pipeline = store.pipeline();
    assert!(compact::run(&mut store.catalog, &mut pipeline, &report, &options(), None).is_err());

    assert!(store.catalog.terminated_with_active_uploads());
    for source in &sources {
        assert!(store.backend.exists(&source.name).unwrap());
    }
}

#[test]
fn unreadable_block_keeps_its_volume() {
    let mut store = TestStore::new();
    let (sources, live) = fill_sparse(&mut store);

    // Break the codec tag of the first (live) block but keep the catalog's
    // volume hash in line, so only the block read fails.
    let name = sources[0].name.clone();
    let mut data = store.backend.get(&name).unwrap().unwrap();
    data[13] = 0x7f;
    store.backend.put_raw(&name, &data);
    store
        .catalog
        .update_remote_volume(
            &name,
            VolumeState::Uploaded,
            data.len() as i64,
            Some(VOLUME_HASH.digest(&data)),
        )
        .unwrap();

    let report = plan_default(&store.catalog);
    let mut pipeline = store.pipeline();
    let outcome =
        compact::run(&mut store.catalog, &mut pipeline, &report, &options(), None).unwrap();

    assert_eq!(outcome.blocks_failed, 1);
    assert_eq!(outcome.degraded_volumes, vec![name.clone()]);
    assert_eq!(
        outcome.blocks_migrated + outcome.blocks_satisfied_elsewhere + outcome.blocks_failed,
        live.len() as u64
    );
    assert!(store.catalog.remote_volume(&name).unwrap().state.is_live());
    assert!(store.backend.exists(&name).unwrap());
    for source in &sources[1..] {
        assert_eq!(
            store.catalog.remote_volume(&source.name).unwrap().state,
            VolumeState::Deleted
        );
    }
    assert_eq!(
        store.catalog.block(&sources[0].hashes[0]).unwrap().volume_id,
        sources[0].id
    );
}

#[test]
fn cancellation_stops_before_repacking() {
    let mut store = TestStore::new();
    let (sources, _) = fill_sparse(&mut store);
    let cancel = AtomicBool::new(true);

    let report = plan_default(&store.catalog);
    let mut pipeline = store.pipeline();
    let outcome = compact::run(
        &mut store.catalog,
        &mut pipeline,
        &report,
        &options(),
        Some(&cancel),
    )
    .unwrap();

    assert!(outcome.interrupted);
    assert_eq!(outcome.deleted_count, 0);
    assert_eq!(outcome.blocks_migrated, 0);
    assert!(store.catalog.terminated_with_active_uploads());
    assert!(new_block_volumes(&store, &sources).is_empty());
    for source in &sources {
        assert!(store.backend.exists(&source.name).unwrap());
    }
}

#[test]
fn full_index_policy_carries_blocklists() {
    let mut store = TestStore::new();
    let (sources, _) = fill_sparse(&mut store);

    // A blocklist block naming two live blocks, stored in a sparse volume.
    let children: Vec<BlockHash> = sources[0].hashes[..2].to_vec();
    let listing: Vec<u8> = children.iter().flat_map(|h| h.as_bytes().to_vec()).collect();
    let mut blocks = vec![listing.clone()];
    blocks.extend((0..3).map(|i| block_data("pad", i, KB as usize)));
    let holder = store.add_volume(&blocks);
    store.release(&holder.hashes[1..]);
    let listing_hash = holder.hashes[0].clone();
    store
        .catalog
        .register_blockset(
            &block_hash(b"file-with-blocklist"),
            2 * KB,
            children,
            vec![listing_hash.clone()],
        )
        .unwrap();
    store.commit();

    let mut opts = options();
    opts.index_policy = IndexFilePolicy::Full;
    let report = plan_default(&store.catalog);
    assert!(report.compactable_volumes.contains(&holder.name));
    let mut pipeline = store.pipeline();
    let outcome = compact::run(&mut store.catalog, &mut pipeline, &report, &opts, None).unwrap();

    let indexes: Vec<String> = store
        .catalog
        .remote_volumes(&[VolumeState::Uploaded, VolumeState::Verified])
        .into_iter()
        .filter(|v| v.kind == VolumeKind::Index)
        .map(|v| v.name)
        .collect();
    assert_eq!(outcome.uploaded_count, 2 * indexes.len() as u64);

    let mut carried = Vec::new();
    for name in &indexes {
        let data = store.backend.get(name).unwrap().unwrap();
        let doc = IndexVolumeReader::parse(&data, Compression::None).unwrap();
        carried.extend(doc.blocklists);
    }
    assert_eq!(carried, vec![(listing_hash, listing)]);
}

/// Raises the cancel flag once a replacement block volume is uploaded.
struct CancelOnUpload {
    inner: Arc<dyn StorageBackend>,
    cancel: Arc<AtomicBool>,
}

impl StorageBackend for CancelOnUpload {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.inner.put(key, data)?;
        if key.contains(".dblock.") {
            self.cancel.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
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

#[test]
fn cancellation_after_a_checkpoint_keeps_finished_volumes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog");
    let mut store = TestStore::with_catalog(Catalog::open(&path).unwrap());
    let (sources, live) = fill_sparse(&mut store);

    // Six blocks fill a replacement, so the second source seals the first
    // replacement and leaves two blocks in the next one.
    let mut opts = options();
    opts.volume_size = 7 * KB;

    let cancel = Arc::new(AtomicBool::new(false));
    let inner: Arc<dyn StorageBackend> = store.backend.clone();
    let backend: Arc<dyn StorageBackend> = Arc::new(CancelOnUpload {
        inner,
        cancel: Arc::clone(&cancel),
    });
    let mut pipeline = TransferPipeline::new(backend, 2, 2);
    let report = plan_default(&store.catalog);
    let outcome = compact::run(
        &mut store.catalog,
        &mut pipeline,
        &report,
        &opts,
        Some(cancel.as_ref()),
    )
    .unwrap();

    assert!(outcome.interrupted);
    assert_eq!(outcome.downloaded_count, 2);
    assert_eq!(outcome.blocks_migrated, 8);
    assert_eq!(outcome.deleted_count, 0);

    let committed = Catalog::open(&path).unwrap();
    assert!(committed.terminated_with_active_uploads());
    let finished: Vec<_> = committed
        .remote_volumes(&[])
        .into_iter()
        .filter(|v| v.kind == VolumeKind::Blocks)
        .filter(|v| !sources.iter().any(|s| s.name == v.name))
        .collect();
    assert_eq!(finished.len(), 1, "{finished:?}");
    assert_eq!(finished[0].state, VolumeState::Uploaded);
    assert!(store.backend.exists(&finished[0].name).unwrap());
    assert_eq!(stored_hashes(&store, &[finished[0].name.clone()]).len(), 6);

    assert!(committed.remote_volumes(&[VolumeState::Temporary]).is_empty());
    let known: HashSet<_> = committed.remote_volumes(&[]).iter().map(|v| v.id).collect();
    for hash in &live {
        for holder in committed.block_holders(hash) {
            assert!(known.contains(&holder), "{hash} held by dropped volume {holder}");
        }
    }
    for source in &sources {
        assert!(store.backend.exists(&source.name).unwrap());
        assert!(committed.remote_volume(&source.name).unwrap().state.is_live());
    }

    let mut store = TestStore {
        catalog: committed,
        ..store
    };
    let report = plan_default(&store.catalog);
    let mut pipeline = store.pipeline();
    let outcome = compact::run(&mut store.catalog, &mut pipeline, &report, &opts, None).unwrap();
    assert!(!outcome.interrupted);
    assert!(!store.catalog.terminated_with_active_uploads());
    for source in &sources {
        assert!(!store.backend.exists(&source.name).unwrap());
    }
    let outputs = new_block_volumes(&store, &sources);
    let expected: HashSet<BlockHash> = live.iter().cloned().collect();
    assert!(stored_hashes(&store, &outputs).is_superset(&expected));
    assert!(plan_default(&store.catalog).is_noop());
}

#[test]
fn changed_blocksize_is_refused_before_any_change() {
    let mut store = TestStore::new();
    let (sources, _) = fill_sparse(&mut store);
    store
        .catalog
        .verify_block_settings(BlockSettings {
            blocksize: 2 * KB,
            block_hash: HashAlgorithm::Sha256,
        })
        .unwrap();
    store.commit();
    store.backend.clear_log();

    let report = plan_default(&store.catalog);
    let mut pipeline = store.pipeline();
    let err = compact::run(&mut store.catalog, &mut pipeline, &report, &options(), None)
        .unwrap_err();
    assert!(matches!(err, StowageError::Config(_)), "{err}");
    assert!(store.backend.ops().is_empty(), "{:?}", store.backend.ops());
    assert!(!store.catalog.terminated_with_active_uploads());
    for source in &sources {
        assert!(store.catalog.remote_volume(&source.name).unwrap().state.is_live());
    }

    let mut opts = options();
    opts.block_hash = HashAlgorithm::Blake2b256;
    opts.blocksize = 2 * KB;
    assert!(matches!(
        compact::run(&mut store.catalog, &mut pipeline, &report, &opts, None),
        Err(StowageError::Config(_))
    ));
}

#[test]
fn first_run_records_block_settings() {
    let mut store = TestStore::new();
    fill_sparse(&mut store);
    assert_eq!(store.catalog.block_settings(), None);

    let report = plan_default(&store.catalog);
    let mut pipeline = store.pipeline();
    compact::run(&mut store.catalog, &mut pipeline, &report, &options(), None).unwrap();
    assert_eq!(
        store.catalog.block_settings(),
        Some(BlockSettings {
            blocksize: KB,
            block_hash: HashAlgorithm::Sha256,
        })
    );
}

#[test]
fn verification_file_lists_live_volumes_after_compaction() {
    let mut store = TestStore::new();
    let (sources, _) = fill_sparse(&mut store);
    let mut opts = options();
    opts.upload_verification_file = true;

    let report = plan_default(&store.catalog);
    let mut pipeline = store.pipeline();
    compact::run(&mut store.catalog, &mut pipeline, &report, &opts, None).unwrap();

    let name = verification_file_name(TEST_PREFIX);
    let body = store.backend.get(&name).unwrap().unwrap();
    let entries: Vec<VerificationEntry> = serde_json::from_slice(&body).unwrap();

    let live = store
        .catalog
        .remote_volumes(&[VolumeState::Uploaded, VolumeState::Verified]);
    assert_eq!(entries.len(), live.len());
    for entry in &entries {
        assert!(!sources.iter().any(|s| s.name == entry.name));
        let record = store.catalog.remote_volume(&entry.name).unwrap();
        assert_eq!(entry.size, record.size);
        assert_eq!(entry.hash, record.hash.as_ref().map(|h| h.to_base64()));
        assert_eq!(
            store.backend.size(&entry.name).unwrap(),
            Some(entry.size as u64)
        );
    }
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    let mut sorted = names.clone();
    sorted.sort_unstable();
    assert_eq!(names, sorted);

    // Nothing to do: the file is left alone.
    store.backend.clear_log();
    let report = plan_default(&store.catalog);
    compact::run(&mut store.catalog, &mut pipeline, &report, &opts, None).unwrap();
    assert!(store.backend.ops_of("put").is_empty());

    // The file is not a volume, so a strict listing check ignores it.
    crate::backend::verify_remote_list(
        &mut pipeline,
        &mut store.catalog,
        TEST_PREFIX,
        crate::backend::VerifyMode::Strict,
    )
    .unwrap();
}

#[test]
fn verification_file_is_opt_in() {
    let mut store = TestStore::new();
    fill_sparse(&mut store);
    let report = plan_default(&store.catalog);
    let mut pipeline = store.pipeline();
    compact::run(&mut store.catalog, &mut pipeline, &report, &options(), None).unwrap();
    assert!(!store
        .backend
        .exists(&verification_file_name(TEST_PREFIX))
        .unwrap());
}
