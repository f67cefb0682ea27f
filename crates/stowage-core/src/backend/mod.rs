pub mod verification;
pub mod verify;

use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use stowage_types::block_hash::BlockHash;
use stowage_types::error::{Result, StowageError};

use crate::catalog::{Catalog, RemoteVolumeRecord, VolumeState};
use crate::storage::StorageBackend;
use crate::volume::block::VOLUME_HASH;
use crate::volume::{BlockVolumeWriter, IndexVolumeWriter};

pub use self::verification::{upload_verification_file, verification_file_name, VerificationEntry};
pub use self::verify::{verify_remote_list, VerifyMode, VerifyReport};

/// Callback run on the index writer once its block volume is sealed, before
/// the index volume itself is sealed.
pub type IndexFinishedHook = Box<dyn FnOnce(&mut IndexVolumeWriter) + Send>;

/// A volume fetched into a local temp file.
#[derive(Debug)]
pub struct DownloadedVolume {
    /// Temp file holding the volume, positioned at the start. Removed on drop.
    pub file: NamedTempFile,
    pub hash: BlockHash,
    pub size: u64,
    pub name: String,
}

/// Completed remote operation waiting to be applied to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Uploaded {
        name: String,
        size: u64,
        hash: BlockHash,
    },
    Deleted {
        name: String,
        size: i64,
    },
}

/// Overlapped upload/download/delete queue in front of a storage backend.
///
/// Uploads run on background threads (at most `max_in_flight` at a time);
/// their results are only applied to the catalog by [`wait_for_empty`].
///
/// [`wait_for_empty`]: TransferPipeline::wait_for_empty
pub struct TransferPipeline {
    backend: Arc<dyn StorageBackend>,
    max_in_flight: usize,
    read_ahead: usize,
    pending_uploads: Vec<JoinHandle<Result<Vec<TransferEvent>>>>,
    completed: Vec<TransferEvent>,
}

impl TransferPipeline {
    pub fn new(backend: Arc<dyn StorageBackend>, max_in_flight: usize, read_ahead: usize) -> Self {
        Self {
            backend,
            max_in_flight: max_in_flight.max(1),
            read_ahead: read_ahead.max(1),
            pending_uploads: Vec::new(),
            completed: Vec::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Stream `volumes` into temp files on a producer thread.
    ///
    /// At most `read_ahead` downloaded volumes wait in the channel, so the
    /// next volume is fetched while the consumer works on the current one.
    /// Dropping the receiver stops the producer after its current download.
    pub fn get_files_overlapped(
        &self,
        volumes: Vec<RemoteVolumeRecord>,
    ) -> Receiver<Result<DownloadedVolume>> {
        let (tx, rx) = bounded(self.read_ahead);
        let backend = Arc::clone(&self.backend);
        std::thread::spawn(move || {
            for volume in volumes {
                let item = download_volume(backend.as_ref(), &volume);
                let failed = item.is_err();
                if tx.send(item).is_err() || failed {
                    break;
                }
            }
        });
        rx
    }

    /// Queue a sealed block volume (and its index volume) for upload.
    ///
    /// Blocks while `max_in_flight` uploads are already running.
    pub fn put(
        &mut self,
        block_volume: BlockVolumeWriter,
        index_volume: Option<IndexVolumeWriter>,
        on_index_finished: Option<IndexFinishedHook>,
    ) -> Result<()> {
        self.cap_pending_uploads()?;
        let backend = Arc::clone(&self.backend);
        let handle = std::thread::spawn(move || -> Result<Vec<TransferEvent>> {
            let mut events = Vec::with_capacity(2);
            let sealed = block_volume.finish()?;
            backend.put(&sealed.name, &sealed.data)?;
            debug!(volume = %sealed.name, size = sealed.size(), "uploaded block volume");
            events.push(TransferEvent::Uploaded {
                size: sealed.size(),
                hash: sealed.hash,
                name: sealed.name,
            });

            if let Some(mut index) = index_volume {
                if let Some(hook) = on_index_finished {
                    hook(&mut index);
                }
                let sealed = index.finish()?;
                backend.put(&sealed.name, &sealed.data)?;
                debug!(volume = %sealed.name, size = sealed.size(), "uploaded index volume");
                events.push(TransferEvent::Uploaded {
                    size: sealed.size(),
                    hash: sealed.hash,
                    name: sealed.name,
                });
            }
            Ok(events)
        });
        self.pending_uploads.push(handle);
        Ok(())
    }

    /// Remove a remote volume. Runs in the caller's thread.
    pub fn delete(&mut self, name: &str, size: i64) -> Result<()> {
        self.backend.delete(name)?;
        info!(volume = %name, size, "deleted remote volume");
        self.completed.push(TransferEvent::Deleted {
            name: name.to_string(),
            size,
        });
        Ok(())
    }

    /// Wait for every queued transfer and apply the results to the catalog.
    /// Returns the applied events.
    ///
    /// Events of transfers that did finish are applied even when another
    /// transfer failed; the first failure is returned afterwards.
    pub fn wait_for_empty(&mut self, catalog: &mut Catalog) -> Result<Vec<TransferEvent>> {
        let mut first_error = None;
        for handle in self.pending_uploads.drain(..) {
            match handle.join() {
                Ok(Ok(events)) => self.completed.extend(events),
                Ok(Err(e)) => {
                    warn!("volume upload failed: {e}");
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error
                        .get_or_insert(StowageError::Other("volume upload thread panicked".into()));
                }
            }
        }

        let applied: Vec<TransferEvent> = self.completed.drain(..).collect();
        for event in &applied {
            match event {
                TransferEvent::Uploaded { name, size, hash } => {
                    catalog.update_remote_volume(
                        name,
                        VolumeState::Uploaded,
                        *size as i64,
                        Some(hash.clone()),
                    )?;
                }
                TransferEvent::Deleted { name, .. } => {
                    catalog.set_volume_state(name, VolumeState::Deleted)?;
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(applied),
        }
    }

    /// Number of uploads still running or waiting to be applied.
    pub fn in_flight(&self) -> usize {
        self.pending_uploads.len()
    }

    fn cap_pending_uploads(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.pending_uploads.len() {
            if self.pending_uploads[i].is_finished() {
                let handle = self.pending_uploads.swap_remove(i);
                self.completed.extend(join_upload(handle)?);
            } else {
                i += 1;
            }
        }
        if self.pending_uploads.len() >= self.max_in_flight {
            let handle = self.pending_uploads.remove(0);
            self.completed.extend(join_upload(handle)?);
        }
        Ok(())
    }
}

fn join_upload(handle: JoinHandle<Result<Vec<TransferEvent>>>) -> Result<Vec<TransferEvent>> {
    handle
        .join()
        .map_err(|_| StowageError::Other("volume upload thread panicked".into()))?
}

fn download_volume(
    backend: &dyn StorageBackend,
    volume: &RemoteVolumeRecord,
) -> Result<DownloadedVolume> {
    let data = backend
        .get(&volume.name)?
        .ok_or_else(|| StowageError::VolumeNotFound(volume.name.clone()))?;

    let size = data.len() as u64;
    if volume.size >= 0 && volume.size as u64 != size {
        return Err(StowageError::Consistency(format!(
            "volume '{}' has size {size}, catalog expects {}",
            volume.name, volume.size
        )));
    }
    let hash = VOLUME_HASH.digest(&data);
    if let Some(expected) = &volume.hash {
        if *expected != hash {
            return Err(StowageError::Consistency(format!(
                "volume '{}' hash mismatch: expected {expected}, got {hash}",
                volume.name
            )));
        }
    }

    let mut file = NamedTempFile::new()?;
    file.write_all(&data)?;
    file.flush()?;
    file.as_file_mut().seek(SeekFrom::Start(0))?;
    debug!(volume = %volume.name, size, "downloaded volume");

    Ok(DownloadedVolume {
        file,
        hash,
        size,
        name: volume.name.clone(),
    })
}
