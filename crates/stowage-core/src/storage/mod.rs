pub mod local_backend;

use std::sync::Arc;

use stowage_types::error::Result;

use crate::config::RepositoryConfig;

/// Minimal object-store contract the transfer pipeline needs.
///
/// Keys are `/`-separated; volumes live at the root under their file name.
pub trait StorageBackend: Send + Sync {
    /// Fetch an object. `Ok(None)` when it does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store an object, replacing any previous content.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Remove an object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// List object keys starting with `prefix` (empty prefix lists everything).
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size in bytes of an object. `Ok(None)` when it does not exist.
    fn size(&self, key: &str) -> Result<Option<u64>>;
}

/// Build a storage backend from the repository configuration.
pub fn backend_from_config(cfg: &RepositoryConfig) -> Result<Arc<dyn StorageBackend>> {
    let path = cfg.url.strip_prefix("file://").unwrap_or(&cfg.url);
    Ok(Arc::new(local_backend::LocalBackend::new(std::path::Path::new(path))?))
}
