use serde::{Deserialize, Serialize};
use tracing::info;

use stowage_types::error::Result;

use super::TransferPipeline;
use crate::catalog::{Catalog, VolumeState};
use crate::volume::VolumeKind;

/// One live remote volume as listed in the verification file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationEntry {
    pub name: String,
    pub kind: VolumeKind,
    pub state: VolumeState,
    pub size: i64,
    /// Base64 volume hash, when known.
    pub hash: Option<String>,
}

/// Remote name of the verification file for volumes under `prefix`.
///
/// It does not parse as a volume name, so remote listings skip it.
pub fn verification_file_name(prefix: &str) -> String {
    format!("{prefix}-verification.json")
}

/// Live volumes of the catalog, sorted by name.
pub fn verification_entries(catalog: &Catalog) -> Vec<VerificationEntry> {
    let mut entries: Vec<VerificationEntry> = catalog
        .remote_volumes(&[VolumeState::Uploaded, VolumeState::Verified])
        .into_iter()
        .map(|v| VerificationEntry {
            hash: v.hash.as_ref().map(|h| h.to_base64()),
            name: v.name,
            kind: v.kind,
            state: v.state,
            size: v.size,
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// Replace the remote verification file with the catalog's current view,
/// so the remote can be checked without the catalog.
pub fn upload_verification_file(
    pipeline: &TransferPipeline,
    catalog: &Catalog,
    prefix: &str,
) -> Result<()> {
    let entries = verification_entries(catalog);
    let body = serde_json::to_vec_pretty(&entries)?;
    let name = verification_file_name(prefix);
    pipeline.backend().put(&name, &body)?;
    info!(file = %name, volumes = entries.len(), "uploaded verification file");
    Ok(())
}
