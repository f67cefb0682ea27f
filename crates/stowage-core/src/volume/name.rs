use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use stowage_types::error::{Result, StowageError};

use crate::compress::Compression;

/// What a remote volume holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VolumeKind {
    /// Block data.
    Blocks,
    /// Hash metadata describing a block volume.
    Index,
}

impl VolumeKind {
    fn letter(self) -> char {
        match self {
            VolumeKind::Blocks => 'b',
            VolumeKind::Index => 'i',
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            VolumeKind::Blocks => "dblock",
            VolumeKind::Index => "dindex",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "dblock" => Some(VolumeKind::Blocks),
            "dindex" => Some(VolumeKind::Index),
            _ => None,
        }
    }
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Parsed remote volume file name:
/// `<prefix>-<kind letter><16 hex digits>.<dblock|dindex>.<raw|lz4|zst>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeName<'a> {
    pub prefix: &'a str,
    pub kind: VolumeKind,
    pub id: u64,
    pub compression: Compression,
}

impl<'a> VolumeName<'a> {
    /// Name a new volume with a random identifier.
    pub fn generate(prefix: &'a str, kind: VolumeKind, compression: Compression) -> Self {
        Self {
            prefix,
            kind,
            id: rand::thread_rng().next_u64(),
            compression,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}-{}{:016x}.{}.{}",
            self.prefix,
            self.kind.letter(),
            self.id,
            self.kind.suffix(),
            self.compression.extension()
        )
    }

    /// Recover the components of a volume file name. The extension selects
    /// the codec used to read the volume back.
    pub fn parse(name: &'a str) -> Result<Self> {
        let invalid = || StowageError::InvalidFormat(format!("not a volume name: '{name}'"));

        let (stem, ext) = name.rsplit_once('.').ok_or_else(invalid)?;
        let (base, suffix) = stem.rsplit_once('.').ok_or_else(invalid)?;
        let kind = VolumeKind::from_suffix(suffix).ok_or_else(invalid)?;
        let (prefix, tail) = base.rsplit_once('-').ok_or_else(invalid)?;
        if prefix.is_empty() {
            return Err(invalid());
        }

        let mut chars = tail.chars();
        if chars.next() != Some(kind.letter()) {
            return Err(invalid());
        }
        let hex_id = chars.as_str();
        if hex_id.len() != 16 {
            return Err(invalid());
        }
        let id = u64::from_str_radix(hex_id, 16).map_err(|_| invalid())?;

        let compression = Compression::from_extension(ext)?;
        Ok(Self {
            prefix,
            kind,
            id,
            compression,
        })
    }
}

impl fmt::Display for VolumeName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}
