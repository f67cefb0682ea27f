pub mod block;
pub mod index;
pub mod name;

pub use block::{BlockVolumeReader, BlockVolumeWriter, FinishedVolume};
pub use index::{IndexDocument, IndexVolumeReader, IndexVolumeWriter};
pub use name::{VolumeKind, VolumeName};

/// Size of the magic + version header shared by every volume file.
pub const VOLUME_HEADER_SIZE: usize = 9;
