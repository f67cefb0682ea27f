pub mod block_hash;
pub mod error;
pub mod volume_id;
