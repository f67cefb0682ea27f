use thiserror::Error;

pub type Result<T> = std::result::Result<T, StowageError>;

#[derive(Debug, Error)]
pub enum StowageError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("size mismatch for block {hash}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        hash: String,
        expected: u64,
        actual: u64,
    },

    #[error("remote volume not found: '{0}'")]
    VolumeNotFound(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unknown compression module: '{0}'")]
    UnknownCompression(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
