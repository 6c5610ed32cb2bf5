//! Error types for the cairn indexing engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Chunk error: {0}")]
    Chunk(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Checksum mismatch for chunk {id}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { id: u64, expected: u32, actual: u32 },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::Serialization(err.to_string())
    }
}
