use thiserror::Error;

/// Unified error type for every fallible operation in the crate.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Value codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Storage error: {0}")]
    StorageError(String),
}
