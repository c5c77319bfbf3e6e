use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Bad input to a mutation. Nothing was changed.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("person not found: {0}")]
    NotFound(String),
    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unsupported export version {0}")]
    UnsupportedVersion(String),
    #[error("result writer thread has stopped")]
    WriterStopped,
}

pub type Result<T> = std::result::Result<T, StoreError>;
