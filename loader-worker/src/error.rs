use loader_common::cipher::CipherError;
use loader_common::keyservice::KeyServiceError;
use thiserror::Error;

/// Enumeration of errors that prevent a single record from being mapped.
/// None of these are retried, the record is logged and skipped.
#[derive(Error, Debug)]
pub enum MappingError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("unparseable date found: '{0}', did not match any supported date formats")]
    UnparseableDate(String),
    #[error("failed to encrypt record: {0}")]
    CipherError(#[from] CipherError),
    #[error("failed to serialize record: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Enumeration of errors related to opening and reading a dump file.
#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("failed to read {path}: {error}")]
    IoError {
        path: String,
        error: std::io::Error,
    },
    #[error("failed to parse encryption metadata {path}: {error}")]
    MetadataError {
        path: String,
        error: serde_json::Error,
    },
    #[error("failed to decrypt the data key for {path}: {error}")]
    KeyServiceError {
        path: String,
        error: KeyServiceError,
    },
    #[error("failed to set up decryption of {path}: {error}")]
    CipherError { path: String, error: CipherError },
}

/// Enumeration of errors related to writing mapped records.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to write record: {0}")]
    IoError(#[from] std::io::Error),
    #[error("failed to serialize record: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Enumeration of errors that abort a load.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("data key service error: {0}")]
    KeyServiceError(#[from] KeyServiceError),
    #[error(transparent)]
    ReaderError(#[from] ReaderError),
    #[error(transparent)]
    SinkError(#[from] SinkError),
    #[error("failed to list input files: {0}")]
    ListingError(std::io::Error),
    #[error("a file processing task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),
    #[error("file concurrency limiter was closed: {0}")]
    SemaphoreClosed(#[from] tokio::sync::AcquireError),
}
