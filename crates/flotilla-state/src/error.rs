//! Error types for the flotilla persistence layer.

use thiserror::Error;

/// Errors that can occur in the checkpoint / token-ledger layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem I/O failed.
    #[error("checkpoint I/O failed at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A checkpoint record could not be serialized.
    #[error("checkpoint serialization failed: {0}")]
    Serialization(String),

    /// A checkpoint file exists but could not be parsed.
    #[error("checkpoint file at {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    /// A referenced issue has no checkpoint record.
    #[error("no checkpoint record for issue #{issue}")]
    IssueNotFound { issue: u64 },
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
