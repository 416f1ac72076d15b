//! Error types for the mirror cache.

use crate::remote::StoreError;

/// Errors surfaced by cache, handle and KV operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing configuration or an incompatible combination of options
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The object store failed for a specific remote path
    #[error("remote I/O failed for '{path}': {source}")]
    Remote {
        path: String,
        #[source]
        source: StoreError,
    },

    /// A KV record already occupies the target hash path
    #[error("conflict: an object already exists at '{path}'")]
    Conflict { path: String },

    /// Bucket creation refused because the bucket exists
    #[error("bucket '{0}' already exists")]
    BucketExists(String),

    /// Value encoding or decoding failed
    #[error("codec error: {0}")]
    Codec(String),

    /// A background task or batch worker stopped before finishing
    #[error("task failed: {0}")]
    Task(String),

    #[error("metadata store error: {0}")]
    Metadata(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a store error with the remote path it concerns
    pub fn remote(path: impl ToString, source: StoreError) -> Self {
        Error::Remote {
            path: path.to_string(),
            source,
        }
    }

    /// Whether this error means the remote object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Remote { source, .. } if source.is_not_found())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
