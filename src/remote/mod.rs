//! Remote object store access
//!
//! The cache layer talks to the object store only through [`ObjectStore`].
//! [`S3Client`] speaks the S3 REST API; [`MemoryStore`] keeps objects in
//! process memory.

use std::path::Path;

use async_trait::async_trait;

pub mod client;
pub mod errors;
pub mod memory;
pub mod types;

pub use client::S3Client;
pub use errors::StoreError;
pub use memory::MemoryStore;
pub use types::*;

/// Bucket/key addressed remote blob storage.
///
/// Implementations must be safe to share between concurrently running
/// batch workers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch object metadata. Fails with [`StoreError::NotFound`] when absent.
    async fn stat(&self, bucket: &str, key: &str) -> Result<ObjectStat, StoreError>;

    /// Download an object (optionally a pinned version) into `dest`.
    ///
    /// `dest` is only replaced once the full body has been received.
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
        version_id: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Upload the contents of `source` as an object.
    async fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StoreError>;

    /// List entries under `prefix`. Non-recursive listings group deeper keys
    /// into directory entries.
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<ListEntry>, StoreError>;

    /// Whether the bucket exists
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError>;

    /// Create a bucket
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError>;
}
