//! s3mirror - local cache in front of an S3-compatible object store
//!
//! Remote objects are mirrored into a local directory tree and served from
//! there while still valid. Validity is decided per read by the
//! [`Refresh`] policy, backed by a persistent record of the remote mtime
//! each local copy was taken at.

pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod kv;
pub mod remote;

pub use cache::{BatchCoordinator, CacheEngine, FileFormat, LocalMirror, MetadataStore, Refresh};
pub use config::MirrorConfig;
pub use error::{Error, Result};
pub use fs::{OpenMode, ScopedFile};
pub use kv::ContentAddressedStore;
pub use remote::{MemoryStore, ObjectPath, ObjectStore, S3Client, StoreError};
