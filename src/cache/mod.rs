//! Local caching layer
//!
//! Mirrors remote objects on local disk and tracks the remote mtime each
//! copy was taken at, so reads only hit the network when something changed.

pub mod batch;
pub mod codec;
pub mod engine;
pub mod metadata;
pub mod mirror;

pub use batch::BatchCoordinator;
pub use codec::FileFormat;
pub use engine::{CacheEngine, Refresh};
pub use metadata::MetadataStore;
pub use mirror::LocalMirror;
