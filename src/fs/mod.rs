//! File-like access to remote objects

pub mod handle;

pub use handle::{OpenMode, ScopedFile};
