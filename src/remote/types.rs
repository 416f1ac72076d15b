//! Object store types
//!
//! Defines the normalized remote path and the stat/list records returned
//! by object store implementations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A normalized `{bucket}/{key}` remote object path.
///
/// Leading and trailing slashes are stripped. The first segment is the
/// bucket and must be non-empty; the remainder is the in-bucket key, which
/// may be empty when the path names a bucket or listing prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPath {
    bucket: String,
    key: String,
}

impl ObjectPath {
    /// Parse and normalize a remote path
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim_matches('/');
        let (bucket, key) = match trimmed.split_once('/') {
            Some((bucket, key)) => (bucket, key),
            None => (trimmed, ""),
        };

        if bucket.is_empty() {
            return Err(Error::Configuration(format!(
                "remote path '{}' has no bucket segment",
                path
            )));
        }

        // mirrored to local disk, so relative segments would leave the cache root
        if trimmed.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(Error::Configuration(format!(
                "remote path '{}' contains a relative segment",
                path
            )));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Parse a path that must name an object (non-empty key)
    pub fn parse_object(path: &str) -> Result<Self> {
        let parsed = Self::parse(path)?;
        if parsed.key.is_empty() {
            return Err(Error::Configuration(format!(
                "remote path '{}' names a bucket, not an object",
                path
            )));
        }
        Ok(parsed)
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Key within the bucket (may be empty)
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append a relative segment to this path
    pub fn join(&self, name: &str) -> Result<Self> {
        Self::parse(&format!("{}/{}", self, name.trim_start_matches('/')))
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}", self.bucket)
        } else {
            write!(f, "{}/{}", self.bucket, self.key)
        }
    }
}

impl FromStr for ObjectPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Remote object metadata returned by `stat`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    /// Last-modified timestamp, rendered exactly as the store reports it.
    /// Compared as an opaque string by the auto-refresh policy.
    pub mtime: String,
    /// Object size in bytes
    pub size: u64,
    /// Entity tag, if reported
    pub etag: Option<String>,
    /// Version id, if the bucket is versioned
    pub version_id: Option<String>,
}

/// One entry from a bucket listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Bucket the entry belongs to
    pub bucket: String,
    /// Full key within the bucket
    pub key: String,
    /// Whether this is a common-prefix (directory) entry
    pub is_directory: bool,
}

impl ListEntry {
    /// Render as a `{bucket}/{key}` remote path string
    pub fn remote_path(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}
