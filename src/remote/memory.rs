//! In-process object store
//!
//! Keeps every object version in memory behind a mutex. Modification times
//! come from a logical clock that advances one second per write and can be
//! pinned to reproduce writes landing inside the same mtime tick.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::DateTime;
use tracing::{debug, trace};

use super::errors::StoreError;
use super::types::{ListEntry, ObjectStat};
use super::ObjectStore;
use crate::cache::mirror::write_atomic;

/// Logical clock origin (seconds since epoch)
const CLOCK_ORIGIN: i64 = 1_700_000_000;

/// One stored version of an object
#[derive(Debug, Clone)]
struct StoredVersion {
    version_id: String,
    data: Vec<u8>,
    mtime: String,
}

#[derive(Default)]
struct State {
    /// bucket -> key -> versions (oldest first)
    buckets: HashMap<String, BTreeMap<String, Vec<StoredVersion>>>,
    /// Seconds elapsed on the logical clock
    clock: i64,
    /// When set, every write reuses this tick
    pinned: Option<i64>,
    next_version: u64,
}

/// Object store held entirely in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    downloads: AtomicU64,
    uploads: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store with no buckets
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given buckets already present
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            for bucket in buckets {
                state.buckets.entry(bucket.to_string()).or_default();
            }
        }
        store
    }

    /// Freeze the logical clock so subsequent writes share one mtime,
    /// or release it with `false`.
    pub fn pin_clock(&self, pinned: bool) {
        let mut state = self.lock();
        let clock = state.clock;
        state.pinned = pinned.then_some(clock);
    }

    /// Number of completed object downloads
    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Number of completed object uploads
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    /// Write an object directly, bypassing any cache
    pub fn insert(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut state = self.lock();
        if !state.buckets.contains_key(bucket) {
            return Err(StoreError::NotFound(format!("NoSuchBucket: {}", bucket)));
        }
        let pinned = state.pinned;
        let tick = match pinned {
            Some(tick) => tick,
            None => {
                state.clock += 1;
                state.clock
            }
        };
        state.next_version += 1;
        let version = StoredVersion {
            version_id: format!("v{}", state.next_version),
            data: data.to_vec(),
            mtime: render_mtime(tick),
        };

        state
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .push(version);
        Ok(())
    }

    /// Read the latest bytes of an object directly
    pub fn read(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        state
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .and_then(|versions| versions.last())
            .map(|v| v.data.clone())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<StoredVersion, StoreError> {
        let state = self.lock();
        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::NotFound(format!("NoSuchBucket: {}", bucket)))?;
        let versions = objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(format!("NoSuchKey: {}/{}", bucket, key)))?;

        let found = match version_id {
            Some(id) => versions.iter().find(|v| v.version_id == id),
            None => versions.last(),
        };
        found
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("NoSuchVersion: {}/{}", bucket, key)))
    }
}

/// Render a logical tick the way S3 renders `Last-Modified`
fn render_mtime(tick: i64) -> String {
    match DateTime::from_timestamp(CLOCK_ORIGIN + tick, 0) {
        Some(ts) => ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        None => tick.to_string(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn stat(&self, bucket: &str, key: &str) -> Result<ObjectStat, StoreError> {
        let version = self.find(bucket, key, None)?;
        trace!(bucket = bucket, key = key, mtime = %version.mtime, "stat");
        Ok(ObjectStat {
            mtime: version.mtime,
            size: version.data.len() as u64,
            etag: None,
            version_id: Some(version.version_id),
        })
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
        version_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let version = self.find(bucket, key, version_id)?;
        write_atomic(dest, &version.data)?;
        self.downloads.fetch_add(1, Ordering::Relaxed);
        debug!(bucket = bucket, key = key, size = version.data.len(), "Served object from memory");
        Ok(())
    }

    async fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), StoreError> {
        let data = std::fs::read(source)?;
        self.insert(bucket, key, &data)?;
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<ListEntry>, StoreError> {
        let state = self.lock();
        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::NotFound(format!("NoSuchBucket: {}", bucket)))?;

        let mut entries = Vec::new();
        let mut directories = BTreeSet::new();
        for key in objects.keys().filter(|k| k.starts_with(prefix)) {
            let rest = &key[prefix.len()..];
            match rest.find('/') {
                Some(slash) if !recursive => {
                    directories.insert(format!("{}{}", prefix, &rest[..=slash]));
                }
                _ => entries.push(ListEntry {
                    bucket: bucket.to_string(),
                    key: key.clone(),
                    is_directory: false,
                }),
            }
        }
        entries.extend(directories.into_iter().map(|key| ListEntry {
            bucket: bucket.to_string(),
            key,
            is_directory: true,
        }));
        Ok(entries)
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        Ok(self.lock().buckets.contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.lock().buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }
}
