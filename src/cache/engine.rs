//! Cache Engine
//!
//! Single-object get/put against the object store, serving reads from the
//! local mirror while it is still valid. Validity under [`Refresh::Auto`]
//! is decided by comparing the recorded remote mtime with a fresh `stat`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::codec::FileFormat;
use super::metadata::MetadataStore;
use super::mirror::LocalMirror;
use crate::config::MirrorConfig;
use crate::error::{Error, Result};
use crate::remote::{ObjectPath, ObjectStore, S3Client};

/// When to re-download an object that already has a local copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Drop the local copy and download again
    Always,
    /// Use the local copy if present
    Never,
    /// Re-download only if the remote mtime differs from the recorded one
    Auto,
}

impl FromStr for Refresh {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "always" | "true" => Ok(Refresh::Always),
            "never" | "false" => Ok(Refresh::Never),
            "auto" => Ok(Refresh::Auto),
            other => Err(Error::Configuration(format!(
                "unknown refresh policy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Refresh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refresh::Always => write!(f, "always"),
            Refresh::Never => write!(f, "never"),
            Refresh::Auto => write!(f, "auto"),
        }
    }
}

/// Staleness-aware cache in front of one object store.
///
/// Owns one local mirror root and, unless auto-refresh is disabled, its own
/// connection to the metadata file in that root. Call
/// [`CacheEngine::shutdown`] when done so the connection closes
/// deterministically.
pub struct CacheEngine {
    config: MirrorConfig,
    store: Arc<dyn ObjectStore>,
    mirror: LocalMirror,
    metadata: Option<Arc<MetadataStore>>,
}

impl CacheEngine {
    /// Create an engine over an existing object store
    pub fn new(config: MirrorConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let engine = Self::open_worker(config, store)?;
        engine.mirror.cleanup();

        info!(
            cache_root = %engine.mirror.root().display(),
            auto_refresh = engine.metadata.is_some(),
            "Cache engine initialized"
        );
        Ok(engine)
    }

    /// Create an engine talking to the configured S3 endpoint
    pub fn connect(config: MirrorConfig) -> Result<Self> {
        let client = S3Client::new(&config)
            .map_err(|e| Error::Configuration(format!("cannot build S3 client: {}", e)))?;
        Self::new(config, Arc::new(client))
    }

    /// Engine for a batch worker: same root, own metadata handle, and no
    /// temp-file sweep so siblings' in-flight writes are left alone.
    pub(crate) fn open_worker(config: MirrorConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let mirror = LocalMirror::open(&config.cache_root)?;
        let metadata = if config.disable_auto_refresh {
            None
        } else {
            Some(Arc::new(MetadataStore::open(mirror.root())?))
        };

        Ok(Self {
            config,
            store,
            mirror,
            metadata,
        })
    }

    /// Configuration this engine was built from
    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Shared handle to the object store
    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// The local mirror tree
    pub fn mirror(&self) -> &LocalMirror {
        &self.mirror
    }

    /// Metadata store, if auto-refresh is enabled
    pub fn metadata(&self) -> Option<&MetadataStore> {
        self.metadata.as_deref()
    }

    /// `Auto` when a metadata store is available, otherwise `Always`
    pub fn default_refresh(&self) -> Refresh {
        if self.metadata.is_some() {
            Refresh::Auto
        } else {
            Refresh::Always
        }
    }

    /// Ensure a valid local copy of `path` exists and return its location.
    ///
    /// Remote failures come back as `Err` values; nothing panics.
    pub async fn fetch(&self, path: &str, refresh: Refresh) -> Result<PathBuf> {
        let path = ObjectPath::parse_object(path)?;
        let local = self.mirror.prepare(&path)?;

        let (drop_local, mut remote_mtime) = match refresh {
            Refresh::Always => (true, None),
            Refresh::Never => (false, None),
            Refresh::Auto => {
                let metadata = self.require_metadata()?;
                let key = path.to_string();
                let recorded = with_metadata(metadata, move |m| m.get(&key)).await?;
                let current = self.stat_mtime(&path).await?;
                let unchanged = recorded.as_deref() == Some(current.as_str());
                debug!(
                    path = %path,
                    recorded = ?recorded,
                    current = %current,
                    unchanged = unchanged,
                    "Auto refresh check"
                );
                (!unchanged, Some(current))
            }
        };

        if drop_local {
            self.mirror.remove(&path)?;
        }

        if local.is_file() {
            debug!(path = %path, "Local mirror HIT");
            return Ok(local);
        }

        // stat before get: a racing write then leaves an older mtime on
        // record, which only costs a spurious refetch later
        if remote_mtime.is_none() && self.metadata.is_some() {
            remote_mtime = Some(self.stat_mtime(&path).await?);
        }

        info!(path = %path, "Downloading object");
        self.store
            .get(path.bucket(), path.key(), &local, None)
            .await
            .map_err(|e| Error::remote(&path, e))?;

        if let (Some(metadata), Some(mtime)) = (&self.metadata, remote_mtime) {
            let key = path.to_string();
            with_metadata(metadata, move |m| m.set(&key, &mtime)).await?;
        }
        Ok(local)
    }

    /// Download a pinned object version into the mirror.
    ///
    /// The mtime record is dropped so the next `Auto` fetch re-validates
    /// against the latest object.
    pub async fn fetch_version(&self, path: &str, version_id: &str) -> Result<PathBuf> {
        let path = ObjectPath::parse_object(path)?;
        let local = self.mirror.prepare(&path)?;

        info!(path = %path, version_id = version_id, "Downloading object version");
        self.store
            .get(path.bucket(), path.key(), &local, Some(version_id))
            .await
            .map_err(|e| Error::remote(&path, e))?;

        if let Some(metadata) = &self.metadata {
            let key = path.to_string();
            with_metadata(metadata, move |m| m.remove(&key)).await?;
        }
        Ok(local)
    }

    /// Fetch and decode a value. Without an explicit format it is inferred
    /// from the extension; an unsupported format fails before any I/O.
    pub async fn load<T: DeserializeOwned>(
        &self,
        path: &str,
        refresh: Refresh,
        format: Option<FileFormat>,
    ) -> Result<T> {
        let format = resolve_format(path, format)?;
        let local = self.fetch(path, refresh).await?;
        decode_file(&local, format).await
    }

    /// Fetch and decode a pinned object version
    pub async fn load_version<T: DeserializeOwned>(
        &self,
        path: &str,
        version_id: &str,
        format: Option<FileFormat>,
    ) -> Result<T> {
        let format = resolve_format(path, format)?;
        let local = self.fetch_version(path, version_id).await?;
        decode_file(&local, format).await
    }

    /// Encode `value`, write it to the mirror and upload it.
    ///
    /// Upload failures are returned; the local copy is left in place.
    pub async fn store<T: Serialize + ?Sized>(
        &self,
        value: &T,
        path: &str,
        format: Option<FileFormat>,
    ) -> Result<PathBuf> {
        let format = resolve_format(path, format)?;
        let path = ObjectPath::parse_object(path)?;
        let bytes = format.encode(value)?;

        self.mirror.remove(&path)?;
        let local = self.mirror.write(&path, &bytes)?;

        info!(path = %path, size = bytes.len(), format = %format, "Putting object");
        self.store
            .put(path.bucket(), path.key(), &local)
            .await
            .map_err(|e| Error::remote(&path, e))?;

        self.record_remote_mtime(&path).await?;
        Ok(local)
    }

    /// Whether an object exists remotely. A missing object or bucket is
    /// `false`; other remote errors are returned.
    pub async fn object_exists(&self, path: &str) -> Result<bool> {
        let path = ObjectPath::parse_object(path)?;
        match self.store.stat(path.bucket(), path.key()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(Error::remote(&path, e)),
        }
    }

    /// Upload an arbitrary local file to `remote`.
    ///
    /// A mirror copy of `remote` that is not the uploaded file itself is
    /// removed, since it no longer matches the recorded mtime.
    pub async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let path = ObjectPath::parse_object(remote)?;

        info!(path = %path, local = %local.display(), "Uploading file");
        self.store
            .put(path.bucket(), path.key(), local)
            .await
            .map_err(|e| Error::remote(&path, e))?;

        if self.mirror.local_path(&path) != local {
            self.mirror.remove(&path)?;
        }
        self.record_remote_mtime(&path).await
    }

    /// List object paths (`{bucket}/{key}`) under `prefix`, skipping
    /// directory entries
    pub async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        let path = ObjectPath::parse(prefix)?;
        // keep a trailing slash so "dir/" lists inside dir rather than dir itself
        let key_prefix = if prefix.ends_with('/') && !path.key().is_empty() {
            format!("{}/", path.key())
        } else {
            path.key().to_string()
        };
        let entries = self
            .store
            .list(path.bucket(), &key_prefix, recursive)
            .await
            .map_err(|e| Error::remote(&path, e))?;

        let objects: Vec<String> = entries
            .iter()
            .filter(|e| !e.is_directory)
            .map(|e| e.remote_path())
            .collect();
        debug!(prefix = %path, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    /// Create `bucket` unless it exists. An existing bucket is an error
    /// only when `exist_ok` is false.
    pub async fn make_bucket(&self, bucket: &str, exist_ok: bool) -> Result<()> {
        let bucket = bucket.trim_matches('/');
        let exists = self
            .store
            .bucket_exists(bucket)
            .await
            .map_err(|e| Error::remote(bucket, e))?;

        if exists {
            return if exist_ok {
                Ok(())
            } else {
                Err(Error::BucketExists(bucket.to_string()))
            };
        }

        self.store
            .create_bucket(bucket)
            .await
            .map_err(|e| Error::remote(bucket, e))
    }

    /// Release the metadata connection
    pub fn shutdown(self) -> Result<()> {
        if let Some(metadata) = self.metadata {
            match Arc::try_unwrap(metadata) {
                Ok(metadata) => metadata.close()?,
                Err(_) => warn!("Metadata store still in use at shutdown, closing on drop"),
            }
        }
        debug!(cache_root = %self.mirror.root().display(), "Cache engine shut down");
        Ok(())
    }

    fn require_metadata(&self) -> Result<&Arc<MetadataStore>> {
        self.metadata.as_ref().ok_or_else(|| {
            Error::Configuration(
                "refresh=auto requires the metadata store, but auto refresh is disabled"
                    .to_string(),
            )
        })
    }

    async fn stat_mtime(&self, path: &ObjectPath) -> Result<String> {
        self.store
            .stat(path.bucket(), path.key())
            .await
            .map(|stat| stat.mtime)
            .map_err(|e| Error::remote(path, e))
    }

    /// Record the current remote mtime after a successful write
    async fn record_remote_mtime(&self, path: &ObjectPath) -> Result<()> {
        if let Some(metadata) = &self.metadata {
            let mtime = self.stat_mtime(path).await?;
            let key = path.to_string();
            with_metadata(metadata, move |m| m.set(&key, &mtime)).await?;
        }
        Ok(())
    }
}

/// Run a metadata call on the blocking pool. A sibling writer can hold the
/// SQLite lock for up to the busy timeout.
async fn with_metadata<R, F>(metadata: &Arc<MetadataStore>, f: F) -> Result<R>
where
    F: FnOnce(&MetadataStore) -> rusqlite::Result<R> + Send + 'static,
    R: Send + 'static,
{
    let metadata = Arc::clone(metadata);
    let outcome = tokio::task::spawn_blocking(move || f(&metadata))
        .await
        .map_err(|e| Error::Task(format!("metadata call did not complete: {}", e)))?;
    Ok(outcome?)
}

fn resolve_format(path: &str, format: Option<FileFormat>) -> Result<FileFormat> {
    match format {
        Some(format) => Ok(format),
        None => FileFormat::infer(path),
    }
}

async fn decode_file<T: DeserializeOwned>(local: &Path, format: FileFormat) -> Result<T> {
    let bytes = tokio::fs::read(local).await?;
    format.decode(&bytes)
}
