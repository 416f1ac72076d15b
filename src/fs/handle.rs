//! Scoped File Handles
//!
//! A [`ScopedFile`] wraps the local mirror copy of one remote object. Read
//! and append modes fetch the object on open; every mode uploads the local
//! file back to the remote path when the handle is closed.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{CacheEngine, Refresh};
use crate::error::{Error, Result};
use crate::remote::{ObjectPath, ObjectStore};

/// How the local copy is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadBinary,
    Write,
    WriteBinary,
    Append,
}

impl OpenMode {
    /// Whether the mode may modify the file
    pub fn is_write(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::WriteBinary | OpenMode::Append)
    }

    /// Whether opening needs the current remote content
    fn needs_remote_copy(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadBinary | OpenMode::Append)
    }
}

impl FromStr for OpenMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(OpenMode::Read),
            "rb" => Ok(OpenMode::ReadBinary),
            "w" => Ok(OpenMode::Write),
            "wb" => Ok(OpenMode::WriteBinary),
            "a" => Ok(OpenMode::Append),
            other => Err(Error::Configuration(format!(
                "mode '{}' not supported",
                other
            ))),
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            OpenMode::Read => "r",
            OpenMode::ReadBinary => "rb",
            OpenMode::Write => "w",
            OpenMode::WriteBinary => "wb",
            OpenMode::Append => "a",
        };
        f.write_str(tag)
    }
}

/// Open local copy of a remote object, synced back on [`ScopedFile::close`].
///
/// Dropping an unclosed handle schedules a best-effort upload on the
/// current Tokio runtime; prefer `close` or [`CacheEngine::with_file`] so
/// upload failures are observed.
pub struct ScopedFile<'a> {
    engine: &'a CacheEngine,
    remote: ObjectPath,
    local_path: PathBuf,
    mode: OpenMode,
    file: Option<File>,
    closed: bool,
}

impl<'a> ScopedFile<'a> {
    /// Open `path` in `mode`, fetching it first for read and append modes
    pub async fn open(
        engine: &'a CacheEngine,
        path: &str,
        mode: OpenMode,
        refresh: Refresh,
        version_id: Option<&str>,
    ) -> Result<ScopedFile<'a>> {
        if version_id.is_some() && mode.is_write() {
            return Err(Error::Configuration(format!(
                "cannot open '{}' in mode '{}' with a version id",
                path, mode
            )));
        }

        let remote = ObjectPath::parse_object(path)?;
        if refresh == Refresh::Never && mode.needs_remote_copy() {
            warn!(path = %remote, "Opening without refresh, the local copy may be stale");
        }

        let local_path = match mode {
            OpenMode::Read | OpenMode::ReadBinary => match version_id {
                Some(version_id) => engine.fetch_version(path, version_id).await?,
                None => engine.fetch(path, refresh).await?,
            },
            OpenMode::Append => {
                if engine.object_exists(path).await? {
                    engine.fetch(path, refresh).await?
                } else {
                    // never append to a leftover from an unrelated run
                    engine.mirror().remove(&remote)?;
                    engine.mirror().prepare(&remote)?
                }
            }
            OpenMode::Write | OpenMode::WriteBinary => engine.mirror().prepare(&remote)?,
        };

        let file = match mode {
            OpenMode::Read | OpenMode::ReadBinary => File::open(&local_path)?,
            OpenMode::Write | OpenMode::WriteBinary => File::create(&local_path)?,
            OpenMode::Append => OpenOptions::new()
                .append(true)
                .create(true)
                .open(&local_path)?,
        };

        debug!(path = %remote, mode = %mode, local = %local_path.display(), "Opened scoped file");
        Ok(ScopedFile {
            engine,
            remote,
            local_path,
            mode,
            file: Some(file),
            closed: false,
        })
    }

    /// Remote path this handle syncs to
    pub fn remote_path(&self) -> &ObjectPath {
        &self.remote
    }

    /// Location of the local copy
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Close the local file, then upload it to the remote path.
    ///
    /// The upload happens in every mode, including read modes.
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            if self.mode.is_write() {
                file.flush()?;
                file.sync_all()?;
            }
        }
        self.closed = true;

        debug!(path = %self.remote, mode = %self.mode, "Closing scoped file");
        self.engine
            .upload_file(&self.local_path, &self.remote.to_string())
            .await
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "scoped file is closed"))
    }
}

impl fmt::Debug for ScopedFile<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedFile")
            .field("remote", &self.remote)
            .field("local_path", &self.local_path)
            .field("mode", &self.mode)
            .field("open", &self.file.is_some())
            .finish()
    }
}

impl Read for ScopedFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }
}

impl Write for ScopedFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl Drop for ScopedFile<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        drop(self.file.take());

        let store: Arc<dyn ObjectStore> = Arc::clone(self.engine.object_store());
        let remote = self.remote.clone();
        let local = self.local_path.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(path = %remote, "Scoped file dropped without close, uploading in background");
                runtime.spawn(async move {
                    match store.put(remote.bucket(), remote.key(), &local).await {
                        Ok(()) => debug!(path = %remote, "Background upload finished"),
                        Err(e) => warn!(path = %remote, error = %e, "Background upload failed"),
                    }
                });
            }
            Err(_) => {
                warn!(path = %remote, "Scoped file dropped outside a runtime, remote not updated");
            }
        }
    }
}

impl CacheEngine {
    /// Open a scoped file on `path`
    pub async fn open(
        &self,
        path: &str,
        mode: OpenMode,
        refresh: Refresh,
    ) -> Result<ScopedFile<'_>> {
        ScopedFile::open(self, path, mode, refresh, None).await
    }

    /// Run `f` on a scoped file, then close it and upload whether or not
    /// `f` succeeded. An error from `f` takes precedence over an upload
    /// error.
    pub async fn with_file<R, F>(&self, path: &str, mode: OpenMode, f: F) -> Result<R>
    where
        F: FnOnce(&mut ScopedFile<'_>) -> io::Result<R>,
    {
        let mut handle = self.open(path, mode, self.default_refresh()).await?;
        let outcome = f(&mut handle);
        let closed = handle.close().await;

        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), Ok(())) => Err(e.into()),
            (Err(e), Err(close_err)) => {
                warn!(path = path, error = %close_err, "Upload after failed scope also failed");
                Err(e.into())
            }
            (Ok(_), Err(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorConfig;
    use crate::remote::MemoryStore;

    fn setup() -> (tempfile::TempDir, Arc<MemoryStore>, CacheEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_buckets(&["data"]));
        let config = MirrorConfig::builder()
            .cache_root(dir.path())
            .build_with(|_| None)
            .unwrap();
        let engine = CacheEngine::new(config, store.clone()).unwrap();
        (dir, store, engine)
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("rb".parse::<OpenMode>().unwrap(), OpenMode::ReadBinary);
        assert_eq!("a".parse::<OpenMode>().unwrap(), OpenMode::Append);
        assert!("x".parse::<OpenMode>().is_err());
        assert!(OpenMode::Append.is_write());
        assert!(!OpenMode::Read.is_write());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_dir, store, engine) = setup();

        engine
            .with_file("data/test_dir/text.txt", OpenMode::Write, |f| {
                f.write_all(b"test_txt")
            })
            .await
            .unwrap();
        assert_eq!(store.read("data", "test_dir/text.txt").unwrap(), b"test_txt");

        let text = engine
            .with_file("data/test_dir/text.txt", OpenMode::Read, |f| {
                let mut s = String::new();
                f.read_to_string(&mut s)?;
                Ok(s)
            })
            .await
            .unwrap();
        assert_eq!(text, "test_txt");
    }

    #[tokio::test]
    async fn test_append_to_existing_object() {
        let (_dir, store, engine) = setup();
        store.insert("data", "log.txt", b"one\n").unwrap();

        let mut handle = engine
            .open("data/log.txt", OpenMode::Append, Refresh::Auto)
            .await
            .unwrap();
        handle.write_all(b"two\n").unwrap();
        assert!(format!("{:?}", handle).contains("log.txt"));
        handle.close().await.unwrap();

        assert_eq!(store.read("data", "log.txt").unwrap(), b"one\ntwo\n");
    }

    #[tokio::test]
    async fn test_append_ignores_leftover_local_file() {
        let (_dir, store, engine) = setup();
        let remote = ObjectPath::parse("data/fresh.txt").unwrap();
        engine.mirror().write(&remote, b"garbage").unwrap();

        let mut handle = engine
            .open("data/fresh.txt", OpenMode::Append, Refresh::Never)
            .await
            .unwrap();
        handle.write_all(b"clean").unwrap();
        handle.close().await.unwrap();

        assert_eq!(store.read("data", "fresh.txt").unwrap(), b"clean");
    }

    #[tokio::test]
    async fn test_version_with_write_mode_rejected() {
        let (_dir, _store, engine) = setup();
        for mode in [OpenMode::Write, OpenMode::WriteBinary, OpenMode::Append] {
            let result =
                ScopedFile::open(&engine, "data/a.txt", mode, Refresh::Always, Some("v1")).await;
            assert!(matches!(result, Err(Error::Configuration(_))));
        }
    }

    #[tokio::test]
    async fn test_read_version() {
        let (_dir, store, engine) = setup();
        store.insert("data", "doc", b"old").unwrap();
        let version = store.stat("data", "doc").await.unwrap().version_id.unwrap();
        store.insert("data", "doc", b"new").unwrap();

        let mut handle = ScopedFile::open(
            &engine,
            "data/doc",
            OpenMode::ReadBinary,
            Refresh::Auto,
            Some(version.as_str()),
        )
        .await
        .unwrap();
        let mut bytes = Vec::new();
        handle.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"old");
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_mode_still_uploads() {
        let (_dir, store, engine) = setup();
        store.insert("data", "r.txt", b"x").unwrap();
        let uploads = store.upload_count();

        engine
            .with_file("data/r.txt", OpenMode::Read, |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(store.upload_count(), uploads + 1);
    }

    #[tokio::test]
    async fn test_upload_runs_when_body_fails() {
        let (_dir, store, engine) = setup();

        let result: Result<()> = engine
            .with_file("data/partial.txt", OpenMode::Write, |f| {
                f.write_all(b"partial")?;
                Err(io::Error::new(io::ErrorKind::Other, "boom"))
            })
            .await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(store.read("data", "partial.txt").unwrap(), b"partial");
    }

    #[tokio::test]
    async fn test_read_missing_object_fails_on_open() {
        let (_dir, _store, engine) = setup();
        let result = engine.open("data/none.txt", OpenMode::Read, Refresh::Always).await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_drop_without_close_uploads_in_background() {
        let (_dir, store, engine) = setup();
        {
            let mut handle = engine
                .open("data/dropped.txt", OpenMode::Write, Refresh::Always)
                .await
                .unwrap();
            handle.write_all(b"late").unwrap();
        }

        for _ in 0..50 {
            if store.read("data", "dropped.txt").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(store.read("data", "dropped.txt").unwrap(), b"late");
    }
}
