//! Local Mirror
//!
//! Shadows remote objects on local disk at `{cache_root}/{bucket}/{key}`.
//! The tree grows without bound; nothing is ever evicted.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::remote::ObjectPath;

/// Suffix of in-flight temp files
const TEMP_SUFFIX: &str = ".part";

/// Temp files older than this are considered abandoned
const STALE_AFTER: Duration = Duration::from_secs(600);

/// Deterministic mapping from remote object paths to local files
#[derive(Debug, Clone)]
pub struct LocalMirror {
    /// Root directory of the mirror
    root: PathBuf,
}

impl LocalMirror {
    /// Open a mirror rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mirror = Self { root };
        debug!(cache_root = %mirror.root.display(), "Local mirror ready");
        Ok(mirror)
    }

    /// Root directory of the mirror
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local file path for a remote object
    pub fn local_path(&self, path: &ObjectPath) -> PathBuf {
        let mut local = self.root.join(path.bucket());
        for segment in path.key().split('/').filter(|s| !s.is_empty()) {
            local.push(segment);
        }
        local
    }

    /// Local path for a remote object, with parent directories created
    pub fn prepare(&self, path: &ObjectPath) -> io::Result<PathBuf> {
        let local = self.local_path(path);
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(local)
    }

    /// Whether a local copy is present
    pub fn contains(&self, path: &ObjectPath) -> bool {
        self.local_path(path).is_file()
    }

    /// Remove the local copy if present
    pub fn remove(&self, path: &ObjectPath) -> io::Result<()> {
        let local = self.local_path(path);
        match fs::remove_file(&local) {
            Ok(()) => {
                debug!(path = %path, "Removed local copy");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Write bytes as the local copy of `path`
    pub fn write(&self, path: &ObjectPath, data: &[u8]) -> io::Result<PathBuf> {
        let local = self.prepare(path)?;
        write_atomic(&local, data)?;
        debug!(path = %path, local = %local.display(), size = data.len(), "Stored local copy");
        Ok(local)
    }

    /// Remove temp files left behind by interrupted downloads.
    ///
    /// Only files older than [`STALE_AFTER`] are removed; younger ones may
    /// belong to a sibling worker that is still writing.
    pub fn cleanup(&self) {
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let Ok(read_dir) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(TEMP_SUFFIX))
                    && is_stale(&path)
                {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_AFTER)
}

/// Replace `dest` with `data` atomically, creating parent directories.
///
/// The bytes go to a temp file next to `dest` which is then renamed over it,
/// so readers never observe a partial file.
pub fn write_atomic(dest: &Path, data: &[u8]) -> io::Result<()> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".s3mirror-")
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path_mirrors_remote_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = LocalMirror::open(dir.path()).unwrap();
        let path = ObjectPath::parse("/data/tmp/plots/x.jpg").unwrap();
        assert_eq!(
            mirror.local_path(&path),
            dir.path().join("data").join("tmp").join("plots").join("x.jpg")
        );
    }

    #[test]
    fn test_write_remove_contains() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = LocalMirror::open(dir.path()).unwrap();
        let path = ObjectPath::parse("data/a/b.txt").unwrap();

        assert!(!mirror.contains(&path));
        let local = mirror.write(&path, b"hello").unwrap();
        assert!(mirror.contains(&path));
        assert_eq!(fs::read(&local).unwrap(), b"hello");

        mirror.write(&path, b"replaced").unwrap();
        assert_eq!(fs::read(&local).unwrap(), b"replaced");

        mirror.remove(&path).unwrap();
        assert!(!mirror.contains(&path));
        // removing twice is fine
        mirror.remove(&path).unwrap();
    }

    #[test]
    fn test_cleanup_removes_stale_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("data").join("x");
        fs::create_dir_all(&nested).unwrap();
        let stale = nested.join(".s3mirror-abc.part");
        let fresh = nested.join(".s3mirror-def.part");
        let keep = nested.join("keep.txt");
        fs::write(&stale, b"partial").unwrap();
        fs::write(&fresh, b"in flight").unwrap();
        fs::write(&keep, b"ok").unwrap();
        fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        LocalMirror::open(dir.path()).unwrap().cleanup();

        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(keep.exists());
    }
}
