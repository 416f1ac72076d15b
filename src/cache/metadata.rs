//! Metadata Store Implementation
//!
//! Durable `path -> remote mtime` records backing the auto-refresh policy.
//! Records live in a SQLite file inside the cache root, opened in WAL mode so
//! every engine (including each batch worker) can hold its own connection.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, trace};

/// File name of the metadata database inside the cache root
pub const METADATA_FILE: &str = ".s3mirror-mtime.sqlite";

/// How long a writer waits for a sibling holding the write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Persistent last-known remote modification times
pub struct MetadataStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl MetadataStore {
    /// Open (or create) the metadata file inside `cache_root`
    pub fn open(cache_root: &Path) -> rusqlite::Result<Self> {
        let path = cache_root.join(METADATA_FILE);
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS remote_mtime (
                path TEXT PRIMARY KEY,
                mtime TEXT NOT NULL
            );
            "#,
        )?;

        debug!(path = %path.display(), "Opened metadata store");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Last recorded remote mtime for `path`
    pub fn get(&self, path: &str) -> rusqlite::Result<Option<String>> {
        let mtime = self
            .lock()
            .query_row(
                "SELECT mtime FROM remote_mtime WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        trace!(path = path, mtime = ?mtime, "Metadata lookup");
        Ok(mtime)
    }

    /// Record the remote mtime for `path` (last write wins)
    pub fn set(&self, path: &str, mtime: &str) -> rusqlite::Result<()> {
        self.lock().execute(
            "INSERT INTO remote_mtime (path, mtime) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET mtime = excluded.mtime",
            params![path, mtime],
        )?;
        trace!(path = path, mtime = mtime, "Recorded remote mtime");
        Ok(())
    }

    /// Forget the record for `path`
    pub fn remove(&self, path: &str) -> rusqlite::Result<()> {
        self.lock()
            .execute("DELETE FROM remote_mtime WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Number of recorded paths
    pub fn len(&self) -> rusqlite::Result<usize> {
        self.lock()
            .query_row("SELECT COUNT(*) FROM remote_mtime", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
    }

    /// Whether no paths are recorded
    pub fn is_empty(&self) -> rusqlite::Result<bool> {
        self.len().map(|n| n == 0)
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the connection, flushing pending state.
    ///
    /// Owners must call this on teardown; dropping still closes the
    /// connection but swallows any error.
    pub fn close(self) -> rusqlite::Result<()> {
        let conn = self.conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, e)| e)?;
        debug!(path = %self.path.display(), "Closed metadata store");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();

        assert_eq!(store.get("data/a.pkl").unwrap(), None);
        store.set("data/a.pkl", "Mon, 01 Jan 2024 00:00:01 GMT").unwrap();
        assert_eq!(
            store.get("data/a.pkl").unwrap().as_deref(),
            Some("Mon, 01 Jan 2024 00:00:01 GMT")
        );

        store.set("data/a.pkl", "Mon, 01 Jan 2024 00:00:02 GMT").unwrap();
        assert_eq!(
            store.get("data/a.pkl").unwrap().as_deref(),
            Some("Mon, 01 Jan 2024 00:00:02 GMT")
        );
        assert_eq!(store.len().unwrap(), 1);

        store.remove("data/a.pkl").unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        store.set("data/b", "t1").unwrap();
        store.close().unwrap();

        let reopened = MetadataStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("data/b").unwrap().as_deref(), Some("t1"));
        assert!(reopened.path().ends_with(METADATA_FILE));
    }

    #[test]
    fn test_independent_handles_share_records() {
        let dir = tempfile::tempdir().unwrap();
        let first = MetadataStore::open(dir.path()).unwrap();
        let second = MetadataStore::open(dir.path()).unwrap();

        first.set("data/x", "t1").unwrap();
        assert_eq!(second.get("data/x").unwrap().as_deref(), Some("t1"));

        second.set("data/x", "t2").unwrap();
        assert_eq!(first.get("data/x").unwrap().as_deref(), Some("t2"));
    }

    #[test]
    fn test_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        MetadataStore::open(&root).unwrap().close().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let store = MetadataStore::open(&root).unwrap();
                    for i in 0..25 {
                        store
                            .set(&format!("data/{}/{}", worker, i), &format!("t{}", i))
                            .unwrap();
                    }
                    store.close().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = MetadataStore::open(&root).unwrap();
        assert_eq!(store.len().unwrap(), 100);
    }
}
