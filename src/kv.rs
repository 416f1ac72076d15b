//! Content-addressed key-value store
//!
//! Keys of any serializable type are hashed to deterministic object names
//! under a namespace: `{namespace}/k{hash}.pkl`. Each object holds a
//! MessagePack record pairing the original key with its value.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

use crate::cache::{CacheEngine, FileFormat};
use crate::error::{Error, Result};
use crate::remote::ObjectPath;

const HASH_SEED: u64 = 0;

#[derive(Serialize)]
struct RecordRef<'a, K: ?Sized, V: ?Sized> {
    key: &'a K,
    value: &'a V,
}

/// Read side of a record; the stored key is not needed
#[derive(Deserialize)]
struct StoredValue<V> {
    value: V,
}

/// Key-value store over a [`CacheEngine`].
///
/// Distinct keys with the same hash share one object. In strict mode a
/// `put` onto an occupied object fails with [`Error::Conflict`]; otherwise
/// it logs a warning and overwrites.
pub struct ContentAddressedStore<'a> {
    engine: &'a CacheEngine,
    namespace: ObjectPath,
    strict: bool,
}

impl<'a> ContentAddressedStore<'a> {
    /// Store rooted at `namespace` (`bucket` or `bucket/prefix`)
    pub fn new(engine: &'a CacheEngine, namespace: &str, strict: bool) -> Result<Self> {
        Ok(Self {
            engine,
            namespace: ObjectPath::parse(namespace)?,
            strict,
        })
    }

    pub fn namespace(&self) -> &ObjectPath {
        &self.namespace
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Stable 64-bit hash of the key's encoded bytes, as 16 hex digits
    pub fn hash_key<K: Serialize + ?Sized>(key: &K) -> Result<String> {
        let bytes = FileFormat::MessagePack.encode(key)?;
        Ok(format!("{:016x}", xxh64(&bytes, HASH_SEED)))
    }

    /// Remote path holding the record for `key`
    pub fn path_for<K: Serialize + ?Sized>(&self, key: &K) -> Result<String> {
        let name = format!("k{}.pkl", Self::hash_key(key)?);
        Ok(self.namespace.join(&name)?.to_string())
    }

    /// Store `value` under `key`
    pub async fn put<K, V>(&self, key: &K, value: &V) -> Result<PathBuf>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let path = self.path_for(key)?;

        if self.engine.object_exists(&path).await? {
            if self.strict {
                return Err(Error::Conflict { path });
            }
            warn!(path = %path, "Overwriting existing key-value record");
        }

        debug!(path = %path, "Putting key-value record");
        self.engine
            .store(&RecordRef { key, value }, &path, Some(FileFormat::MessagePack))
            .await
    }

    /// Value stored under `key`, or `None` if nothing is stored
    pub async fn get<K, V>(&self, key: &K) -> Result<Option<V>>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        let path = self.path_for(key)?;
        if !self.engine.object_exists(&path).await? {
            debug!(path = %path, "Key-value record absent");
            return Ok(None);
        }

        let record: StoredValue<V> = self
            .engine
            .load(
                &path,
                self.engine.default_refresh(),
                Some(FileFormat::MessagePack),
            )
            .await?;
        Ok(Some(record.value))
    }

    /// Value stored under `key`, or `default` if nothing is stored
    pub async fn get_or<K, V>(&self, key: &K, default: V) -> Result<V>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        Ok(self.get(key).await?.unwrap_or(default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorConfig;
    use crate::remote::MemoryStore;
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, Arc<MemoryStore>, CacheEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_buckets(&["kv-store"]));
        let config = MirrorConfig::builder()
            .cache_root(dir.path())
            .build_with(|_| None)
            .unwrap();
        let engine = CacheEngine::new(config, store.clone()).unwrap();
        (dir, store, engine)
    }

    #[test]
    fn test_hash_is_stable_and_distinguishes_keys() {
        let a = ContentAddressedStore::hash_key(&vec![1.5f64, -0.25]).unwrap();
        let b = ContentAddressedStore::hash_key(&vec![1.5f64, -0.25]).unwrap();
        let c = ContentAddressedStore::hash_key(&vec![1.5f64, 0.25]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_put_get_and_default() {
        let (_dir, store, engine) = setup();
        let kv = ContentAddressedStore::new(&engine, "kv-store/test", false).unwrap();

        let k1 = vec![vec![0.1f64], vec![0.2]];
        let k2 = vec![vec![0.3f64], vec![0.4]];
        kv.put(&k1, &vec![1.0f64]).await.unwrap();
        kv.put(&k2, &vec![2.0f64]).await.unwrap();

        assert_eq!(kv.get::<_, Vec<f64>>(&k1).await.unwrap(), Some(vec![1.0]));
        assert_eq!(kv.get::<_, Vec<f64>>(&k2).await.unwrap(), Some(vec![2.0]));
        assert_eq!(kv.get_or(&"never written", -1i64).await.unwrap(), -1);

        let path = kv.path_for(&k1).unwrap();
        assert!(path.starts_with("kv-store/test/k"));
        assert!(path.ends_with(".pkl"));
        let key = path.trim_start_matches("kv-store/");
        assert!(store.read("kv-store", key).is_some());
    }

    #[tokio::test]
    async fn test_strict_mode_conflicts() {
        let (_dir, _store, engine) = setup();
        let kv = ContentAddressedStore::new(&engine, "kv-store/strict", true).unwrap();

        kv.put("key", &1u32).await.unwrap();
        let err = kv.put("key", &2u32).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(kv.get::<_, u32>("key").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_lenient_mode_overwrites() {
        let (_dir, _store, engine) = setup();
        let kv = ContentAddressedStore::new(&engine, "kv-store", false).unwrap();

        kv.put("key", "first").await.unwrap();
        kv.put("key", "second").await.unwrap();
        assert_eq!(
            kv.get::<_, String>("key").await.unwrap().as_deref(),
            Some("second")
        );
    }

    #[tokio::test]
    async fn test_missing_bucket() {
        let (_dir, _store, engine) = setup();
        let kv = ContentAddressedStore::new(&engine, "elsewhere", false).unwrap();
        assert_eq!(kv.get_or("k", 7u8).await.unwrap(), 7);
        assert!(kv.put("k", &1u8).await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_empty_namespace_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let config = MirrorConfig::builder()
            .cache_root(dir.path())
            .build_with(|_| None)
            .unwrap();
        let engine = CacheEngine::new(config, store).unwrap();
        assert!(matches!(
            ContentAddressedStore::new(&engine, "/", false),
            Err(Error::Configuration(_))
        ));
    }
}
