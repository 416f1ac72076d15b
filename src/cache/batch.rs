//! Batch fetch/load
//!
//! Fans a list of paths out to a fixed pool of workers. Every worker owns a
//! private [`CacheEngine`] (and so a private metadata connection) built from
//! the same configuration snapshot; only the object store handle is shared.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::codec::FileFormat;
use super::engine::{CacheEngine, Refresh};
use crate::config::MirrorConfig;
use crate::error::{Error, Result};
use crate::remote::ObjectStore;

type Queue = Arc<Mutex<VecDeque<(usize, String)>>>;

/// Parallel, order-preserving fetch and load over many paths
#[derive(Clone)]
pub struct BatchCoordinator {
    config: MirrorConfig,
    store: Arc<dyn ObjectStore>,
}

impl BatchCoordinator {
    pub fn new(config: MirrorConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self { config, store }
    }

    /// Coordinator sharing an engine's configuration and object store
    pub fn from_engine(engine: &CacheEngine) -> Self {
        Self::new(engine.config().clone(), Arc::clone(engine.object_store()))
    }

    /// Override the worker pool size
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.workers = workers.max(1);
        self
    }

    /// Fetch every path. The outer `Err` is reserved for invalid requests
    /// rejected before any network call; per-item failures sit at the
    /// item's index in the returned list.
    pub async fn fetch_many<S: AsRef<str>>(
        &self,
        paths: &[S],
        refresh: Refresh,
        version_id: Option<&str>,
    ) -> Result<Vec<Result<PathBuf>>> {
        self.validate(refresh, version_id)?;
        Ok(self
            .run(paths, move |engine, path| async move {
                engine.fetch(&path, refresh).await
            })
            .await)
    }

    /// Fetch and decode every path, with the same ordering and error
    /// contract as [`BatchCoordinator::fetch_many`]
    pub async fn load_many<T, S>(
        &self,
        paths: &[S],
        refresh: Refresh,
        format: Option<FileFormat>,
        version_id: Option<&str>,
    ) -> Result<Vec<Result<T>>>
    where
        T: DeserializeOwned + Send + 'static,
        S: AsRef<str>,
    {
        self.validate(refresh, version_id)?;
        Ok(self
            .run(paths, move |engine, path| async move {
                engine.load::<T>(&path, refresh, format).await
            })
            .await)
    }

    fn validate(&self, refresh: Refresh, version_id: Option<&str>) -> Result<()> {
        if version_id.is_some() {
            return Err(Error::Configuration(
                "batch operations cannot pin an object version".to_string(),
            ));
        }
        if refresh == Refresh::Auto && self.config.disable_auto_refresh {
            return Err(Error::Configuration(
                "refresh=auto requires the metadata store, but auto refresh is disabled"
                    .to_string(),
            ));
        }
        Ok(())
    }

    async fn run<T, S, F, Fut>(&self, paths: &[S], job: F) -> Vec<Result<T>>
    where
        T: Send + 'static,
        S: AsRef<str>,
        F: Fn(Arc<CacheEngine>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let total = paths.len();
        if total == 0 {
            return Vec::new();
        }

        let queue: Queue = Arc::new(Mutex::new(
            paths
                .iter()
                .enumerate()
                .map(|(index, path)| (index, path.as_ref().to_string()))
                .collect(),
        ));
        let job = Arc::new(job);
        let workers = self.config.workers.clamp(1, total);

        info!(items = total, workers = workers, "Starting batch");

        let mut join_set = JoinSet::new();
        for worker in 0..workers {
            let config = self.config.clone();
            let store = Arc::clone(&self.store);
            let queue = Arc::clone(&queue);
            let job = Arc::clone(&job);
            join_set.spawn(async move { run_worker(worker, config, store, queue, job).await });
        }

        let mut slots: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(results) => {
                    for (index, result) in results {
                        slots[index] = Some(result);
                    }
                }
                Err(e) => warn!(error = %e, "Batch worker panicked"),
            }
        }

        let mut failed = 0;
        let results: Vec<Result<T>> = slots
            .into_iter()
            .map(|slot| {
                let result = slot.unwrap_or_else(|| {
                    Err(Error::Task(
                        "no batch worker completed this item".to_string(),
                    ))
                });
                if result.is_err() {
                    failed += 1;
                }
                result
            })
            .collect();

        info!(items = total, failed = failed, "Batch finished");
        results
    }
}

/// Build a private engine, then drain the queue until it is empty.
///
/// A worker whose engine cannot be built takes no items; its siblings pick
/// them up, and any items nobody could take are reported as failures.
async fn run_worker<T, F, Fut>(
    worker: usize,
    config: MirrorConfig,
    store: Arc<dyn ObjectStore>,
    queue: Queue,
    job: Arc<F>,
) -> Vec<(usize, Result<T>)>
where
    F: Fn(Arc<CacheEngine>, String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let engine = match CacheEngine::open_worker(config, store) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            warn!(worker = worker, error = %e, "Batch worker failed to start");
            return Vec::new();
        }
    };

    let mut done = Vec::new();
    loop {
        let next = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some((index, path)) = next else {
            break;
        };

        let result = job(Arc::clone(&engine), path.clone()).await;
        if let Err(e) = &result {
            debug!(worker = worker, path = %path, error = %e, "Batch item failed");
        }
        done.push((index, result));
    }

    match Arc::try_unwrap(engine) {
        Ok(engine) => {
            if let Err(e) = engine.shutdown() {
                warn!(worker = worker, error = %e, "Batch worker shutdown failed");
            }
        }
        Err(_) => warn!(worker = worker, "Batch worker engine still shared at shutdown"),
    }
    done
}
