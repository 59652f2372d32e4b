//! Process-wide map of image pools

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::config::{Config, PoolConfig};
use crate::pool::{Eviction, ImagePool, PoolError};
use crate::sandbox::{SandboxLifecycle, load_warmup};
use crate::types::{PoolKey, SandboxFile};

type PoolMap = Mutex<HashMap<PoolKey, ImagePool>>;

/// Creates pools on first use and forgets them once they go idle
///
/// Lookups and pool creation are serialized by one registry-wide lock, so
/// concurrent first requests for an image share a single provisioning.
pub struct PoolRegistry {
    pools: Arc<PoolMap>,
    config: PoolConfig,
    warmup_dirs: HashMap<String, PathBuf>,
    lifecycle: Arc<SandboxLifecycle>,
    evictions: mpsc::UnboundedSender<Eviction>,
    next_id: AtomicU64,
    reaper: JoinHandle<()>,
}

impl PoolRegistry {
    /// Create an empty registry
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &Config, lifecycle: Arc<SandboxLifecycle>) -> Self {
        let pools: Arc<PoolMap> = Arc::default();
        let (evictions, evicted) = mpsc::unbounded_channel();
        let reaper = tokio::spawn(reap(Arc::downgrade(&pools), evicted));

        let warmup_dirs = config
            .warmups
            .iter()
            .map(|warmup| (warmup.image.clone(), warmup.directory.clone()))
            .collect();

        Self {
            pools,
            config: config.pool.clone(),
            warmup_dirs,
            lifecycle,
            evictions,
            next_id: AtomicU64::new(1),
            reaper,
        }
    }

    /// Get the pool for `key`, provisioning it if there is none
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get_or_create(&self, key: &PoolKey) -> Result<ImagePool, PoolError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(key) {
            return Ok(pool.clone());
        }

        let warmup = self.warmup_files(key).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pool = ImagePool::provision(
            key.clone(),
            id,
            self.config.clone(),
            Arc::clone(&self.lifecycle),
            warmup,
            self.evictions.clone(),
        )
        .await?;

        pools.insert(key.clone(), pool.clone());
        Ok(pool)
    }

    /// Forget `pool` if it is still the registered pool for its key
    ///
    /// Used when a pool turned out to be closed; the next lookup provisions
    /// a fresh one.
    pub async fn remove(&self, pool: &ImagePool) {
        remove_if_current(&mut *self.pools.lock().await, pool.key(), pool.id());
    }

    /// Get the number of registered pools
    pub async fn len(&self) -> usize {
        self.pools.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pools.lock().await.is_empty()
    }

    /// Check whether a pool is registered for `key`
    pub async fn contains(&self, key: &PoolKey) -> bool {
        self.pools.lock().await.contains_key(key)
    }

    /// Get the registered pool for `key` without provisioning one
    pub async fn get(&self, key: &PoolKey) -> Option<ImagePool> {
        self.pools.lock().await.get(key).cloned()
    }

    /// Shut down and forget every pool
    pub async fn shutdown(&self) {
        let pools: Vec<_> = self.pools.lock().await.drain().map(|(_, pool)| pool).collect();
        info!(count = pools.len(), "shutting down pools");
        for pool in pools {
            pool.shutdown().await;
        }
    }

    async fn warmup_files(&self, key: &PoolKey) -> Result<Option<Arc<[SandboxFile]>>, PoolError> {
        let Some(dir) = self.warmup_dirs.get(&key.image) else {
            return Ok(None);
        };

        let files = load_warmup(dir)
            .await
            .map_err(|source| PoolError::Provision {
                key: key.clone(),
                source,
            })?;
        Ok(Some(files.into()))
    }
}

impl Drop for PoolRegistry {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("config", &self.config)
            .field("warmup_dirs", &self.warmup_dirs)
            .finish_non_exhaustive()
    }
}

/// Apply evictions posted by pools that tore themselves down
async fn reap(pools: Weak<PoolMap>, mut evicted: mpsc::UnboundedReceiver<Eviction>) {
    while let Some(eviction) = evicted.recv().await {
        let Some(pools) = pools.upgrade() else {
            break;
        };
        remove_if_current(&mut *pools.lock().await, &eviction.key, eviction.pool_id);
    }
}

fn remove_if_current(pools: &mut HashMap<PoolKey, ImagePool>, key: &PoolKey, pool_id: u64) {
    if pools.get(key).is_some_and(|pool| pool.id() == pool_id) {
        pools.remove(key);
        debug!(%key, pool_id, "pool evicted from registry");
    }
}
