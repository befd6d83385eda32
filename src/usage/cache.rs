//! TTL cache that collapses concurrent computations per key

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::Mutex as AsyncMutex;

/// A computed value, when it was produced and the cache generation it
/// belongs to
#[derive(Debug, Clone)]
struct CachedValue<V> {
    value: V,
    computed_at: Instant,
    generation: u64,
}

type Slot<V> = Arc<AsyncMutex<Option<CachedValue<V>>>>;

/// Memoizes expensive async computations for a short time.
///
/// Every key owns an async lock. The first caller for a stale key holds it
/// while computing; callers arriving meanwhile wait on the same lock and then
/// pick up the fresh value instead of computing again.
///
/// Clearing bumps a generation instead of dropping slots, so a computation
/// still in flight keeps its lock and later callers queue behind it.
#[derive(Debug)]
pub struct CacheManager<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
    generation: AtomicU64,
}

impl<K, V> Default for CacheManager<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }
}

impl<K, V> CacheManager<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    /// Create a new cache manager
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Slot<V> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.clone()).or_default().clone()
    }

    /// Return the cached value for `key` if it is younger than `ttl`,
    /// otherwise run `compute` and cache its result.
    ///
    /// If `compute` fails and an older value exists, the older value is
    /// returned. Errors only surface when nothing was ever cached.
    pub async fn get_or_compute<F, Fut, E>(&self, key: K, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Display,
    {
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;
        let generation = self.generation.load(Ordering::Acquire);

        if let Some(cached) = guard.as_ref() {
            if cached.generation == generation && cached.computed_at.elapsed() < ttl {
                return Ok(cached.value.clone());
            }
        }

        debug!("Cache miss for {:?}, computing", key);
        match compute().await {
            Ok(value) => {
                *guard = Some(CachedValue {
                    value: value.clone(),
                    computed_at: Instant::now(),
                    generation,
                });
                Ok(value)
            }
            Err(e) => match guard.as_ref() {
                Some(stale) => {
                    warn!("Refresh of {:?} failed, serving stale value: {}", key, e);
                    Ok(stale.value.clone())
                }
                None => Err(e),
            },
        }
    }

    /// Infallible variant of [`get_or_compute`](Self::get_or_compute)
    pub async fn get_or_insert_with<F, Fut>(&self, key: K, ttl: Duration, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let result: Result<V, std::convert::Infallible> = self
            .get_or_compute(key, ttl, || async move { Ok(compute().await) })
            .await;
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Last computed value regardless of age, without waiting on an
    /// in-flight computation
    pub fn get_cached(&self, key: &K) -> Option<V> {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.get(key)?.clone()
        };
        let guard = slot.try_lock().ok()?;
        let generation = self.generation.load(Ordering::Acquire);
        guard
            .as_ref()
            .filter(|c| c.generation == generation)
            .map(|c| c.value.clone())
    }

    /// Expire every cached value. The next call per key recomputes.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}
