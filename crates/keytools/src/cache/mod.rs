//! Token-scoped caches with lazy TTL expiry.
//!
//! A [`TokenScopedCache`] maps an access token to an [`ExpiringCacheEntry`]
//! holding a [`CacheBucket`]. The bucket expires as a unit: individual slots
//! inside it are never aged independently.
//!
//! Each bucket slot is a `OnceCell`, so concurrent lookups of the same key on
//! a cold cache run the (KMS) initialiser once and every other caller awaits
//! that result. The bucket lock is only held to find or create the slot, never
//! across the initialiser.
//!
//! Time comes from [`tokio::time::Instant`], which tests control with
//! `tokio::time::pause` / `advance`.

pub mod registry;

pub use registry::SharedCacheRegistry;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{Mutex, OnceCell},
    time::Instant,
};
use tracing::debug;

/// A value stamped with its creation time and a time-to-live.
#[derive(Debug)]
pub struct ExpiringCacheEntry<V> {
    value: V,
    created: Instant,
    lifetime: Duration,
}

impl<V> ExpiringCacheEntry<V> {
    pub fn new(value: V, lifetime: Duration) -> Self {
        Self {
            value,
            created: Instant::now(),
            lifetime,
        }
    }

    /// `true` once `lifetime` has fully elapsed since creation.
    pub fn is_expired(&self) -> bool {
        self.created.elapsed() >= self.lifetime
    }

    pub fn value(&self) -> &V {
        &self.value
    }
}

/// The per-token map from sub-key (KEK id, KMS instance id, master key id)
/// to a lazily initialised value.
pub struct CacheBucket<V> {
    slots: Arc<Mutex<HashMap<String, Arc<OnceCell<V>>>>>,
}

impl<V> Clone for CacheBucket<V> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<V> CacheBucket<V> {
    fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Find or create the slot for `key`.
    pub async fn slot(&self, key: &str) -> Arc<OnceCell<V>> {
        let mut slots = self.slots.lock().await;
        Arc::clone(
            slots
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    /// Initialised value for `key`, if any.
    pub async fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let slots = self.slots.lock().await;
        slots.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Number of initialised slots.
    pub async fn len(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.values().filter(|cell| cell.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Access token -> expiring bucket, shared across all unwrapper/wrapper instances.
pub struct TokenScopedCache<V> {
    name: &'static str,
    entries: Mutex<HashMap<String, ExpiringCacheEntry<CacheBucket<V>>>>,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last sweep.
    last_sweep_ms: AtomicU64,
}

impl<V> TokenScopedCache<V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Bucket for `token`, creating a fresh one if none exists or the current
    /// one has expired.
    pub async fn bucket(&self, token: &str, lifetime: Duration) -> CacheBucket<V> {
        let mut entries = self.entries.lock().await;
        match entries.get(token) {
            Some(entry) if !entry.is_expired() => entry.value().clone(),
            _ => {
                let bucket = CacheBucket::new();
                entries.insert(
                    token.to_owned(),
                    ExpiringCacheEntry::new(bucket.clone(), lifetime),
                );
                bucket
            }
        }
    }

    /// `true` if `token` has a live bucket with an initialised slot for `key`.
    pub async fn contains(&self, token: &str, key: &str) -> bool {
        let bucket = {
            let entries = self.entries.lock().await;
            match entries.get(token) {
                Some(entry) if !entry.is_expired() => entry.value().clone(),
                _ => return false,
            }
        };
        let slots = bucket.slots.lock().await;
        slots.get(key).is_some_and(|cell| cell.initialized())
    }

    /// Number of token entries currently held, expired or not.
    pub async fn token_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Remove expired token entries, at most once per `lifetime` window.
    ///
    /// Concurrent callers race on a compare-and-swap of the last-sweep stamp;
    /// only the winner sweeps. Returns `true` if this call swept.
    pub async fn sweep_expired(&self, lifetime: Duration) -> bool {
        let now_ms = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        let window_ms = u64::try_from(lifetime.as_millis()).unwrap_or(u64::MAX);
        let last = self.last_sweep_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < window_ms {
            return false;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        debug!(
            cache = self.name,
            removed = before - entries.len(),
            remaining = entries.len(),
            "swept expired token entries"
        );
        true
    }

    pub async fn remove_token(&self, token: &str) {
        self.entries.lock().await.remove(token);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}
