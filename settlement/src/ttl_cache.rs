// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Keyed TTL cache shared by the price oracle and the chain-head pollers.
//!
//! Entries are never evicted on expiry: a caller that fails to refresh may
//! still read the last known value through [`TtlCache::get_last_known`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    updated_at: Instant,
}

/// A thread-safe TTL cache.
///
/// # Example
/// ```ignore
/// let cache = TtlCache::<&str, u64>::new(Duration::from_secs(5));
/// cache.update("head", 12345).await;
/// if let Some(value) = cache.get_if_valid(&"head").await {
///     println!("Cached value: {}", value);
/// }
/// ```
#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    /// How long an entry is served as fresh
    cache_duration: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(cache_duration: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cache_duration,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached value if it is younger than the TTL
    pub async fn get_if_valid(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.updated_at.elapsed() < self.cache_duration => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return the last stored value regardless of age, with its age
    pub async fn get_last_known(&self, key: &K) -> Option<(V, Duration)> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|entry| (entry.value.clone(), entry.updated_at.elapsed()))
    }

    /// Store a value. Concurrent writers race; the last one wins.
    pub async fn update(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CacheEntry {
                value,
                updated_at: Instant::now(),
            },
        );
    }

    /// Drop entries older than the TTL. Callers relying on
    /// `get_last_known` must not prune.
    pub async fn prune_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.updated_at.elapsed() < self.cache_duration);
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Invalidate an entry (force next access to fetch fresh data)
    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
