//! TTL cache with bounded capacity
//!
//! Every entry carries its own time-to-live. The store holds at most
//! `capacity` entries; inserting a new key into a full store evicts the
//! entry inserted earliest (FIFO by insertion, not LRU: reads do not
//! refresh an entry's position).
//!
//! Expired entries are removed lazily on `get`/`has` and by a periodic
//! sweep ([`TtlCache::spawn_sweeper`]) so keys that are written but never
//! read again do not accumulate.
//!
//! Time-dependent operations have an `_at` variant taking an explicit
//! [`Instant`] for deterministic callers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::CacheConfig;

/// Entries a default cache holds before evicting.
pub const DEFAULT_CAPACITY: usize = 1000;

/// TTL applied when a caller does not supply one (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Thread-safe TTL cache with FIFO capacity eviction
pub struct TtlCache<V> {
    store: Mutex<Store<V>>,
    /// Per-key gates serialising concurrent fetches in `get_or_set`
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    capacity: usize,
    default_ttl: Duration,
    counters: Counters,
}

struct Store<V> {
    entries: HashMap<String, CacheEntry<V>>,
    next_seq: u64,
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    /// Insertion order among entries sharing an `inserted_at`
    seq: u64,
}

impl<V> CacheEntry<V> {
    /// A zero TTL is never live, even at the instant of insertion.
    fn is_live(&self, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(self.inserted_at) <= self.ttl
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Snapshot of cache occupancy and activity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Current number of entries
    pub size: usize,
    /// Maximum number of entries
    pub capacity: usize,
    /// `100 * size / capacity`
    pub percentage: f64,
    /// Reads served from the cache
    pub hits: u64,
    /// Reads that found nothing live
    pub misses: u64,
    /// Entries dropped to make room for a new key
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache holding at most `capacity` entries.
    ///
    /// A zero capacity is raised to 1 so the store can always accept the
    /// most recent write.
    #[must_use]
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            store: Mutex::new(Store {
                entries: HashMap::new(),
                next_seq: 0,
            }),
            in_flight: DashMap::new(),
            capacity: capacity.max(1),
            default_ttl,
            counters: Counters::default(),
        }
    }

    /// Create a cache from configuration
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.default_ttl)
    }

    /// Maximum number of entries
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// TTL used by [`set`](Self::set) and [`get_or_set`](Self::get_or_set)
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Store `value` under `key` with the default TTL
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_at(key, value, self.default_ttl, Instant::now());
    }

    /// Store `value` under `key` with an explicit TTL
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.set_at(key, value, ttl, Instant::now());
    }

    /// Store `value` as if inserted at `now`.
    ///
    /// Overwriting an existing key refreshes its insertion time and never
    /// evicts. A new key arriving at a full store evicts the oldest
    /// insertion first.
    pub fn set_at(&self, key: impl Into<String>, value: V, ttl: Duration, now: Instant) {
        let key = key.into();
        let mut store = self.store.lock();

        if !store.entries.contains_key(&key) && store.entries.len() >= self.capacity {
            if let Some(oldest) = Self::oldest_key(&store.entries) {
                store.entries.remove(&oldest);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %oldest, "Evicted oldest cache entry to make room");
            }
        }

        let seq = store.next_seq;
        store.next_seq += 1;
        store.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                ttl,
                seq,
            },
        );
    }

    fn oldest_key(entries: &HashMap<String, CacheEntry<V>>) -> Option<String> {
        entries
            .iter()
            .min_by_key(|(_, entry)| (entry.inserted_at, entry.seq))
            .map(|(key, _)| key.clone())
    }

    /// Get a live value.
    ///
    /// Returns `None` if the key is absent or its TTL has elapsed; an
    /// expired entry is removed.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// [`get`](Self::get) evaluated at `now`
    pub fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let value = self.lookup(key, now);
        if value.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Whether a live entry exists; purges an expired one like `get`
    pub fn has(&self, key: &str) -> bool {
        self.has_at(key, Instant::now())
    }

    /// [`has`](Self::has) evaluated at `now`
    pub fn has_at(&self, key: &str, now: Instant) -> bool {
        self.lookup(key, now).is_some()
    }

    fn lookup(&self, key: &str, now: Instant) -> Option<V> {
        let mut store = self.store.lock();
        let live = store.entries.get(key).map(|entry| entry.is_live(now))?;
        if live {
            store.entries.get(key).map(|entry| entry.value.clone())
        } else {
            store.entries.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Remove `key`, returning whether an entry was present
    pub fn delete(&self, key: &str) -> bool {
        self.store.lock().entries.remove(key).is_some()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.store.lock().entries.clear();
    }

    /// Number of stored entries, including expired ones not yet purged
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    /// Return `true` when the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.lock().entries.is_empty()
    }

    /// Snapshot of the stored keys, in no particular order
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.store.lock().entries.keys().cloned().collect()
    }

    /// Current occupancy and counters
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let size = self.len();
        CacheStats {
            size,
            capacity: self.capacity,
            percentage: size as f64 / self.capacity as f64 * 100.0,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    /// [`evict_expired`](Self::evict_expired) evaluated at `now`
    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let mut store = self.store.lock();
        let before = store.entries.len();
        store.entries.retain(|_, entry| entry.is_live(now));
        let count = before - store.entries.len();

        if count > 0 {
            self.counters
                .expirations
                .fetch_add(count as u64, Ordering::Relaxed);
            debug!(count, "Swept expired cache entries");
        }
        count
    }

    /// Return the live value for `key`, or run `fetcher` and cache its
    /// result with the default TTL.
    pub async fn get_or_set<F, Fut, E>(&self, key: &str, fetcher: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.get_or_set_with_ttl(key, self.default_ttl, fetcher).await
    }

    /// Return the live value for `key`, or run `fetcher` and cache its
    /// result for `ttl`.
    ///
    /// Concurrent callers missing the same key are single-flighted: only
    /// one fetcher runs and the others return the value it stored. A
    /// failing fetcher stores nothing and its error is returned unchanged;
    /// the next waiter then runs its own fetcher.
    pub async fn get_or_set_with_ttl<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        fetcher: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let gate = Arc::clone(self.in_flight.entry(key.to_string()).or_default().value());
        let result = {
            let _permit = gate.lock().await;

            // Filled by the caller we queued behind
            if let Some(value) = self.lookup(key, Instant::now()) {
                Ok(value)
            } else {
                match fetcher().await {
                    Ok(value) => {
                        self.set_with_ttl(key, value.clone(), ttl);
                        Ok(value)
                    }
                    Err(e) => {
                        debug!(key, "Cache fetcher failed; nothing stored");
                        Err(e)
                    }
                }
            }
        };

        // The map and this function hold the only references: no waiters.
        self.in_flight
            .remove_if(key, |_, g| Arc::strong_count(g) <= 2);
        result
    }
}

impl<V> TtlCache<V>
where
    V: Clone + Send + 'static,
{
    /// Spawn a background task that sweeps expired entries every `period`.
    ///
    /// The task stops once every other owner of `cache` has dropped it.
    pub fn spawn_sweeper(cache: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if Arc::strong_count(&cache) <= 1 {
                    break;
                }
                cache.evict_expired();
            }
        })
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}
