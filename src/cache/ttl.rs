//! Key/value cache with per-entry expiry, backed by [`moka`].
//!
//! Each entry carries its own TTL through a [`moka::Expiry`] policy, so an
//! auth token can live for the realm's `expires_in` while a manifest next to
//! it lives thirty seconds.  Reads also compare against the tokio clock: an
//! entry read at or after its deadline is reported absent even if moka has
//! not evicted it yet.

use std::hash::Hash;
use std::time::Duration;

use moka::sync::Cache;
use moka::Expiry;
use tokio::time::Instant;
use tracing::trace;

/// Upper bound on entries per cache.  Least recently used entries go first.
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    ttl: Duration,
    expires_at: Instant,
}

/// Hands moka the TTL stored on each entry.  Overwrites restart the clock.
struct EntryTtl;

impl<K, V> Expiry<K, CacheEntry<V>> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &K,
        entry: &CacheEntry<V>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        entry: &CacheEntry<V>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

pub struct TtlCache<K, V> {
    name: &'static str,
    entries: Cache<K, CacheEntry<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self::with_max_entries(name, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(name: &'static str, max_entries: u64) -> Self {
        Self {
            name,
            entries: Cache::builder()
                .name(name)
                .max_capacity(max_entries)
                .expire_after(EntryTtl)
                .build(),
        }
    }

    /// Return the cached value if present and not yet expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        if Instant::now() < entry.expires_at {
            trace!(cache = self.name, "cache hit");
            Some(entry.value)
        } else {
            trace!(cache = self.name, "cache entry expired");
            self.entries.invalidate(key);
            None
        }
    }

    /// Insert or overwrite `key`, resetting its expiry to `now + ttl`.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Number of stored entries once pending evictions have been applied.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache").field("name", &self.name).finish()
    }
}
