//! Expiring key/value storage.
//!
//! [`TtlCache`] is the shared building block; [`stores`] wraps it into one
//! typed store per purpose (entity lookups, idempotency markers, throttle
//! markers), each with its own TTL policy and key space.
//!
//! Expiry is measured with [`tokio::time::Instant`], so a paused tokio clock
//! (`tokio::time::pause` / `advance`) drives it in tests.

pub mod stores;

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

pub use stores::{Caches, IdempotencyStore, Lookup, LookupCache, SelfChannel, ThrottleStore};

// ============================================================================
// Policy
// ============================================================================

/// TTL and capacity settings for one cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// TTL applied when the caller does not pass one.
    pub default_ttl: Duration,
    /// Upper bound on live entries. `None` means unbounded.
    pub max_entries: Option<usize>,
}

impl CachePolicy {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            max_entries: None,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }
}

// ============================================================================
// TtlCache
// ============================================================================

struct Slot<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Slot<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

struct CacheInner<K, V> {
    name: &'static str,
    policy: CachePolicy,
    entries: DashMap<K, Slot<V>>,
}

/// Concurrent key/value store whose entries expire after a TTL.
///
/// Cheap to clone; clones share the same storage. All operations are safe to
/// call from many tasks without external locking.
pub struct TtlCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache. `name` only shows up in logs.
    pub fn new(name: &'static str, policy: CachePolicy) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                name,
                policy,
                entries: DashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn policy(&self) -> CachePolicy {
        self.inner.policy
    }

    /// Get a live value. Expired entries are removed on the way.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        if let Some(slot) = self.inner.entries.get(key) {
            if slot.is_live(now) {
                return Some(slot.value.clone());
            }
        } else {
            return None;
        }

        self.inner
            .entries
            .remove_if(key, |_, slot| !slot.is_live(now));
        None
    }

    /// True if a live entry exists for `key`.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Insert or overwrite an entry with an explicit TTL.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        if !self.inner.entries.contains_key(&key) {
            self.make_room(now);
        }
        self.inner.entries.insert(
            key,
            Slot {
                value,
                expires_at: now + ttl,
            },
        );
    }

    /// Insert or overwrite an entry with the namespace's default TTL.
    pub fn insert(&self, key: K, value: V) {
        self.set(key, value, self.inner.policy.default_ttl);
    }

    /// Insert only if no live entry exists. Returns true if this call inserted.
    ///
    /// The check and the insert happen under the same shard lock, so among
    /// concurrent callers for one key exactly one observes `true`.
    pub fn insert_if_absent(&self, key: K, value: V, ttl: Duration) -> bool {
        let now = Instant::now();
        if !self.inner.entries.contains_key(&key) {
            self.make_room(now);
        }

        let slot = Slot {
            value,
            expires_at: now + ttl,
        };
        match self.inner.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(slot);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                true
            }
        }
    }

    /// Remove an entry. Returns true if a live entry was removed.
    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.inner
            .entries
            .remove(key)
            .is_some_and(|(_, slot)| slot.is_live(now))
    }

    /// Collect the keys of live entries matching `predicate`.
    pub fn scan<F>(&self, predicate: F) -> Vec<K>
    where
        F: Fn(&K) -> bool,
    {
        let now = Instant::now();
        self.inner
            .entries
            .iter()
            .filter(|entry| entry.value().is_live(now) && predicate(entry.key()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove every entry whose key matches `predicate`. Returns the count.
    pub fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&K) -> bool,
    {
        // Keys are collected first; removing while iterating would deadlock on the shard.
        let keys: Vec<K> = self
            .inner
            .entries
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        keys.iter()
            .filter(|key| self.inner.entries.remove(*key).is_some())
            .count()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.inner.entries.len())
    }

    /// Number of stored entries, including ones that expired but were not swept yet.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Spawn a task that purges expired entries every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!(
                        cache = cache.name(),
                        removed,
                        remaining = cache.len(),
                        "Swept expired cache entries"
                    );
                }
            }
        })
    }

    /// Enforce `max_entries` before inserting a new key.
    fn make_room(&self, now: Instant) {
        let Some(max) = self.inner.policy.max_entries else {
            return;
        };
        if self.inner.entries.len() < max {
            return;
        }

        self.inner.entries.retain(|_, slot| slot.is_live(now));
        while self.inner.entries.len() >= max {
            let victim = self
                .inner
                .entries
                .iter()
                .min_by_key(|entry| entry.value().expires_at)
                .map(|entry| entry.key().clone());
            match victim {
                Some(key) => {
                    self.inner.entries.remove(&key);
                    debug!(cache = self.inner.name, "Evicted entry closest to expiry");
                }
                None => break,
            }
        }
    }
}

impl<V> TtlCache<String, V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Keys of live entries starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.scan(|key| key.starts_with(prefix))
    }

    /// Remove every entry starting with `prefix`. Returns the count.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        self.remove_where(|key| key.starts_with(prefix))
    }
}
