//! In-process cache storage.
//!
//! A single LRU map of fingerprint → entry, plus a tag index pointing back at
//! the keys carrying each tag. Both structures live behind the same lock so
//! an invalidation can never observe one without the other.

use std::any::{Any, type_name};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use lru::LruCache;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::CacheError;
use super::keys::{CacheTag, Fingerprint};
use super::lock;

const METRIC_HITS: &str = "trefa_cache_hit_total";
const METRIC_MISSES: &str = "trefa_cache_miss_total";
const METRIC_EVICTIONS: &str = "trefa_cache_evict_total";
const METRIC_EXPIRED: &str = "trefa_cache_expired_total";
const METRIC_ENTRIES: &str = "trefa_cache_entries";

struct StoredEntry {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    canonical: Arc<str>,
    inserted_at: Instant,
    ttl: Duration,
    tags: Vec<CacheTag>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

struct StoreInner {
    entries: LruCache<String, StoredEntry>,
    tag_index: HashMap<CacheTag, HashSet<String>>,
    hits: u64,
    misses: u64,
}

impl StoreInner {
    /// Remove `key` from the map and from every tag set that references it.
    fn remove(&mut self, key: &str) -> Option<StoredEntry> {
        let entry = self.entries.pop(key)?;
        self.unindex(key, &entry.tags);
        Some(entry)
    }

    fn unindex(&mut self, key: &str, tags: &[CacheTag]) {
        for tag in tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

enum Lookup {
    Absent,
    Expired,
    Collision,
    Found(Arc<dyn Any + Send + Sync>, &'static str),
}

/// Point-in-time view of the store, as reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    /// `None` until the first lookup.
    pub hit_rate: Option<f64>,
    /// Live entry count per tag.
    pub tags: BTreeMap<&'static str, usize>,
}

/// Bounded, tag-aware, TTL-expiring value store.
///
/// Values are stored type-erased and recovered by downcast on read, so one
/// store can hold every response shape the service produces.
pub struct CacheStore {
    inner: RwLock<StoreInner>,
    capacity: NonZeroUsize,
}

impl CacheStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                entries: LruCache::new(capacity),
                tag_index: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            capacity,
        }
    }

    /// Look up a fresh value of type `T`.
    ///
    /// Expired entries are dropped on the way out. An entry whose canonical
    /// parameters or stored type do not match the request is reported as a
    /// miss and left for the next write to replace.
    pub fn get<T>(&self, fingerprint: &Fingerprint) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let key = fingerprint.as_str();
        let kind = fingerprint.kind().as_str();
        let now = Instant::now();
        let mut inner = lock::write(&self.inner, "store.get");

        let lookup = match inner.entries.get(key) {
            None => Lookup::Absent,
            Some(entry) if entry.is_expired(now) => Lookup::Expired,
            Some(entry) if *entry.canonical != *fingerprint.canonical() => Lookup::Collision,
            Some(entry) => Lookup::Found(Arc::clone(&entry.value), entry.type_name),
        };

        let value = match lookup {
            Lookup::Absent => None,
            Lookup::Expired => {
                inner.remove(key);
                counter!(METRIC_EXPIRED).increment(1);
                gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
                None
            }
            Lookup::Collision => {
                let err = CacheError::Collision {
                    key: key.to_string(),
                };
                warn!(target = "trefa::cache::store", error = %err, "treating collision as a miss");
                None
            }
            Lookup::Found(value, found) => match value.downcast::<T>() {
                Ok(value) => Some(value),
                Err(_) => {
                    let err = CacheError::TypeMismatch {
                        key: key.to_string(),
                        found,
                        expected: type_name::<T>(),
                    };
                    warn!(target = "trefa::cache::store", error = %err, "treating type mismatch as a miss");
                    None
                }
            },
        };

        if value.is_some() {
            inner.hits += 1;
            counter!(METRIC_HITS, "kind" => kind).increment(1);
        } else {
            inner.misses += 1;
            counter!(METRIC_MISSES, "kind" => kind).increment(1);
        }
        value
    }

    /// Store `value` under `fingerprint`, replacing any previous entry.
    ///
    /// A zero `ttl` only removes the previous entry. When the store is full,
    /// expired entries are purged first and the least recently used entry is
    /// evicted only if that did not free a slot.
    pub fn set<T>(&self, fingerprint: &Fingerprint, value: Arc<T>, ttl: Duration, tags: &[CacheTag])
    where
        T: Any + Send + Sync,
    {
        let key = fingerprint.as_str();
        let now = Instant::now();
        let mut inner = lock::write(&self.inner, "store.set");

        inner.remove(key);
        if ttl.is_zero() {
            gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
            return;
        }

        if inner.entries.len() >= self.capacity.get() {
            let purged = inner.purge_expired(now);
            if purged > 0 {
                counter!(METRIC_EXPIRED).increment(purged as u64);
            }
        }

        let mut entry_tags = tags.to_vec();
        entry_tags.sort_unstable();
        entry_tags.dedup();

        let entry = StoredEntry {
            value,
            type_name: type_name::<T>(),
            canonical: fingerprint.canonical_arc(),
            inserted_at: now,
            ttl,
            tags: entry_tags.clone(),
        };

        // The key was popped above, so anything returned here is an eviction.
        if let Some((evicted_key, evicted)) = inner.entries.push(key.to_string(), entry) {
            inner.unindex(&evicted_key, &evicted.tags);
            counter!(METRIC_EVICTIONS).increment(1);
            debug!(
                target = "trefa::cache::store",
                evicted = %evicted_key,
                "evicted least recently used entry"
            );
        }

        for tag in entry_tags {
            inner
                .tag_index
                .entry(tag)
                .or_default()
                .insert(key.to_string());
        }
        gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
    }

    /// Remove every entry carrying `tag`. Returns how many entries were removed.
    pub fn invalidate_tag(&self, tag: CacheTag) -> usize {
        let mut inner = lock::write(&self.inner, "store.invalidate_tag");
        let Some(keys) = inner.tag_index.remove(&tag) else {
            return 0;
        };
        let mut removed = 0;
        for key in &keys {
            if inner.remove(key).is_some() {
                removed += 1;
            }
        }
        gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
        removed
    }

    /// Remove a single entry by its key string.
    pub fn invalidate_key(&self, key: &str) -> bool {
        let mut inner = lock::write(&self.inner, "store.invalidate_key");
        let removed = inner.remove(key).is_some();
        gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
        removed
    }

    /// Drop everything. Hit and miss counters are kept.
    pub fn clear(&self) -> usize {
        let mut inner = lock::write(&self.inner, "store.clear");
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.tag_index.clear();
        gauge!(METRIC_ENTRIES).set(0.0);
        removed
    }

    /// Remove entries whose TTL has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut inner = lock::write(&self.inner, "store.purge_expired");
        let purged = inner.purge_expired(Instant::now());
        if purged > 0 {
            counter!(METRIC_EXPIRED).increment(purged as u64);
        }
        gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
        purged
    }

    pub fn contains(&self, key: &str) -> bool {
        lock::read(&self.inner, "store.contains")
            .entries
            .contains(key)
    }

    pub fn len(&self) -> usize {
        lock::read(&self.inner, "store.len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = lock::read(&self.inner, "store.stats");
        let lookups = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            max_size: self.capacity.get(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: (lookups > 0).then(|| inner.hits as f64 / lookups as f64),
            tags: inner
                .tag_index
                .iter()
                .map(|(tag, keys)| (tag.as_str(), keys.len()))
                .collect(),
        }
    }
}
