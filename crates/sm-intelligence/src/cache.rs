//! Coalescing TTL + LRU cache for AI responses.
//!
//! For any fingerprint at most one compute runs at a time. Concurrent callers
//! for the same fingerprint wait on the leader's result instead of starting
//! their own. Successful results are stored with a fresh TTL; failures are
//! handed to the waiters and then forgotten.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use serde::Serialize;
use sm_core::config::CacheConfig;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub capacity: usize,
    pub ttl: Duration,
}

impl CacheSettings {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { capacity, ttl }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.ttl())
    }
}

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupSource {
    /// Stored and fresh.
    Hit,
    /// Another caller's in-flight compute.
    Coalesced,
    /// This caller ran the compute.
    Computed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lookup<V> {
    pub value: V,
    pub source: LookupSource,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub inflight: usize,
    pub coalesced: u64,
    pub hit_rate: f64,
}

struct Stored<V> {
    value: V,
    stored_at: Instant,
}

type Outcome<V, E> = Option<Result<V, E>>;

struct Inflight<V, E> {
    token: u64,
    result: watch::Receiver<Outcome<V, E>>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    coalesced: AtomicU64,
    tokens: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ResponseCache<V, E> {
    settings: CacheSettings,
    entries: Mutex<LruCache<Fingerprint, Stored<V>, ahash::RandomState>>,
    inflight: DashMap<Fingerprint, Inflight<V, E>>,
    counters: Counters,
}

/// Clears the leader's in-flight marker if the leader is dropped mid-compute,
/// which closes the channel and sends waiters back around the loop.
struct LeaderGuard<'a, V, E> {
    inflight: &'a DashMap<Fingerprint, Inflight<V, E>>,
    key: &'a Fingerprint,
    token: u64,
}

impl<V, E> Drop for LeaderGuard<'_, V, E> {
    fn drop(&mut self) {
        self.inflight.remove_if(self.key, |_, f| f.token == self.token);
    }
}

impl<V, E> ResponseCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(settings: CacheSettings) -> Self {
        // One LRU for the whole cache so eviction only starts at `capacity`.
        let cap = NonZeroUsize::new(settings.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            settings,
            entries: Mutex::new(LruCache::with_hasher(cap, ahash::RandomState::new())),
            inflight: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Fresh value for `key`, promoting it in LRU order. Expired entries are
    /// dropped on the way.
    fn fresh(&self, key: &Fingerprint) -> Option<V> {
        let mut entries = lock(&self.entries);
        let expired = match entries.get(key) {
            Some(stored) if stored.stored_at.elapsed() < self.settings.ttl => {
                return Some(stored.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Plain lookup. Counts as a hit or a miss.
    pub fn get(&self, key: &Fingerprint) -> Option<V> {
        let found = self.fresh(key);
        let counter = if found.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn insert(&self, key: Fingerprint, value: V) {
        let mut entries = lock(&self.entries);
        let stored = Stored {
            value,
            stored_at: Instant::now(),
        };
        if let Some((evicted, _)) = entries.push(key.clone(), stored) {
            if evicted != key {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(fingerprint = %evicted.short(), "cache entry evicted");
            }
        }
    }

    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        lock(&self.entries).pop(key).is_some()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Drop every expired entry. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.settings.ttl;
        let mut entries = lock(&self.entries);
        let stale: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, s)| s.stored_at.elapsed() >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        let purged = stale.len();
        self.counters
            .expirations
            .fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// Return the cached value for `key`, or run `compute` to produce it.
    ///
    /// Only one `compute` runs per key at a time; other callers wait for its
    /// outcome. A failed compute is returned to every waiter and not stored.
    /// If the leader is cancelled, a waiter takes over as the new leader.
    pub async fn get_or_compute<F, Fut>(&self, key: &Fingerprint, compute: F) -> Result<Lookup<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let (tx, token) = loop {
            if let Some(value) = self.fresh(key) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Lookup {
                    value,
                    source: LookupSource::Hit,
                });
            }

            let mut waiting_on = match self.inflight.entry(key.clone()) {
                Entry::Occupied(e) => e.get().result.clone(),
                Entry::Vacant(slot) => {
                    let token = self.counters.tokens.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    slot.insert(Inflight { token, result: rx });
                    break (tx, token);
                }
            };

            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            trace!(fingerprint = %key.short(), "waiting on in-flight compute");
            let outcome = waiting_on
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|r| r.clone());
            match outcome {
                Some(Ok(value)) => {
                    return Ok(Lookup {
                        value,
                        source: LookupSource::Coalesced,
                    })
                }
                Some(Err(e)) => return Err(e),
                None => debug!(fingerprint = %key.short(), "leader went away, retrying"),
            }
        };

        let guard = LeaderGuard {
            inflight: &self.inflight,
            key,
            token,
        };
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let result = compute().await;
        if let Ok(value) = &result {
            self.insert(key.clone(), value.clone());
        }
        drop(guard);
        tx.send_replace(Some(result.clone()));

        result.map(|value| Lookup {
            value,
            source: LookupSource::Computed,
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let hits = c.hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self.len(),
            capacity: self.settings.capacity,
            hits,
            misses,
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            inflight: self.inflight.len(),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}
