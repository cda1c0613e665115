//! TTL + capacity bounded cache.
//!
//! Expiry is lazy: an entry past its TTL is dropped the next time it is read
//! (or by an explicit [`EvictingCache::purge_expired`] sweep). Capacity is
//! enforced on write by evicting the least accessed entry, oldest write
//! first on ties.
//!
//! The cache itself is not synchronised; owners wrap it in a mutex so that
//! every check-then-write runs under one lock acquisition.

use crate::entry::CacheEntry;
use crate::stats::CacheStats;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Bounded key/value cache with least-used eviction.
#[derive(Debug)]
pub struct EvictingCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    capacity: usize,
    ttl: Duration,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<K, V> EvictingCache<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    /// Create an empty cache holding at most `capacity` entries, each fresh
    /// for `ttl`.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(1024)),
            capacity,
            ttl,
            next_seq: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up `key`.
    ///
    /// A fresh entry counts as a hit and has its access count bumped. A
    /// missing entry is a miss; an expired one is removed and counted as a
    /// miss.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(entry) if entry.is_fresh(now, self.ttl) => {
                entry.access_count += 1;
                self.hits += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                self.entries.remove(key);
                self.expirations += 1;
                self.misses += 1;
                debug!(key = %key, "Cache entry expired on read");
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert or overwrite `key`, resetting its access count to 1.
    ///
    /// Writing a new key into a full cache evicts first. Returns the evicted
    /// keys, if any. With a capacity of zero nothing is stored.
    pub fn set(&mut self, key: K, value: V) -> Vec<K> {
        let now = Instant::now();
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(entry) = self.entries.get_mut(&key) {
            *entry = CacheEntry::new(value, now, seq);
            return Vec::new();
        }

        if self.capacity == 0 {
            return Vec::new();
        }

        let mut evicted = Vec::new();
        while self.entries.len() >= self.capacity {
            match self.eviction_victim() {
                Some(victim) => {
                    self.entries.remove(&victim);
                    self.evictions += 1;
                    debug!(key = %victim, "Cache entry evicted at capacity");
                    evicted.push(victim);
                }
                None => break,
            }
        }

        self.entries.insert(key, CacheEntry::new(value, now, seq));
        evicted
    }

    fn eviction_victim(&self) -> Option<K> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.eviction_rank())
            .map(|(key, _)| key.clone())
    }

    /// Remove one entry. Statistics are untouched.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Remove every entry whose key matches `predicate`. Returns how many
    /// entries were removed.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !predicate(key));
        before - self.entries.len()
    }

    /// Drop every entry whose TTL has passed. Returns how many were dropped.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now, ttl));
        let purged = before - self.entries.len();
        self.expirations += purged as u64;
        purged
    }

    /// Drop every entry unconditionally. Lifetime counters are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries currently held, expired ones not yet collected included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inspect an entry without touching its access count or the counters.
    pub fn peek(&self, key: &K) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entry_count: self.entries.len() as u64,
            evictions: self.evictions,
            expirations: self.expirations,
        }
    }
}
