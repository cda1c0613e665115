//! Cache entry bookkeeping.

use std::time::Duration;
use tokio::time::Instant;

/// A stored value plus the metadata eviction decisions are made from.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    /// When the value was last written.
    pub stored_at: Instant,
    /// Starts at 1 on write, +1 on every read hit.
    pub access_count: u64,
    /// Write sequence number, breaks ties between entries stored at the same instant.
    pub(crate) seq: u64,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(value: V, stored_at: Instant, seq: u64) -> Self {
        Self {
            value,
            stored_at,
            access_count: 1,
            seq,
        }
    }

    /// Fresh while younger than `ttl`.
    pub fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) < ttl
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }

    /// Ordering key for capacity eviction: least accessed first, then oldest
    /// write, then earliest write sequence.
    pub(crate) fn eviction_rank(&self) -> (u64, Instant, u64) {
        (self.access_count, self.stored_at, self.seq)
    }
}
