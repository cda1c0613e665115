//! Vigil cache layer.
//!
//! An in-memory cache shared by live subscriptions and range queries.
//! Entries expire lazily after a TTL and, once the cache is full, the least
//! used entry is evicted on write.
//!
//! # Keys
//!
//! [`CacheKey`] can only be built through [`CacheKey::live`],
//! [`CacheKey::range`] and [`CacheKey::device_list`], so logically identical
//! requests always map to the same key and the subject of every per-device
//! entry is recoverable for invalidation.

pub mod entry;
pub mod evicting;
pub mod key;
pub mod stats;

pub use entry::CacheEntry;
pub use evicting::EvictingCache;
pub use key::{CacheKey, KeyKind};
pub use stats::CacheStats;

use std::sync::Arc;
use vigil_core::{RawValue, Subject, TelemetryRecord};

/// Value stored in the shared sync cache.
///
/// Payloads sit behind `Arc` so a cache hit is a pointer copy; callers that
/// hand data to consumers clone out of the `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    /// Latest value of a live feed.
    Live(Arc<RawValue>),
    /// Filtered, sorted result of a range query.
    Range(Arc<Vec<TelemetryRecord>>),
    /// Latest device listing.
    DeviceList(Arc<Vec<Subject>>),
}

impl CachedValue {
    pub fn as_live(&self) -> Option<&Arc<RawValue>> {
        match self {
            CachedValue::Live(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_range(&self) -> Option<&Arc<Vec<TelemetryRecord>>> {
        match self {
            CachedValue::Range(records) => Some(records),
            _ => None,
        }
    }

    pub fn as_device_list(&self) -> Option<&Arc<Vec<Subject>>> {
        match self {
            CachedValue::DeviceList(devices) => Some(devices),
            _ => None,
        }
    }
}
