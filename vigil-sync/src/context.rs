//! The sync context.
//!
//! One [`SyncContext`] owns everything the sync layer shares: the cache, the
//! subscription manager with its registry, the range query service with its
//! in-flight table, and the usage counters. Build it once at start-up and
//! pass it around as `Arc<SyncContext>`.

use crate::cancel::SubscriptionHandle;
use crate::fanout::{DeviceListDelivery, LiveDelivery, RangeDelivery};
use crate::locks::lock;
use crate::manager::SubscriptionManager;
use crate::range::RangeQueryService;
use crate::usage::{UsageMonitor, UsageSnapshot};
use crate::SharedCache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use vigil_cache::{CacheStats, EvictingCache};
use vigil_core::{RawValue, Subject, SyncConfig, TelemetryBackend, TelemetryRecord, VigilResult};

/// Point-in-time view of the sync layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStats {
    /// Entries currently cached.
    pub cache_size: usize,
    /// Lifetime cache hit rate, 0.0 when nothing was looked up yet.
    pub hit_rate: f64,
    /// Open backend listeners.
    pub open_subscriptions: usize,
    /// Live consumers across all listeners.
    pub consumers: usize,
    /// Range fetches currently running.
    pub in_flight: usize,
    pub cache: CacheStats,
    pub usage: UsageSnapshot,
}

/// Shared state of the sync layer.
pub struct SyncContext {
    config: SyncConfig,
    cache: SharedCache,
    usage: Arc<UsageMonitor>,
    range: Arc<RangeQueryService>,
    manager: SubscriptionManager,
}

impl SyncContext {
    /// Build a context over `backend`. The configuration is validated first.
    pub fn new(backend: Arc<dyn TelemetryBackend>, config: SyncConfig) -> VigilResult<Self> {
        config.validate()?;
        if config.max_concurrent_listeners == 0 {
            warn!("max_concurrent_listeners is 0, every live subscription will be refused");
        }

        let cache: SharedCache = Arc::new(Mutex::new(EvictingCache::new(
            config.cache_capacity,
            config.cache_ttl,
        )));
        let usage = Arc::new(UsageMonitor::new());
        let range = Arc::new(RangeQueryService::new(
            Arc::clone(&backend),
            Arc::clone(&cache),
            Arc::clone(&usage),
            config.default_range_limit,
            config.request_timeout,
        ));
        let manager = SubscriptionManager::new(
            backend,
            Arc::clone(&cache),
            Arc::clone(&range),
            Arc::clone(&usage),
            config.max_concurrent_listeners,
            config.throttle_interval,
        );

        info!(
            cache_capacity = config.cache_capacity,
            cache_ttl_secs = config.cache_ttl.as_secs(),
            max_listeners = config.max_concurrent_listeners,
            throttle_ms = config.throttle_interval.as_millis() as u64,
            "Sync context initialized"
        );

        Ok(Self {
            config,
            cache,
            usage,
            range,
            manager,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn manager(&self) -> &SubscriptionManager {
        &self.manager
    }

    pub fn range_queries(&self) -> &RangeQueryService {
        &self.range
    }

    pub fn usage(&self) -> &UsageMonitor {
        &self.usage
    }

    /// See [`SubscriptionManager::subscribe_live`].
    pub fn subscribe_live(
        &self,
        subject: &str,
        on_data: impl Fn(LiveDelivery) + Send + Sync + 'static,
    ) -> VigilResult<SubscriptionHandle> {
        self.manager.subscribe_live(subject, on_data)
    }

    /// See [`SubscriptionManager::subscribe_devices`].
    pub fn subscribe_devices(
        &self,
        on_data: impl Fn(DeviceListDelivery) + Send + Sync + 'static,
    ) -> VigilResult<SubscriptionHandle> {
        self.manager.subscribe_devices(on_data)
    }

    /// See [`SubscriptionManager::subscribe_range`].
    pub fn subscribe_range(
        &self,
        subject: &str,
        start: &str,
        end: &str,
        on_data: impl FnOnce(RangeDelivery) + Send + 'static,
    ) -> VigilResult<SubscriptionHandle> {
        self.manager.subscribe_range(subject, start, end, on_data)
    }

    /// See [`RangeQueryService::fetch_range`].
    pub async fn fetch_range(
        &self,
        subject: &str,
        start: &str,
        end: &str,
        limit: Option<usize>,
    ) -> VigilResult<Vec<TelemetryRecord>> {
        self.range.fetch_range(subject, start, end, limit).await
    }

    /// See [`RangeQueryService::fetch_current_batch`].
    pub async fn fetch_current_batch(
        &self,
        subjects: &[&str],
    ) -> HashMap<String, VigilResult<Option<Arc<RawValue>>>> {
        self.range.fetch_current_batch(subjects).await
    }

    pub fn stats(&self) -> VigilResult<SyncStats> {
        let cache = lock(&self.cache, "cache")?.stats();
        Ok(SyncStats {
            cache_size: cache.entry_count as usize,
            hit_rate: cache.hit_rate(),
            open_subscriptions: self.manager.open_subscriptions(),
            consumers: self.manager.consumer_count(),
            in_flight: self.range.in_flight_count(),
            cache,
            usage: self.usage.snapshot(),
        })
    }

    /// Drop cached entries of `subject`, or every entry (the device listing
    /// included) when `None`.
    /// Open listeners are left alone. Returns how many entries were dropped.
    pub fn invalidate(&self, subject: Option<&str>) -> VigilResult<usize> {
        let subject = subject.map(Subject::parse).transpose()?;
        let mut cache = lock(&self.cache, "cache")?;
        let dropped = match &subject {
            Some(subject) => cache.remove_where(|key| key.subject() == Some(subject)),
            None => {
                let count = cache.len();
                cache.clear();
                count
            }
        };
        info!(
            subject = subject.as_ref().map(Subject::as_str).unwrap_or("*"),
            dropped,
            "Cache invalidated"
        );
        Ok(dropped)
    }

    /// Sweep expired cache entries. Never called from the read/write path.
    pub fn purge_expired(&self) -> VigilResult<usize> {
        Ok(lock(&self.cache, "cache")?.purge_expired())
    }

    /// Release every listener, drop every consumer, abort running range
    /// fetches and clear the cache. Safe to call repeatedly; the context
    /// stays usable afterwards.
    pub fn cleanup_all(&self) -> VigilResult<()> {
        let (listeners, consumers) = self.manager.release_all()?;
        let aborted = self.range.abort_all();
        lock(&self.cache, "cache")?.clear();
        info!(listeners, consumers, aborted, "Sync context cleaned up");
        Ok(())
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("config", &self.config)
            .field("open_subscriptions", &self.manager.open_subscriptions())
            .finish_non_exhaustive()
    }
}
