//! Subscription manager.
//!
//! Turns consumer requests into at most one backend listener per feed. A
//! feed is either one subject's live value or the device listing:
//!
//! 1. A fresh cached value is handed to the new consumer on the next tick.
//! 2. The consumer joins the subject's fan-out list; the first consumer of
//!    a feed opens the listener through the [`ConnectionRegistry`].
//! 3. Backend pushes flow through a pump task and a [`ThrottleGate`], get
//!    cached and are multicast to every consumer of the feed.
//! 4. When the last consumer cancels, the listener is released.
//!
//! A listener error delivers the error to every consumer, evicts the
//! feed's cache entry and releases the slot. Nothing is retried; a new
//! subscription opens a new listener.

use crate::cancel::SubscriptionHandle;
use crate::fanout::{
    deliver_all, Consumer, DeviceListDelivery, FeedCallback, FeedDelivery, FeedTable,
    LiveDelivery, RangeDelivery, Removal,
};
use crate::locks::{lock, lock_or_recover};
use crate::range::RangeQueryService;
use crate::registry::{next_subscription_id, ConnectionRegistry, Subscription};
use crate::throttle::ThrottleGate;
use crate::usage::UsageMonitor;
use crate::SharedCache;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use vigil_cache::{CacheKey, CachedValue, KeyKind};
use vigil_core::{
    subjects_from_listing, ErrorKind, ListenerEvent, ListenerSink, RawValue, Subject,
    TelemetryBackend, TimeWindow, VigilError, VigilResult, DEVICE_LIST_LIMIT, DEVICE_LIST_PATH,
};

/// Live and range subscriptions over one backend.
#[derive(Clone)]
pub struct SubscriptionManager {
    shared: Arc<ManagerShared>,
}

struct ManagerShared {
    backend: Arc<dyn TelemetryBackend>,
    cache: SharedCache,
    range: Arc<RangeQueryService>,
    usage: Arc<UsageMonitor>,
    throttle_interval: Duration,
    state: Mutex<ManagerState>,
    next_consumer: AtomicU64,
}

/// Registry and fan-out lists change together under one lock.
struct ManagerState {
    registry: ConnectionRegistry,
    feeds: FeedTable,
}

impl SubscriptionManager {
    pub fn new(
        backend: Arc<dyn TelemetryBackend>,
        cache: SharedCache,
        range: Arc<RangeQueryService>,
        usage: Arc<UsageMonitor>,
        max_concurrent: usize,
        throttle_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                backend,
                cache,
                range,
                usage,
                throttle_interval,
                state: Mutex::new(ManagerState {
                    registry: ConnectionRegistry::new(max_concurrent),
                    feeds: FeedTable::new(),
                }),
                next_consumer: AtomicU64::new(1),
            }),
        }
    }

    /// Follow the live value of `subject`.
    ///
    /// Fails synchronously with `InvalidSubject`, or `CapacityExceeded` when
    /// the registry admits no listeners at all. A listener that cannot be
    /// opened is reported through `on_data` as `Err(BackendUnavailable)`.
    /// Must be called from inside a tokio runtime.
    pub fn subscribe_live(
        &self,
        subject: &str,
        on_data: impl Fn(LiveDelivery) + Send + Sync + 'static,
    ) -> VigilResult<SubscriptionHandle> {
        let subject = Subject::parse(subject)?;
        let callback: FeedCallback = Arc::new(move |delivery: FeedDelivery| {
            on_data(delivery.map(|value| value.and_then(|value| value.as_live().cloned())));
        });
        self.subscribe_feed(CacheKey::live(&subject), subject.live_path(), callback)
    }

    /// Follow the list of known devices: the last [`DEVICE_LIST_LIMIT`]
    /// children of the listing path in key order.
    ///
    /// Shares the listener budget, throttle and fan-out of live feeds. An
    /// empty listing is delivered as an empty list.
    pub fn subscribe_devices(
        &self,
        on_data: impl Fn(DeviceListDelivery) + Send + Sync + 'static,
    ) -> VigilResult<SubscriptionHandle> {
        let callback: FeedCallback = Arc::new(move |delivery: FeedDelivery| {
            on_data(delivery.map(|value| {
                value
                    .and_then(|value| value.as_device_list().map(|devices| devices.to_vec()))
                    .unwrap_or_default()
            }));
        });
        self.subscribe_feed(CacheKey::device_list(), DEVICE_LIST_PATH.to_string(), callback)
    }

    fn subscribe_feed(
        &self,
        key: CacheKey,
        path: String,
        callback: FeedCallback,
    ) -> VigilResult<SubscriptionHandle> {
        let cached = lock(&self.shared.cache, "cache")?.get(&key);

        let id = self.shared.next_consumer.fetch_add(1, Ordering::Relaxed);
        let consumer = Consumer::new(id, callback);

        let attached = {
            let mut state = lock(&self.shared.state, "subscription state")?;
            let ManagerState { registry, feeds } = &mut *state;
            let acquired = registry.acquire(&key, || open_feed(&self.shared, &key, path));
            for evicted in registry.drain_evicted() {
                let detached = feeds.take(&evicted);
                detached.iter().for_each(Consumer::retire);
                warn!(
                    key = %evicted,
                    consumers = detached.len(),
                    "Live feed evicted, consumers detached"
                );
            }
            acquired.map(|acquired| {
                feeds.add(&key, consumer.clone());
                acquired.opened
            })
        };

        match attached {
            Ok(opened) => {
                debug!(key = %key, consumer = id, opened, cached = cached.is_some(), "Live subscription");
                let weak = Arc::downgrade(&self.shared);
                let handle_key = key.clone();
                let retiring = consumer.clone();
                let handle = SubscriptionHandle::new(move || {
                    retiring.retire();
                    if let Some(shared) = weak.upgrade() {
                        shared.detach(&handle_key, id);
                    }
                });
                if let Some(value) = cached {
                    let watch = handle.clone();
                    tokio::spawn(async move {
                        if !watch.is_cancelled() && !consumer.has_delivery() {
                            consumer.deliver(Ok(Some(value)));
                        }
                    });
                }
                Ok(handle)
            }
            Err(err) if err.kind() == ErrorKind::CapacityExceeded => Err(err),
            Err(err) => {
                lock(&self.shared.cache, "cache")?.remove(&key);
                warn!(key = %key, error = %err, "Could not open live feed");
                let handle = SubscriptionHandle::detached();
                let watch = handle.clone();
                tokio::spawn(async move {
                    if !watch.is_cancelled() {
                        consumer.deliver(Err(err));
                    }
                });
                Ok(handle)
            }
        }
    }

    /// One-shot range delivery for `subject` over `[start, end]` with the
    /// default limit.
    ///
    /// Argument errors are returned synchronously; the result of the fetch,
    /// success or failure, reaches `on_data` exactly once from a spawned
    /// task unless the handle is cancelled first.
    pub fn subscribe_range(
        &self,
        subject: &str,
        start: &str,
        end: &str,
        on_data: impl FnOnce(RangeDelivery) + Send + 'static,
    ) -> VigilResult<SubscriptionHandle> {
        let subject = Subject::parse(subject)?;
        let window = TimeWindow::parse(start, end)?;
        let range = Arc::clone(&self.shared.range);
        let handle = SubscriptionHandle::detached();
        let watch = handle.clone();

        let task = tokio::spawn(async move {
            let result = range.fetch_window(&subject, window, None).await;
            if watch.is_cancelled() {
                return;
            }
            if catch_unwind(AssertUnwindSafe(|| on_data(result))).is_err() {
                error!(subject = %subject, "Range consumer callback panicked");
            }
        });
        let abort = task.abort_handle();
        handle.attach(move || abort.abort());
        Ok(handle)
    }

    /// Open backend listeners.
    pub fn open_subscriptions(&self) -> usize {
        lock_or_recover(&self.shared.state, "subscription state")
            .registry
            .open_count()
    }

    /// Consumers across all live feeds.
    pub fn consumer_count(&self) -> usize {
        lock_or_recover(&self.shared.state, "subscription state")
            .feeds
            .consumer_count()
    }

    /// Release every listener and drop every consumer without notifying
    /// them. Returns `(listeners, consumers)` released.
    pub fn release_all(&self) -> VigilResult<(usize, usize)> {
        let mut state = lock(&self.shared.state, "subscription state")?;
        let listeners = state.registry.release_all();
        let consumers = state.feeds.clear();
        Ok((listeners, consumers))
    }
}

/// Attach a backend listener at `path` and wire its pump and throttle.
/// Runs under the manager's state lock.
fn open_feed(shared: &Arc<ManagerShared>, key: &CacheKey, path: String) -> VigilResult<Subscription> {
    let (sink, rx) = ListenerSink::channel();
    let guard = shared.backend.open_live_listener(&path, sink)?;
    shared.usage.record_listener_opened();

    let feed_id = next_subscription_id();
    let weak = Arc::downgrade(shared);
    let gate_key = key.clone();
    let gate = ThrottleGate::new(shared.throttle_interval, move |value: RawValue| {
        if let Some(shared) = weak.upgrade() {
            shared.publish(&gate_key, feed_id, value);
        }
    });

    let pump = tokio::spawn(pump_feed(
        Arc::downgrade(shared),
        key.clone(),
        feed_id,
        path,
        rx,
        gate.clone(),
    ));

    let usage = Arc::clone(&shared.usage);
    let teardown_key = key.clone();
    Ok(Subscription::with_id(feed_id, key.clone(), move || {
        gate.cancel();
        pump.abort();
        guard.cancel();
        usage.record_listener_closed();
        debug!(key = %teardown_key, "Backend listener detached");
    }))
}

/// Drain one listener's events into its throttle gate until the listener
/// fails, closes or the pump is aborted.
async fn pump_feed(
    shared: Weak<ManagerShared>,
    key: CacheKey,
    feed_id: u64,
    path: String,
    mut rx: mpsc::UnboundedReceiver<ListenerEvent>,
    gate: ThrottleGate<RawValue>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            ListenerEvent::Value(value) => {
                if let Some(shared) = shared.upgrade() {
                    shared.usage.record_read();
                }
                gate.call(value);
            }
            ListenerEvent::Error(err) => {
                if let Some(shared) = shared.upgrade() {
                    shared.fail_feed(&key, feed_id, err);
                }
                return;
            }
        }
    }

    if let Some(shared) = shared.upgrade() {
        shared.fail_feed(
            &key,
            feed_id,
            VigilError::backend_unavailable(path, "listener closed by backend"),
        );
    }
}

impl ManagerShared {
    /// Throttled handler: cache the value and multicast it. Values from a
    /// feed that has since been released or replaced are dropped.
    fn publish(&self, key: &CacheKey, feed_id: u64, value: RawValue) {
        let consumers = {
            let state = lock_or_recover(&self.state, "subscription state");
            if state.registry.get(key).map(Subscription::id) != Some(feed_id) {
                debug!(key = %key, feed_id, "Dropped value from stale feed");
                return;
            }
            state.feeds.snapshot(key)
        };
        if consumers.is_empty() {
            return;
        }

        let cached = (!value.is_null()).then(|| match key.kind() {
            KeyKind::DeviceList => {
                CachedValue::DeviceList(Arc::new(subjects_from_listing(&value, DEVICE_LIST_LIMIT)))
            }
            KeyKind::Live | KeyKind::Range => CachedValue::Live(Arc::new(value)),
        });
        {
            let mut cache = lock_or_recover(&self.cache, "cache");
            match &cached {
                Some(cached) => {
                    cache.set(key.clone(), cached.clone());
                }
                None => {
                    cache.remove(key);
                }
            }
        }

        debug!(key = %key, consumers = consumers.len(), "Live value delivered");
        deliver_all(&consumers, &Ok(cached));
    }

    /// Tear down a broken feed, unless it has already been replaced.
    fn fail_feed(&self, key: &CacheKey, feed_id: u64, err: VigilError) {
        let consumers = {
            let mut state = lock_or_recover(&self.state, "subscription state");
            if state.registry.get(key).map(Subscription::id) != Some(feed_id) {
                return;
            }
            state.registry.release(key);
            state.feeds.take(key)
        };
        lock_or_recover(&self.cache, "cache").remove(key);

        warn!(key = %key, error = %err, consumers = consumers.len(), "Live feed failed");
        deliver_all(&consumers, &Err(err));
    }

    /// Remove one consumer; release the listener when it was the last.
    fn detach(&self, key: &CacheKey, id: u64) {
        let mut state = lock_or_recover(&self.state, "subscription state");
        match state.feeds.remove(key, id) {
            Removal::Emptied => {
                state.registry.release(key);
                info!(key = %key, "Last consumer left, feed released");
            }
            Removal::Remaining(remaining) => {
                debug!(key = %key, consumer = id, remaining, "Consumer detached");
            }
            Removal::Absent => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vigil_cache::EvictingCache;
    use vigil_test_utils::{MockBackend, Recorder};

    const INTERVAL: Duration = Duration::from_millis(1000);

    fn manager(backend: &Arc<MockBackend>, max_concurrent: usize) -> (SubscriptionManager, SharedCache) {
        let cache: SharedCache = Arc::new(Mutex::new(EvictingCache::new(16, Duration::from_secs(300))));
        let usage = Arc::new(UsageMonitor::new());
        let range = Arc::new(RangeQueryService::new(
            backend.clone(),
            cache.clone(),
            usage.clone(),
            50,
            Duration::from_secs(5),
        ));
        let manager = SubscriptionManager::new(backend.clone(), cache.clone(), range, usage, max_concurrent, INTERVAL);
        (manager, cache)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_consumers_share_one_listener() {
        let backend = Arc::new(MockBackend::new());
        let (manager, _) = manager(&backend, 4);
        let first = Recorder::new();
        let second = Recorder::new();

        let h1 = manager.subscribe_live("device_01", first.callback()).unwrap();
        let h2 = manager.subscribe_live("device_01", second.callback()).unwrap();
        assert_eq!(backend.open_calls("devices/device_01/current_data"), 1);
        assert_eq!(manager.consumer_count(), 2);

        settle().await;
        backend.push("devices/device_01/current_data", json!({"ear": 0.3}));
        settle().await;

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);

        h1.cancel();
        assert_eq!(manager.open_subscriptions(), 1);
        h2.cancel();
        h2.cancel();
        assert_eq!(manager.open_subscriptions(), 0);
        assert_eq!(backend.cancel_calls("devices/device_01/current_data"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_subject_is_synchronous() {
        let backend = Arc::new(MockBackend::new());
        let (manager, _) = manager(&backend, 4);
        let err = manager.subscribe_live("a/b", |_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubject);
        assert_eq!(backend.total_open_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_capacity_is_synchronous() {
        let backend = Arc::new(MockBackend::new());
        let (manager, _) = manager(&backend, 0);
        let err = manager.subscribe_live("device_01", |_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    }

    fn feed_id(manager: &SubscriptionManager, key: &CacheKey) -> u64 {
        manager
            .shared
            .state
            .lock()
            .unwrap()
            .registry
            .get(key)
            .map(Subscription::id)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_from_replaced_feed_is_dropped() {
        let backend = Arc::new(MockBackend::new());
        let (manager, cache) = manager(&backend, 4);
        let key = CacheKey::live(&Subject::parse("device_01").unwrap());

        let first = manager.subscribe_live("device_01", |_| {}).unwrap();
        let stale = feed_id(&manager, &key);
        first.cancel();

        let recorder = Recorder::new();
        let _second = manager.subscribe_live("device_01", recorder.callback()).unwrap();
        let current = feed_id(&manager, &key);
        assert_ne!(current, stale);

        manager.shared.publish(&key, stale, json!({"ear": 0.9}));
        assert!(recorder.is_empty());
        assert_eq!(cache.lock().unwrap().len(), 0);

        manager.shared.publish(&key, current, json!({"ear": 0.1}));
        assert_eq!(recorder.len(), 1);
        assert_eq!(cache.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_listing_is_cached_as_subjects() {
        let backend = Arc::new(MockBackend::new());
        let (manager, cache) = manager(&backend, 4);
        let recorder = Recorder::new();
        let _handle = manager.subscribe_devices(recorder.callback()).unwrap();
        settle().await;

        backend.push(DEVICE_LIST_PATH, json!({"device_02": {}, "device_01": {}}));
        settle().await;

        let listed = cache
            .lock()
            .unwrap()
            .get(&CacheKey::device_list())
            .and_then(|value| value.as_device_list().cloned())
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(recorder.events(), vec![Ok(listed.to_vec())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_push_clears_cache_and_delivers_none() {
        let backend = Arc::new(MockBackend::new());
        let (manager, cache) = manager(&backend, 4);
        let recorder = Recorder::new();
        let _handle = manager.subscribe_live("device_01", recorder.callback()).unwrap();
        settle().await;

        backend.push("devices/device_01/current_data", json!({"ear": 0.3}));
        settle().await;
        assert_eq!(cache.lock().unwrap().len(), 1);

        tokio::time::sleep(INTERVAL).await;
        backend.push("devices/device_01/current_data", json!(null));
        settle().await;

        assert_eq!(cache.lock().unwrap().len(), 0);
        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], Ok(None));
    }
}
