//! Per-key multicast of live deliveries.
//!
//! One backend subscription serves every consumer of a key. [`FeedTable`]
//! is the single place that knows which consumers hang off which key.
//!
//! Consumers see the feed as [`CachedValue`]s; each subscribe call wraps the
//! caller's callback in an adapter that turns them into its public delivery
//! type.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};
use vigil_cache::{CacheKey, CachedValue};
use vigil_core::{RawValue, Subject, TelemetryRecord, VigilResult};

/// What a live consumer receives: data, "no data at path" (`Ok(None)`), or
/// the error that tore the feed down.
pub type LiveDelivery = VigilResult<Option<Arc<RawValue>>>;

/// What a range consumer receives, exactly once.
pub type RangeDelivery = VigilResult<Vec<TelemetryRecord>>;

/// What a device listing consumer receives: the listed subjects (empty when
/// nothing is listed) or the error that tore the feed down.
pub type DeviceListDelivery = VigilResult<Vec<Subject>>;

/// A feed's value as fanned out: `Ok(None)` means no data at the path.
pub(crate) type FeedDelivery = VigilResult<Option<CachedValue>>;

pub(crate) type FeedCallback = Arc<dyn Fn(FeedDelivery) + Send + Sync>;

/// Identifies one consumer within the process.
pub type ConsumerId = u64;

/// One registered live consumer.
///
/// Clones share their flags, so retiring any clone silences every snapshot
/// already taken of it.
#[derive(Clone)]
pub struct Consumer {
    id: ConsumerId,
    callback: FeedCallback,
    /// Set once any live delivery has reached this consumer.
    delivered: Arc<AtomicBool>,
    /// Set when the consumer's handle is cancelled or it is dropped from
    /// its feed.
    retired: Arc<AtomicBool>,
}

impl Consumer {
    pub(crate) fn new(id: ConsumerId, callback: FeedCallback) -> Self {
        Self {
            id,
            callback,
            delivered: Arc::new(AtomicBool::new(false)),
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn has_delivery(&self) -> bool {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Stop all further deliveries. A delivery already running completes.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Invoke the callback unless retired. A panic is logged and swallowed.
    pub(crate) fn deliver(&self, delivery: FeedDelivery) {
        if self.is_retired() {
            return;
        }
        self.delivered.store(true, Ordering::SeqCst);
        if catch_unwind(AssertUnwindSafe(|| (self.callback)(delivery))).is_err() {
            error!(consumer = self.id, "Live consumer callback panicked");
        }
    }
}

/// Result of removing a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// No such consumer under that key.
    Absent,
    /// Removed; other consumers remain.
    Remaining(usize),
    /// Removed the last consumer; the key's entry is gone.
    Emptied,
}

/// Consumers per key, in registration order.
#[derive(Default)]
pub struct FeedTable {
    feeds: HashMap<CacheKey, BTreeMap<ConsumerId, Consumer>>,
}

impl FeedTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, key: &CacheKey, consumer: Consumer) -> usize {
        let consumers = self.feeds.entry(key.clone()).or_default();
        consumers.insert(consumer.id, consumer);
        debug!(key = %key, consumers = consumers.len(), "Consumer attached");
        consumers.len()
    }

    pub fn remove(&mut self, key: &CacheKey, id: ConsumerId) -> Removal {
        let Some(consumers) = self.feeds.get_mut(key) else {
            return Removal::Absent;
        };
        if consumers.remove(&id).is_none() {
            return Removal::Absent;
        }
        if consumers.is_empty() {
            self.feeds.remove(key);
            Removal::Emptied
        } else {
            Removal::Remaining(consumers.len())
        }
    }

    /// Remove the key's consumer list and hand it back.
    pub fn take(&mut self, key: &CacheKey) -> Vec<Consumer> {
        self.feeds
            .remove(key)
            .map(|consumers| consumers.into_values().collect())
            .unwrap_or_default()
    }

    /// Clone out the current consumers of `key` for delivery outside the lock.
    pub fn snapshot(&self, key: &CacheKey) -> Vec<Consumer> {
        self.feeds
            .get(key)
            .map(|consumers| consumers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.feeds.contains_key(key)
    }

    pub fn consumer_count(&self) -> usize {
        self.feeds.values().map(BTreeMap::len).sum()
    }

    /// Retire and drop every consumer. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.consumer_count();
        for consumer in self.feeds.drain().flat_map(|(_, consumers)| consumers.into_values()) {
            consumer.retire();
        }
        count
    }
}

/// Deliver one value to each consumer in order.
pub(crate) fn deliver_all(consumers: &[Consumer], delivery: &FeedDelivery) {
    for consumer in consumers {
        consumer.deliver(delivery.clone());
    }
}
