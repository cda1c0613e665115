//! Connection registry.
//!
//! Holds at most one open backend subscription per key and at most
//! `max_concurrent` overall. When full, the oldest registration is cancelled
//! to make room (FIFO by acquisition order, not by use).
//!
//! The registry is a plain struct; its owner serialises access so that the
//! check, eviction and insert of one `acquire` happen atomically.

use crate::cancel::SubscriptionHandle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use vigil_cache::CacheKey;
use vigil_core::{SyncError, VigilResult};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_subscription_id() -> u64 {
    NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// An open backend subscription. Clones share the same cancel state.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    key: CacheKey,
    handle: SubscriptionHandle,
}

impl Subscription {
    /// Wrap the teardown of an open backend subscription.
    pub fn new(key: CacheKey, on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self::with_id(next_subscription_id(), key, on_cancel)
    }

    /// Like [`Subscription::new`] with an id reserved via
    /// [`next_subscription_id`], for callers that need the id before the
    /// teardown closure exists.
    pub(crate) fn with_id(id: u64, key: CacheKey, on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            key,
            handle: SubscriptionHandle::new(on_cancel),
        }
    }

    /// Process-unique id, distinguishes successive subscriptions on one key.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}

/// Outcome of a successful [`ConnectionRegistry::acquire`].
#[derive(Debug, Clone)]
pub struct Acquired {
    pub subscription: Subscription,
    /// False when an existing subscription was returned.
    pub opened: bool,
}

struct Slot {
    subscription: Subscription,
    acquired_seq: u64,
}

/// Bounded table of open subscriptions keyed by [`CacheKey`].
pub struct ConnectionRegistry {
    max_concurrent: usize,
    slots: HashMap<CacheKey, Slot>,
    next_seq: u64,
    evicted: Vec<CacheKey>,
}

impl ConnectionRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            slots: HashMap::new(),
            next_seq: 0,
            evicted: Vec::new(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Return the subscription for `key`, opening one with `open` if absent.
    ///
    /// When the registry is full the oldest registration is cancelled and
    /// removed before `open` runs; its key is queued for
    /// [`ConnectionRegistry::drain_evicted`]. If `open` fails, the error is
    /// returned and nothing is registered. With `max_concurrent == 0` every
    /// new key fails with `CapacityExceeded`.
    pub fn acquire(
        &mut self,
        key: &CacheKey,
        open: impl FnOnce() -> VigilResult<Subscription>,
    ) -> VigilResult<Acquired> {
        if let Some(slot) = self.slots.get(key) {
            debug!(key = %key, "Reusing open subscription");
            return Ok(Acquired {
                subscription: slot.subscription.clone(),
                opened: false,
            });
        }

        if self.max_concurrent == 0 {
            return Err(SyncError::CapacityExceeded { max_concurrent: 0 }.into());
        }

        while self.slots.len() >= self.max_concurrent {
            let Some(oldest) = self.oldest_key() else { break };
            if let Some(slot) = self.slots.remove(&oldest) {
                warn!(
                    evicted = %oldest,
                    requested = %key,
                    max_concurrent = self.max_concurrent,
                    "Listener limit reached, evicting oldest subscription"
                );
                slot.subscription.cancel();
                self.evicted.push(oldest);
            }
        }

        let subscription = open()?;
        let acquired_seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(
            key.clone(),
            Slot {
                subscription: subscription.clone(),
                acquired_seq,
            },
        );
        info!(key = %key, open = self.slots.len(), "Subscription opened");

        Ok(Acquired {
            subscription,
            opened: true,
        })
    }

    fn oldest_key(&self) -> Option<CacheKey> {
        self.slots
            .iter()
            .min_by_key(|(_, slot)| slot.acquired_seq)
            .map(|(key, _)| key.clone())
    }

    /// Cancel and forget the subscription for `key`. Returns false if there
    /// was none.
    pub fn release(&mut self, key: &CacheKey) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                slot.subscription.cancel();
                info!(key = %key, open = self.slots.len(), "Subscription released");
                true
            }
            None => false,
        }
    }

    /// Release every subscription. Returns how many were open.
    pub fn release_all(&mut self) -> usize {
        let count = self.slots.len();
        for (_, slot) in self.slots.drain() {
            slot.subscription.cancel();
        }
        self.evicted.clear();
        count
    }

    /// Keys evicted for capacity since the last drain.
    pub fn drain_evicted(&mut self) -> Vec<CacheKey> {
        std::mem::take(&mut self.evicted)
    }

    pub fn get(&self, key: &CacheKey) -> Option<&Subscription> {
        self.slots.get(key).map(|slot| &slot.subscription)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.slots.contains_key(key)
    }

    pub fn open_count(&self) -> usize {
        self.slots.len()
    }
}
