//! Vigil Sync - Real-time telemetry sync layer
//!
//! Sits between dashboard views and a push-capable telemetry backend:
//!
//! - live subscriptions multicast per subject, throttled, behind a bounded
//!   [`ConnectionRegistry`], plus the same for the device listing
//! - one-shot range queries with request collapsing and a lifetime bound
//! - one shared [`vigil_cache::EvictingCache`] for both
//!
//! Everything hangs off an explicit [`SyncContext`]; there are no globals.
//!
//! ## Runtime
//!
//! All of it runs on tokio. Consumer callbacks are always invoked from a
//! spawned task, never from inside a `subscribe_*` call and never while an
//! internal lock is held.

pub mod cancel;
pub mod context;
pub mod fanout;
mod locks;
pub mod manager;
pub mod monitor;
pub mod range;
pub mod registry;
pub mod telemetry;
pub mod throttle;
pub mod usage;

pub use cancel::SubscriptionHandle;
pub use context::{SyncContext, SyncStats};
pub use fanout::{ConsumerId, DeviceListDelivery, FeedTable, LiveDelivery, RangeDelivery};
pub use manager::SubscriptionManager;
pub use monitor::{monitor_task, spawn_monitor};
pub use range::RangeQueryService;
pub use registry::{Acquired, ConnectionRegistry, Subscription};
pub use telemetry::{init_tracing, LogFormat, LoggingConfig, TelemetryError};
pub use throttle::ThrottleGate;
pub use usage::{UsageMonitor, UsageSnapshot, UsageWarning};

use std::sync::{Arc, Mutex};
use vigil_cache::{CacheKey, CachedValue, EvictingCache};

/// The cache shared by live feeds and range queries.
pub type SharedCache = Arc<Mutex<EvictingCache<CacheKey, CachedValue>>>;
