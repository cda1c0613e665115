//! Vigil Core - Shared Types
//!
//! Data types, error enums, configuration and the backend collaborator
//! contract shared by every Vigil crate. Nothing in here owns a runtime
//! resource; the caching and subscription machinery lives in
//! `vigil-cache` and `vigil-sync`.

use chrono::{DateTime, Utc};

pub mod backend;
pub mod config;
pub mod error;
pub mod record;
pub mod subject;
pub mod window;

pub use backend::{ListenerEvent, ListenerGuard, ListenerSink, TelemetryBackend};
pub use config::{SyncConfig, UsageThresholds};
pub use error::{ConfigError, ErrorKind, SyncError, VigilError, VigilResult};
pub use record::{records_from_history, TelemetryRecord};
pub use subject::{subjects_from_listing, Subject, DEVICE_LIST_LIMIT, DEVICE_LIST_PATH};
pub use window::TimeWindow;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Raw JSON node as delivered by the telemetry backend.
pub type RawValue = serde_json::Value;
