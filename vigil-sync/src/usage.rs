//! Backend usage accounting.
//!
//! Counts what the sync layer costs the backend so the monitor task can warn
//! when a dashboard starts reading far more than it should.

use crate::locks::lock_or_recover;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;
use vigil_core::UsageThresholds;

// ============================================================================
// METRICS
// ============================================================================

/// Counters for backend usage.
///
/// Read and request counters are windowed: [`UsageMonitor::reset`] zeroes
/// them and restarts the window. Listener counters are lifetime totals.
#[derive(Debug)]
pub struct UsageMonitor {
    /// Backend reads: one-shot fetches plus pushes received.
    pub reads: AtomicU64,
    pub listeners_opened: AtomicU64,
    pub listeners_closed: AtomicU64,
    /// Range requests served by joining an in-flight fetch.
    pub collapsed_requests: AtomicU64,
    pub timeouts: AtomicU64,
    window_start: Mutex<Instant>,
}

impl Default for UsageMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageMonitor {
    pub fn new() -> Self {
        Self {
            reads: AtomicU64::new(0),
            listeners_opened: AtomicU64::new(0),
            listeners_closed: AtomicU64::new(0),
            collapsed_requests: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
        }
    }

    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_opened(&self) {
        self.listeners_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_closed(&self) {
        self.listeners_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collapsed(&self) {
        self.collapsed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> UsageSnapshot {
        let elapsed = lock_or_recover(&self.window_start, "usage window").elapsed();
        let opened = self.listeners_opened.load(Ordering::Relaxed);
        let closed = self.listeners_closed.load(Ordering::Relaxed);
        UsageSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            listeners_opened: opened,
            listeners_closed: closed,
            active_listeners: opened.saturating_sub(closed),
            collapsed_requests: self.collapsed_requests.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            window: elapsed,
        }
    }

    /// Compare a fresh snapshot against `thresholds`, logging each breach.
    pub fn check_thresholds(&self, thresholds: &UsageThresholds) -> Vec<UsageWarning> {
        let snapshot = self.snapshot();
        let mut warnings = Vec::new();

        if snapshot.reads > thresholds.reads {
            warnings.push(UsageWarning::Reads {
                count: snapshot.reads,
                limit: thresholds.reads,
            });
        }
        if snapshot.active_listeners > thresholds.listeners {
            warnings.push(UsageWarning::Listeners {
                count: snapshot.active_listeners,
                limit: thresholds.listeners,
            });
        }
        let rate = snapshot.reads_per_minute();
        if rate > thresholds.reads_per_minute as f64 {
            warnings.push(UsageWarning::ReadsPerMinute {
                rate,
                limit: thresholds.reads_per_minute,
            });
        }

        for warning in &warnings {
            warn!(warning = %warning, "Backend usage threshold exceeded");
        }
        warnings
    }

    /// Zero the windowed counters and restart the window.
    pub fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.collapsed_requests.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        *lock_or_recover(&self.window_start, "usage window") = Instant::now();
    }
}

/// Snapshot of usage counters at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSnapshot {
    pub reads: u64,
    pub listeners_opened: u64,
    pub listeners_closed: u64,
    pub active_listeners: u64,
    pub collapsed_requests: u64,
    pub timeouts: u64,
    /// Time since the window started.
    pub window: Duration,
}

impl UsageSnapshot {
    /// Average reads per minute over the window (window floored at one second).
    pub fn reads_per_minute(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1.0);
        self.reads as f64 * 60.0 / secs
    }
}

/// A breached usage threshold.
#[derive(Debug, Clone, PartialEq)]
pub enum UsageWarning {
    Reads { count: u64, limit: u64 },
    Listeners { count: u64, limit: u64 },
    ReadsPerMinute { rate: f64, limit: u64 },
}

impl fmt::Display for UsageWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageWarning::Reads { count, limit } => {
                write!(f, "{count} backend reads (limit {limit})")
            }
            UsageWarning::Listeners { count, limit } => {
                write!(f, "{count} active listeners (limit {limit})")
            }
            UsageWarning::ReadsPerMinute { rate, limit } => {
                write!(f, "{rate:.1} reads/min (limit {limit})")
            }
        }
    }
}
