//! Vigil Test Utilities
//!
//! Shared test infrastructure for the Vigil workspace:
//! - [`MockBackend`], a scriptable in-memory telemetry backend
//! - [`Recorder`], a callback that records every delivery
//! - Proptest generators for subjects, windows and records
//! - Fixtures for common scenarios
//! - Assertions on Vigil error kinds

pub use vigil_core::{
    ErrorKind, ListenerEvent, ListenerGuard, ListenerSink, RawValue, Subject, SyncConfig,
    TelemetryBackend, TelemetryRecord, TimeWindow, Timestamp, VigilError, VigilResult,
};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ============================================================================
// MOCK BACKEND
// ============================================================================

/// Listener lifecycle step as seen by the backend, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Opened(String),
    Cancelled(String),
}

/// In-memory telemetry backend for tests.
///
/// Every path can be scripted independently: documents returned by
/// `fetch_once`, failing opens, failing or hanging fetches. Open listeners
/// can be pushed to or broken. Calls are counted per path, and successful
/// opens and cancels are also logged in order.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    listeners: HashMap<String, Vec<(u64, ListenerSink)>>,
    next_listener: u64,
    open_calls: HashMap<String, usize>,
    cancel_calls: HashMap<String, usize>,
    fetch_calls: HashMap<String, usize>,
    documents: HashMap<String, Value>,
    open_failures: HashMap<String, VigilError>,
    fetch_failures: HashMap<String, VigilError>,
    hanging: HashSet<String>,
    fetch_delay: Option<Duration>,
    calls: Vec<BackendCall>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Value returned by `fetch_once(path)`. Unscripted paths return `null`.
    pub fn set_document(&self, path: &str, value: Value) {
        self.state().documents.insert(path.to_string(), value);
    }

    pub fn fail_open(&self, path: &str, error: VigilError) {
        self.state().open_failures.insert(path.to_string(), error);
    }

    pub fn fail_fetch(&self, path: &str, error: VigilError) {
        self.state().fetch_failures.insert(path.to_string(), error);
    }

    /// Remove any scripted fetch failure or hang for `path`.
    pub fn heal_fetch(&self, path: &str) {
        let mut state = self.state();
        state.fetch_failures.remove(path);
        state.hanging.remove(path);
    }

    /// Make `fetch_once(path)` never resolve.
    pub fn hang_fetch(&self, path: &str) {
        self.state().hanging.insert(path.to_string());
    }

    /// Delay every `fetch_once` by `delay` (tokio time, so pausable).
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state().fetch_delay = Some(delay);
    }

    /// Push `value` to every open listener on `path`. Returns how many
    /// listeners accepted it.
    pub fn push(&self, path: &str, value: Value) -> usize {
        let state = self.state();
        state
            .listeners
            .get(path)
            .map(|sinks| {
                sinks
                    .iter()
                    .filter(|(_, sink)| sink.push_value(value.clone()))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Report `error` on every open listener on `path`.
    pub fn break_listener(&self, path: &str, error: VigilError) -> usize {
        let state = self.state();
        state
            .listeners
            .get(path)
            .map(|sinks| {
                sinks
                    .iter()
                    .filter(|(_, sink)| sink.push_error(error.clone()))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop every sink on `path` without an error, as a backend that just
    /// stops talking would.
    pub fn drop_listeners(&self, path: &str) -> usize {
        self.state()
            .listeners
            .remove(path)
            .map(|sinks| sinks.len())
            .unwrap_or(0)
    }

    pub fn open_calls(&self, path: &str) -> usize {
        self.state().open_calls.get(path).copied().unwrap_or(0)
    }

    pub fn total_open_calls(&self) -> usize {
        self.state().open_calls.values().sum()
    }

    pub fn cancel_calls(&self, path: &str) -> usize {
        self.state().cancel_calls.get(path).copied().unwrap_or(0)
    }

    pub fn fetch_calls(&self, path: &str) -> usize {
        self.state().fetch_calls.get(path).copied().unwrap_or(0)
    }

    /// Listeners currently attached to `path`.
    pub fn active_listeners(&self, path: &str) -> usize {
        self.state().listeners.get(path).map(Vec::len).unwrap_or(0)
    }

    pub fn total_active_listeners(&self) -> usize {
        self.state().listeners.values().map(Vec::len).sum()
    }

    /// Successful listener opens and cancels, oldest first.
    pub fn listener_calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }
}

#[async_trait]
impl TelemetryBackend for MockBackend {
    fn open_live_listener(&self, path: &str, sink: ListenerSink) -> VigilResult<ListenerGuard> {
        let mut state = self.state();
        *state.open_calls.entry(path.to_string()).or_default() += 1;
        if let Some(error) = state.open_failures.get(path) {
            return Err(error.clone());
        }

        let id = state.next_listener;
        state.next_listener += 1;
        state
            .listeners
            .entry(path.to_string())
            .or_default()
            .push((id, sink));
        state.calls.push(BackendCall::Opened(path.to_string()));

        let shared = Arc::clone(&self.state);
        let path = path.to_string();
        Ok(ListenerGuard::new(move || {
            let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *state.cancel_calls.entry(path.clone()).or_default() += 1;
            state.calls.push(BackendCall::Cancelled(path.clone()));
            if let Some(sinks) = state.listeners.get_mut(&path) {
                sinks.retain(|(listener, _)| *listener != id);
            }
        }))
    }

    async fn fetch_once(&self, path: &str) -> VigilResult<RawValue> {
        let (delay, hang, outcome) = {
            let mut state = self.state();
            *state.fetch_calls.entry(path.to_string()).or_default() += 1;
            let outcome = match state.fetch_failures.get(path) {
                Some(error) => Err(error.clone()),
                None => Ok(state.documents.get(path).cloned().unwrap_or(Value::Null)),
            };
            (state.fetch_delay, state.hanging.contains(path), outcome)
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

// ============================================================================
// RECORDER
// ============================================================================

/// Collects every value passed to its callback.
#[derive(Debug)]
pub struct Recorder<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback appending to this recorder.
    pub fn callback(&self) -> impl Fn(T) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |event| {
            events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(event);
        }
    }

    pub fn events(&self) -> Vec<T> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<T> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .cloned()
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Vigil types.

    use super::*;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    /// Generate a valid subject string.
    pub fn arb_subject_str() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_-]{1,32}"
    }

    pub fn arb_subject() -> impl Strategy<Value = Subject> {
        arb_subject_str().prop_filter_map("valid subject", |raw| Subject::parse(&raw).ok())
    }

    /// Generate timestamps within a reasonable range (2020-2030), millisecond precision.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_577_836_800_000i64..1_893_456_000_000i64)
            .prop_filter_map("in range", DateTime::<Utc>::from_timestamp_millis)
    }

    pub fn arb_window() -> impl Strategy<Value = TimeWindow> {
        (arb_timestamp(), arb_timestamp()).prop_filter_map("ordered window", |(a, b)| {
            let (start, end) = if a <= b { (a, b) } else { (b, a) };
            TimeWindow::new(start, end).ok()
        })
    }

    /// One raw history child as the backend stores it.
    pub fn arb_history_child() -> impl Strategy<Value = Value> {
        (arb_timestamp(), 0.0f64..1.0, 0.0f64..1.0, 0u32..=100).prop_map(
            |(ts, ear, mouth, score)| {
                json!({
                    "timestamp": ts.to_rfc3339(),
                    "ear": ear,
                    "mouth": mouth,
                    "safety_score": score,
                })
            },
        )
    }

    /// A raw history node with up to `max` children keyed `r0`, `r1`, ...
    pub fn arb_history(max: usize) -> impl Strategy<Value = Value> {
        prop::collection::vec(arb_history_child(), 0..=max).prop_map(|children| {
            let map = children
                .into_iter()
                .enumerate()
                .map(|(idx, child)| (format!("r{idx}"), child))
                .collect::<serde_json::Map<_, _>>();
            Value::Object(map)
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made values for common test scenarios.

    use super::*;
    use serde_json::json;

    /// Config with short windows; every field is valid.
    pub fn test_config() -> SyncConfig {
        SyncConfig::default()
            .with_cache_capacity(32)
            .with_cache_ttl(Duration::from_secs(60))
            .with_max_concurrent_listeners(4)
            .with_throttle_interval(Duration::from_millis(1000))
            .with_default_range_limit(50)
            .with_request_timeout(Duration::from_secs(5))
            .with_monitor_interval(Duration::from_secs(30))
    }

    /// A current-data node as the dashboard device firmware writes it.
    pub fn sensor_reading(timestamp_ms: i64, ear: f64, mouth: f64, safety_score: u32) -> Value {
        json!({
            "timestamp": timestamp_ms,
            "ear": ear,
            "mouth": mouth,
            "safety_score": safety_score,
        })
    }

    /// A history node with one child per `(id, rfc3339 timestamp)` pair.
    pub fn history(entries: &[(&str, &str)]) -> Value {
        let map = entries
            .iter()
            .map(|(id, ts)| (id.to_string(), json!({"timestamp": ts, "ear": 0.3})))
            .collect::<serde_json::Map<_, _>>();
        Value::Object(map)
    }

    pub fn live_path(subject: &str) -> String {
        format!("devices/{subject}/current_data")
    }

    pub fn history_path(subject: &str) -> String {
        format!("devices/{subject}/history")
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on Vigil results.

    use super::*;

    /// Assert that a VigilResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &VigilResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a VigilResult is an error of `kind`.
    #[track_caller]
    pub fn assert_error_kind<T: std::fmt::Debug>(result: &VigilResult<T>, kind: ErrorKind) {
        match result {
            Err(err) => assert_eq!(err.kind(), kind, "Wrong error kind: {err}"),
            Ok(value) => panic!("Expected {kind:?} error, got Ok: {value:?}"),
        }
    }

    /// Assert that records are sorted ascending by timestamp and inside `window`.
    #[track_caller]
    pub fn assert_sorted_within(records: &[TelemetryRecord], window: &TimeWindow) {
        for pair in records.windows(2) {
            assert!(
                pair[0].timestamp <= pair[1].timestamp,
                "Records out of order: {} after {}",
                pair[1].timestamp,
                pair[0].timestamp
            );
        }
        for record in records {
            assert!(
                window.contains(record.timestamp),
                "Record {} at {} outside {}",
                record.id,
                record.timestamp,
                window
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_counts_and_scripts_fetches() {
        let backend = MockBackend::new();
        backend.set_document("p", json!({"a": 1}));
        assert_eq!(backend.fetch_once("p").await.unwrap(), json!({"a": 1}));
        assert_eq!(backend.fetch_once("other").await.unwrap(), Value::Null);

        backend.fail_fetch("p", VigilError::backend_unavailable("p", "down"));
        assert!(backend.fetch_once("p").await.is_err());
        backend.heal_fetch("p");
        assert!(backend.fetch_once("p").await.is_ok());
        assert_eq!(backend.fetch_calls("p"), 3);
    }

    #[tokio::test]
    async fn test_mock_listener_lifecycle() {
        let backend = MockBackend::new();
        let (sink, mut rx) = ListenerSink::channel();
        let guard = backend.open_live_listener("p", sink).unwrap();
        assert_eq!(backend.active_listeners("p"), 1);

        assert_eq!(backend.push("p", json!(1)), 1);
        assert_eq!(rx.recv().await, Some(ListenerEvent::Value(json!(1))));

        guard.cancel();
        assert_eq!(backend.active_listeners("p"), 0);
        assert_eq!(backend.cancel_calls("p"), 1);
        assert_eq!(backend.push("p", json!(2)), 0);
        assert_eq!(
            backend.listener_calls(),
            vec![BackendCall::Opened("p".into()), BackendCall::Cancelled("p".into())]
        );
    }

    #[test]
    fn test_mock_open_failure() {
        let backend = MockBackend::new();
        backend.fail_open("p", VigilError::backend_unavailable("p", "denied"));
        let (sink, _rx) = ListenerSink::channel();
        let err = backend.open_live_listener("p", sink).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(backend.open_calls("p"), 1);
        assert!(backend.listener_calls().is_empty());
    }

    #[test]
    fn test_recorder() {
        let recorder = Recorder::new();
        let callback = recorder.callback();
        callback(1);
        callback(2);
        assert_eq!(recorder.events(), vec![1, 2]);
        assert_eq!(recorder.last(), Some(2));
    }
}
