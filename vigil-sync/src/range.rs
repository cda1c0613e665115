//! One-shot range queries with request collapsing.
//!
//! A range request is answered from the shared cache when fresh. Otherwise
//! it joins the in-flight fetch for the same key, or starts one. Each fetch
//! runs on its own task bounded by `request_timeout`; when it settles the
//! task writes the cache (success only) and clears its in-flight entry, so
//! a failed or timed-out request is never cached and the next call starts
//! over.
//!
//! Callers always receive their own copy of the records.

use crate::locks::{lock, lock_or_recover};
use crate::usage::UsageMonitor;
use crate::SharedCache;
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use vigil_cache::{CacheKey, CachedValue};
use vigil_core::{
    records_from_history, RawValue, Subject, SyncError, TelemetryBackend, TelemetryRecord,
    TimeWindow, VigilError, VigilResult,
};

type FetchOutput = VigilResult<Arc<Vec<TelemetryRecord>>>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutput>>;
type InFlightMap = Arc<Mutex<HashMap<CacheKey, InFlight>>>;

struct InFlight {
    id: u64,
    future: SharedFetch,
    abort: AbortHandle,
}

/// Range query service over the shared cache.
pub struct RangeQueryService {
    backend: Arc<dyn TelemetryBackend>,
    cache: SharedCache,
    in_flight: InFlightMap,
    usage: Arc<UsageMonitor>,
    default_limit: usize,
    request_timeout: Duration,
    next_fetch_id: AtomicU64,
}

impl RangeQueryService {
    pub fn new(
        backend: Arc<dyn TelemetryBackend>,
        cache: SharedCache,
        usage: Arc<UsageMonitor>,
        default_limit: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            cache,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            usage,
            default_limit,
            request_timeout,
            next_fetch_id: AtomicU64::new(0),
        }
    }

    /// Records of `subject` timestamped within `[start, end]`, ascending.
    ///
    /// `start`/`end` are RFC 3339 timestamps or `YYYY-MM-DD` dates. At most
    /// `limit` records are returned (the default limit when `None`), keeping
    /// the most recent ones.
    pub async fn fetch_range(
        &self,
        subject: &str,
        start: &str,
        end: &str,
        limit: Option<usize>,
    ) -> VigilResult<Vec<TelemetryRecord>> {
        let subject = Subject::parse(subject)?;
        let window = TimeWindow::parse(start, end)?;
        self.fetch_window(&subject, window, limit).await
    }

    /// [`RangeQueryService::fetch_range`] with pre-validated arguments.
    pub async fn fetch_window(
        &self,
        subject: &Subject,
        window: TimeWindow,
        limit: Option<usize>,
    ) -> VigilResult<Vec<TelemetryRecord>> {
        let limit = self.effective_limit(window, limit)?;
        let key = CacheKey::range(subject, window, limit);

        let cached = lock(&self.cache, "cache")?.get(&key);
        if let Some(records) = cached.as_ref().and_then(CachedValue::as_range) {
            debug!(key = %key, "Range served from cache");
            return Ok(records.as_ref().clone());
        }

        let fetch = {
            let mut in_flight = lock(&self.in_flight, "in-flight requests")?;
            match in_flight.get(&key) {
                Some(existing) => {
                    self.usage.record_collapsed();
                    debug!(key = %key, "Joining in-flight range request");
                    existing.future.clone()
                }
                None => {
                    let entry = self.spawn_fetch(key.clone(), subject.history_path(), window, limit);
                    let future = entry.future.clone();
                    in_flight.insert(key, entry);
                    future
                }
            }
        };

        let records = fetch.await?;
        Ok(records.as_ref().clone())
    }

    fn effective_limit(&self, window: TimeWindow, limit: Option<usize>) -> VigilResult<usize> {
        match limit {
            Some(0) => {
                let (start, end) = window.canonical();
                Err(SyncError::InvalidRange {
                    start,
                    end,
                    reason: "limit must be greater than 0".to_string(),
                }
                .into())
            }
            Some(limit) => Ok(limit),
            None => Ok(self.default_limit),
        }
    }

    fn spawn_fetch(
        &self,
        key: CacheKey,
        path: String,
        window: TimeWindow,
        limit: usize,
    ) -> InFlight {
        let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let backend = Arc::clone(&self.backend);
        let cache = Arc::clone(&self.cache);
        let in_flight = Arc::clone(&self.in_flight);
        let usage = Arc::clone(&self.usage);
        let lifetime = self.request_timeout;
        let task_path = path.clone();

        let task = tokio::spawn(async move {
            let outcome = tokio::time::timeout(lifetime, backend.fetch_once(&task_path)).await;
            usage.record_read();

            let result: FetchOutput = match outcome {
                Ok(Ok(raw)) => records_from_history(&task_path, &raw)
                    .map(|records| Arc::new(select_window(records, window, limit))),
                Ok(Err(err)) => Err(err),
                Err(_) => {
                    usage.record_timeout();
                    Err(SyncError::Timeout {
                        key: key.to_string(),
                        after: lifetime,
                    }
                    .into())
                }
            };

            match &result {
                Ok(records) => {
                    lock_or_recover(&cache, "cache")
                        .set(key.clone(), CachedValue::Range(Arc::clone(records)));
                    debug!(key = %key, records = records.len(), "Range fetched");
                }
                Err(err) => warn!(key = %key, error = %err, "Range fetch failed"),
            }

            let mut in_flight = lock_or_recover(&in_flight, "in-flight requests");
            if in_flight.get(&key).is_some_and(|entry| entry.id == id) {
                in_flight.remove(&key);
            }
            result
        });

        let abort = task.abort_handle();
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_cancelled() => Err(VigilError::backend_unavailable(
                    path,
                    "request cancelled during cleanup",
                )),
                Err(_) => Err(VigilError::backend_unavailable(path, "fetch task panicked")),
            }
        }
        .boxed()
        .shared();

        InFlight { id, future, abort }
    }

    /// Current value of each subject, one-shot.
    ///
    /// Fresh cached live values are reused; everything else is read once
    /// from the subject's live path under the request timeout. Non-null
    /// results are cached. Results are keyed by the input string; an
    /// invalid subject or failed read only affects its own entry.
    pub async fn fetch_current_batch(
        &self,
        subjects: &[&str],
    ) -> HashMap<String, VigilResult<Option<Arc<RawValue>>>> {
        let reads = subjects.iter().map(|raw| async move {
            let result = match Subject::parse(raw) {
                Ok(subject) => self.fetch_current(&subject).await,
                Err(err) => Err(err),
            };
            (raw.to_string(), result)
        });
        let results: HashMap<_, _> = join_all(reads).await.into_iter().collect();
        info!(
            subjects = subjects.len(),
            failed = results.values().filter(|r| r.is_err()).count(),
            "Batch current read completed"
        );
        results
    }

    async fn fetch_current(&self, subject: &Subject) -> VigilResult<Option<Arc<RawValue>>> {
        let key = CacheKey::live(subject);
        let cached = lock(&self.cache, "cache")?.get(&key);
        if let Some(value) = cached.as_ref().and_then(CachedValue::as_live) {
            return Ok(Some(Arc::clone(value)));
        }

        let path = subject.live_path();
        let outcome = tokio::time::timeout(self.request_timeout, self.backend.fetch_once(&path)).await;
        self.usage.record_read();
        let raw = match outcome {
            Ok(result) => result?,
            Err(_) => {
                self.usage.record_timeout();
                return Err(SyncError::Timeout {
                    key: key.to_string(),
                    after: self.request_timeout,
                }
                .into());
            }
        };

        if raw.is_null() {
            return Ok(None);
        }
        let value = Arc::new(raw);
        lock(&self.cache, "cache")?.set(key, CachedValue::Live(Arc::clone(&value)));
        Ok(Some(value))
    }

    /// Number of distinct range fetches currently running.
    pub fn in_flight_count(&self) -> usize {
        lock_or_recover(&self.in_flight, "in-flight requests").len()
    }

    /// Abort every running fetch. Waiters are rejected with
    /// `BackendUnavailable`. Returns how many fetches were aborted.
    pub fn abort_all(&self) -> usize {
        let drained: Vec<InFlight> = lock_or_recover(&self.in_flight, "in-flight requests")
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &drained {
            entry.abort.abort();
        }
        drained.len()
    }
}

/// Keep records inside `window`, sort ascending by timestamp (id breaks
/// ties) and keep the most recent `limit`.
pub fn select_window(
    records: Vec<TelemetryRecord>,
    window: TimeWindow,
    limit: usize,
) -> Vec<TelemetryRecord> {
    let mut selected: Vec<TelemetryRecord> = records
        .into_iter()
        .filter(|record| window.contains(record.timestamp))
        .collect();
    selected.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    if selected.len() > limit {
        selected.drain(..selected.len() - limit);
    }
    selected
}
