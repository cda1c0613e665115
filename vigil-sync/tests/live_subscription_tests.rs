//! Live subscription behaviour: multicast, cached delivery, throttling,
//! registry limits and failure handling.

use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vigil_core::{ErrorKind, VigilError};
use vigil_sync::{LiveDelivery, SubscriptionHandle};
use vigil_test_utils::{fixtures, BackendCall, Recorder};

#[path = "support/context.rs"]
mod test_context_support;

use test_context_support::{default_context, settle, test_context};

const DEVICE: &str = "device_01";

fn live(subject: &str) -> String {
    fixtures::live_path(subject)
}

fn kinds(events: &[LiveDelivery]) -> Vec<Option<ErrorKind>> {
    events
        .iter()
        .map(|event| event.as_ref().err().map(VigilError::kind))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn cached_value_is_delivered_on_next_tick_not_inline() {
    let (ctx, backend) = default_context();
    let first = Recorder::new();
    let _h1 = ctx.subscribe_live(DEVICE, first.callback()).unwrap();
    settle().await;
    backend.push(&live(DEVICE), fixtures::sensor_reading(1_000, 0.31, 0.1, 90));
    settle().await;
    assert_eq!(first.len(), 1);

    let second = Recorder::new();
    let _h2 = ctx.subscribe_live(DEVICE, second.callback()).unwrap();
    assert!(second.is_empty(), "cached value must not be delivered inside subscribe");

    settle().await;
    let delivered = second.last().unwrap().unwrap().unwrap();
    assert_eq!(delivered["ear"], json!(0.31));
    assert_eq!(backend.open_calls(&live(DEVICE)), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_before_next_tick_suppresses_cached_delivery() {
    let (ctx, backend) = default_context();
    let first = Recorder::new();
    let _h1 = ctx.subscribe_live(DEVICE, first.callback()).unwrap();
    settle().await;
    backend.push(&live(DEVICE), json!({"ear": 0.2}));
    settle().await;

    let second = Recorder::new();
    let h2 = ctx.subscribe_live(DEVICE, second.callback()).unwrap();
    h2.cancel();
    settle().await;

    assert!(second.is_empty());
    assert_eq!(ctx.manager().consumer_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn burst_is_throttled_to_leading_and_latest() {
    let (ctx, backend) = default_context();
    let recorder = Recorder::new();
    let _handle = ctx.subscribe_live(DEVICE, recorder.callback()).unwrap();
    settle().await;

    let start = tokio::time::Instant::now();
    for (offset, value) in [(0u64, 0), (250, 1), (500, 2), (750, 3)] {
        tokio::time::sleep_until(start + Duration::from_millis(offset)).await;
        backend.push(&live(DEVICE), json!({"seq": value}));
    }
    tokio::time::sleep_until(start + Duration::from_millis(1500)).await;

    let seqs: Vec<_> = recorder
        .events()
        .into_iter()
        .map(|event| event.unwrap().unwrap()["seq"].clone())
        .collect();
    assert_eq!(seqs, vec![json!(0), json!(3)]);
}

#[tokio::test(start_paused = true)]
async fn every_consumer_of_a_subject_gets_each_delivery() {
    let (ctx, backend) = default_context();
    let recorders: Vec<Recorder<LiveDelivery>> = (0..3).map(|_| Recorder::new()).collect();
    let _handles: Vec<_> = recorders
        .iter()
        .map(|r| ctx.subscribe_live(DEVICE, r.callback()).unwrap())
        .collect();
    settle().await;

    assert_eq!(backend.push(&live(DEVICE), json!({"ear": 0.4})), 1);
    settle().await;

    for recorder in &recorders {
        assert_eq!(recorder.len(), 1);
    }
    assert_eq!(ctx.stats().unwrap().open_subscriptions, 1);
}

#[tokio::test(start_paused = true)]
async fn registry_evicts_oldest_listener_when_full() {
    let config = fixtures::test_config().with_max_concurrent_listeners(2);
    let (ctx, backend) = test_context(config);
    let (a, b, c) = (Recorder::new(), Recorder::new(), Recorder::new());

    let ha = ctx.subscribe_live("dev_a", a.callback()).unwrap();
    let _hb = ctx.subscribe_live("dev_b", b.callback()).unwrap();
    let _hc = ctx.subscribe_live("dev_c", c.callback()).unwrap();
    settle().await;

    assert_eq!(ctx.stats().unwrap().open_subscriptions, 2);
    assert_eq!(backend.cancel_calls(&live("dev_a")), 1);
    assert_eq!(backend.active_listeners(&live("dev_a")), 0);

    backend.push(&live("dev_b"), json!({"ear": 0.1}));
    settle().await;
    assert!(a.is_empty());
    assert_eq!(b.len(), 1);

    // The evicted consumer's handle is now a no-op.
    ha.cancel();
    assert_eq!(ctx.stats().unwrap().open_subscriptions, 2);
    assert_eq!(ctx.manager().consumer_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn resubscribing_an_evicted_subject_opens_a_new_listener() {
    let config = fixtures::test_config().with_max_concurrent_listeners(1);
    let (ctx, backend) = test_context(config);

    let _ha = ctx.subscribe_live("dev_a", |_| {}).unwrap();
    let _hb = ctx.subscribe_live("dev_b", |_| {}).unwrap();
    let again = Recorder::new();
    let _ha2 = ctx.subscribe_live("dev_a", again.callback()).unwrap();
    settle().await;

    assert_eq!(backend.open_calls(&live("dev_a")), 2);
    assert_eq!(backend.cancel_calls(&live("dev_b")), 1);
    assert_eq!(
        backend.listener_calls(),
        vec![
            BackendCall::Opened(live("dev_a")),
            BackendCall::Cancelled(live("dev_a")),
            BackendCall::Opened(live("dev_b")),
            BackendCall::Cancelled(live("dev_b")),
            BackendCall::Opened(live("dev_a")),
        ],
        "the evicted listener is closed before its replacement opens"
    );
    backend.push(&live("dev_a"), json!({"ear": 0.5}));
    settle().await;
    assert_eq!(again.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn consumer_cancelled_by_a_sibling_mid_delivery_is_skipped() {
    let (ctx, backend) = default_context();
    let sibling: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

    let first = Recorder::new();
    let record = first.callback();
    let to_cancel = Arc::clone(&sibling);
    let _h1 = ctx
        .subscribe_live(DEVICE, move |delivery: LiveDelivery| {
            record(delivery);
            if let Some(handle) = to_cancel.lock().unwrap().take() {
                handle.cancel();
            }
        })
        .unwrap();
    let second: Recorder<LiveDelivery> = Recorder::new();
    let h2 = ctx.subscribe_live(DEVICE, second.callback()).unwrap();
    *sibling.lock().unwrap() = Some(h2);
    settle().await;

    backend.push(&live(DEVICE), json!({"ear": 0.3}));
    settle().await;

    assert_eq!(first.len(), 1);
    assert!(second.is_empty(), "no delivery after the handle was cancelled");
    assert_eq!(ctx.manager().consumer_count(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    backend.push(&live(DEVICE), json!({"ear": 0.4}));
    settle().await;
    assert_eq!(first.len(), 2);
    assert!(second.is_empty());
}

#[tokio::test(start_paused = true)]
async fn listener_error_reaches_all_consumers_and_releases_slot() {
    let (ctx, backend) = default_context();
    let (first, second) = (Recorder::new(), Recorder::new());
    let _h1 = ctx.subscribe_live(DEVICE, first.callback()).unwrap();
    let _h2 = ctx.subscribe_live(DEVICE, second.callback()).unwrap();
    settle().await;
    backend.push(&live(DEVICE), json!({"ear": 0.3}));
    settle().await;
    assert_eq!(ctx.stats().unwrap().cache_size, 1);

    backend.break_listener(
        &live(DEVICE),
        VigilError::backend_unavailable(live(DEVICE), "permission revoked"),
    );
    settle().await;

    for recorder in [&first, &second] {
        assert_eq!(
            kinds(&recorder.events()),
            vec![None, Some(ErrorKind::BackendUnavailable)]
        );
    }
    let stats = ctx.stats().unwrap();
    assert_eq!(stats.open_subscriptions, 0);
    assert_eq!(stats.consumers, 0);
    assert_eq!(stats.cache_size, 0);

    // No automatic retry.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(backend.open_calls(&live(DEVICE)), 1);
}

#[tokio::test(start_paused = true)]
async fn backend_closing_the_listener_counts_as_failure() {
    let (ctx, backend) = default_context();
    let recorder = Recorder::new();
    let _handle = ctx.subscribe_live(DEVICE, recorder.callback()).unwrap();
    settle().await;

    backend.drop_listeners(&live(DEVICE));
    settle().await;

    assert_eq!(kinds(&recorder.events()), vec![Some(ErrorKind::BackendUnavailable)]);
    assert_eq!(ctx.stats().unwrap().open_subscriptions, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_open_is_reported_asynchronously() {
    let (ctx, backend) = default_context();
    backend.fail_open(&live(DEVICE), VigilError::backend_unavailable(live(DEVICE), "offline"));

    let recorder = Recorder::new();
    let handle = ctx.subscribe_live(DEVICE, recorder.callback()).unwrap();
    assert!(recorder.is_empty());
    settle().await;

    assert_eq!(kinds(&recorder.events()), vec![Some(ErrorKind::BackendUnavailable)]);
    assert_eq!(ctx.stats().unwrap().open_subscriptions, 0);
    handle.cancel();
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn pending_throttled_value_is_dropped_on_cancel() {
    let (ctx, backend) = default_context();
    let recorder = Recorder::new();
    let handle = ctx.subscribe_live(DEVICE, recorder.callback()).unwrap();
    settle().await;

    backend.push(&live(DEVICE), json!({"seq": 1}));
    settle().await;
    backend.push(&live(DEVICE), json!({"seq": 2}));
    settle().await;
    handle.cancel();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(recorder.len(), 1);
    assert_eq!(backend.active_listeners(&live(DEVICE)), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_subject_fails_without_touching_backend() {
    let (ctx, backend) = default_context();
    for bad in ["", "  ", "dev/1", "dev.1", "dev:1"] {
        let err = ctx.subscribe_live(bad, |_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubject);
    }
    assert_eq!(backend.total_open_calls(), 0);
}
