//! Usage Monitor Background Task
//!
//! Every `monitor_interval` the task:
//!
//! - logs the current sync stats
//! - checks usage against the configured thresholds (warnings are logged)
//! - sweeps expired cache entries
//!
//! It runs until the shutdown signal flips to `true`.

use crate::context::SyncContext;
use crate::usage::UsageSnapshot;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Background loop for one context.
///
/// # Returns
///
/// The usage snapshot taken at shutdown.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(monitor_task(ctx.clone(), shutdown_rx));
///
/// // Later, trigger shutdown
/// let _ = shutdown_tx.send(true);
/// let final_usage = handle.await?;
/// ```
pub async fn monitor_task(
    ctx: Arc<SyncContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> UsageSnapshot {
    let period = ctx.config().monitor_interval;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; skip it so the first report
    // covers a full period.
    ticker.tick().await;

    tracing::info!(interval_secs = period.as_secs(), "Usage monitor started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Usage monitor shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                run_cycle(&ctx);
            }
        }
    }

    let snapshot = ctx.usage().snapshot();
    tracing::info!(
        reads = snapshot.reads,
        active_listeners = snapshot.active_listeners,
        collapsed_requests = snapshot.collapsed_requests,
        timeouts = snapshot.timeouts,
        "Usage monitor completed"
    );
    snapshot
}

/// Spawn [`monitor_task`] and return its handle plus the shutdown sender.
pub fn spawn_monitor(ctx: Arc<SyncContext>) -> (JoinHandle<UsageSnapshot>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(monitor_task(ctx, shutdown_rx));
    (handle, shutdown_tx)
}

fn run_cycle(ctx: &SyncContext) {
    match ctx.stats() {
        Ok(stats) => tracing::info!(
            cache_size = stats.cache_size,
            hit_rate = stats.hit_rate,
            open_subscriptions = stats.open_subscriptions,
            consumers = stats.consumers,
            in_flight = stats.in_flight,
            reads_per_minute = stats.usage.reads_per_minute(),
            "Sync stats"
        ),
        Err(e) => tracing::error!(error = %e, "Failed to collect sync stats"),
    }

    ctx.usage().check_thresholds(&ctx.config().usage_thresholds);

    match ctx.purge_expired() {
        Ok(0) => tracing::trace!("No expired cache entries"),
        Ok(purged) => tracing::debug!(purged, "Expired cache entries purged"),
        Err(e) => tracing::error!(error = %e, "Failed to purge expired cache entries"),
    }
}
