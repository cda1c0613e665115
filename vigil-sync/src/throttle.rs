//! Trailing-edge throttle.
//!
//! [`ThrottleGate`] forwards the first call immediately, then at most one
//! call per interval. Calls that arrive inside the interval replace each
//! other; when the interval ends the most recent one is delivered. Nothing
//! is queued beyond that single pending slot.
//!
//! The trailing delivery runs on a spawned tokio task, so `call` must be
//! made from inside a runtime.

use crate::locks::lock_or_recover;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::error;

/// Rate-limiting wrapper around a handler.
pub struct ThrottleGate<A> {
    inner: Arc<GateInner<A>>,
}

impl<A> Clone for ThrottleGate<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct GateInner<A> {
    interval: Duration,
    handler: Box<dyn Fn(A) + Send + Sync>,
    state: Mutex<GateState<A>>,
}

struct GateState<A> {
    last_invoked: Option<Instant>,
    pending: Option<A>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the armed timer is replaced or disarmed; a timer that
    /// wakes with a stale generation does nothing.
    timer_generation: u64,
    cancelled: bool,
}

impl<A: Send + 'static> ThrottleGate<A> {
    pub fn new(interval: Duration, handler: impl Fn(A) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(GateInner {
                interval,
                handler: Box::new(handler),
                state: Mutex::new(GateState {
                    last_invoked: None,
                    pending: None,
                    timer: None,
                    timer_generation: 0,
                    cancelled: false,
                }),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Offer `args` to the handler.
    ///
    /// Invokes immediately if nothing was delivered within the last
    /// interval, otherwise stores `args` as the pending value and makes sure
    /// a trailing delivery is scheduled. No-op after [`ThrottleGate::cancel`].
    pub fn call(&self, args: A) {
        let now = Instant::now();
        let mut state = lock_or_recover(&self.inner.state, "throttle gate");
        if state.cancelled {
            return;
        }

        let since_last = state
            .last_invoked
            .map(|last| now.saturating_duration_since(last));

        match since_last {
            Some(elapsed) if elapsed < self.inner.interval => {
                state.pending = Some(args);
                if state.timer.is_none() {
                    state.timer_generation += 1;
                    let generation = state.timer_generation;
                    let wait = self.inner.interval - elapsed;
                    let inner = Arc::clone(&self.inner);
                    state.timer = Some(tokio::spawn(async move {
                        sleep(wait).await;
                        inner.fire(generation);
                    }));
                }
            }
            _ => {
                state.last_invoked = Some(now);
                state.pending = None;
                disarm(&mut state);
                drop(state);
                self.inner.invoke(args);
            }
        }
    }

    /// Drop any pending value and disarm the timer. Permanent.
    pub fn cancel(&self) {
        let mut state = lock_or_recover(&self.inner.state, "throttle gate");
        state.cancelled = true;
        state.pending = None;
        disarm(&mut state);
    }

    pub fn is_cancelled(&self) -> bool {
        lock_or_recover(&self.inner.state, "throttle gate").cancelled
    }

    /// True while a trailing delivery is waiting for its slot.
    pub fn has_pending(&self) -> bool {
        lock_or_recover(&self.inner.state, "throttle gate")
            .pending
            .is_some()
    }
}

fn disarm<A>(state: &mut GateState<A>) {
    if let Some(timer) = state.timer.take() {
        timer.abort();
    }
    state.timer_generation += 1;
}

impl<A> GateInner<A> {
    fn fire(&self, generation: u64) {
        let args = {
            let mut state = lock_or_recover(&self.state, "throttle gate");
            if state.cancelled || state.timer_generation != generation {
                return;
            }
            state.timer = None;
            let args = state.pending.take();
            if args.is_some() {
                state.last_invoked = Some(Instant::now());
            }
            args
        };
        if let Some(args) = args {
            self.invoke(args);
        }
    }

    /// Run the handler without holding the state lock. A panicking handler
    /// is logged and leaves the gate usable.
    fn invoke(&self, args: A) {
        if catch_unwind(AssertUnwindSafe(|| (self.handler)(args))).is_err() {
            error!(interval_ms = self.interval.as_millis() as u64, "Throttled handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    type Log = Arc<Mutex<Vec<(u32, Duration)>>>;

    fn recording_gate(interval_ms: u64) -> (ThrottleGate<u32>, Log, Instant) {
        let start = Instant::now();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let gate = ThrottleGate::new(Duration::from_millis(interval_ms), move |v| {
            sink.lock().unwrap().push((v, start.elapsed()));
        });
        (gate, log, start)
    }

    async fn at(start: Instant, ms: u64) {
        tokio::time::sleep_until(start + Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_is_immediate() {
        let (gate, log, _) = recording_gate(1000);
        gate.call(7);
        assert_eq!(log.lock().unwrap().as_slice(), &[(7, Duration::ZERO)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_delivers_leading_and_latest_trailing() {
        let (gate, log, start) = recording_gate(1000);
        gate.call(0);
        at(start, 250).await;
        gate.call(1);
        at(start, 500).await;
        gate.call(2);
        at(start, 750).await;
        gate.call(3);
        at(start, 1500).await;

        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[(0, Duration::ZERO), (3, Duration::from_millis(1000))]
        );
        assert!(!gate.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_after_interval_is_immediate() {
        let (gate, log, start) = recording_gate(1000);
        gate.call(1);
        at(start, 1200).await;
        gate.call(2);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[(1, Duration::ZERO), (2, Duration::from_millis(1200))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_and_ignores_later_calls() {
        let (gate, log, start) = recording_gate(1000);
        gate.call(1);
        at(start, 100).await;
        gate.call(2);
        assert!(gate.has_pending());
        gate.cancel();
        gate.call(3);
        at(start, 3000).await;

        assert_eq!(log.lock().unwrap().as_slice(), &[(1, Duration::ZERO)]);
        assert!(gate.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_does_not_wedge_gate() {
        let start = Instant::now();
        let delivered = Arc::new(AtomicBool::new(false));
        let flag = delivered.clone();
        let gate = ThrottleGate::new(Duration::from_millis(100), move |v: u32| {
            if v == 0 {
                panic!("consumer blew up");
            }
            flag.store(true, Ordering::SeqCst);
        });

        gate.call(0);
        at(start, 50).await;
        gate.call(1);
        at(start, 200).await;

        assert!(delivered.load(Ordering::SeqCst));
    }
}
