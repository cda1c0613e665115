//! Telemetry backend contract.
//!
//! The sync layer never talks to a database directly. It is handed a
//! [`TelemetryBackend`] that can open push listeners on a path and perform
//! one-shot reads. Pushes are delivered through a [`ListenerSink`], an
//! unbounded channel, so a backend can never call back into the sync layer
//! synchronously from inside `open_live_listener`.

use crate::error::{VigilError, VigilResult};
use crate::RawValue;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// One push from an open listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    /// New value at the path. `Null` means the path holds no data.
    Value(RawValue),
    /// The listener broke. No further events follow.
    Error(VigilError),
}

/// Write half of a listener; handed to the backend on open.
#[derive(Debug, Clone)]
pub struct ListenerSink {
    tx: mpsc::UnboundedSender<ListenerEvent>,
}

impl ListenerSink {
    /// Create a sink and the receiver the sync layer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Push a value. Returns `false` once the listener has been released.
    pub fn push_value(&self, value: RawValue) -> bool {
        self.tx.send(ListenerEvent::Value(value)).is_ok()
    }

    /// Report a listener failure. Returns `false` once the listener has been released.
    pub fn push_error(&self, error: VigilError) -> bool {
        self.tx.send(ListenerEvent::Error(error)).is_ok()
    }

    /// True once the sync layer has dropped the receiving side.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Cancellation for an open backend listener.
///
/// Calling [`ListenerGuard::cancel`] detaches the listener; dropping the
/// guard without cancelling leaves it attached.
pub struct ListenerGuard {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerGuard {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A guard with nothing to detach.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Backend collaborator: push listeners plus one-shot reads.
///
/// Implementations must not invoke the sync layer from inside
/// `open_live_listener` or from the guard's cancel function.
#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    /// Attach a listener to `path`. Values and failures are pushed to `sink`
    /// until the returned guard is cancelled.
    ///
    /// Fails with `BackendUnavailable` when the listener cannot be attached.
    fn open_live_listener(&self, path: &str, sink: ListenerSink) -> VigilResult<ListenerGuard>;

    /// Read the current value at `path` once.
    async fn fetch_once(&self, path: &str) -> VigilResult<RawValue>;
}
