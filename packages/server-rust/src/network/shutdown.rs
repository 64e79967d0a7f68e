//! Server lifecycle: the root [`Context`], accept state, and query draining.
//!
//! Every connection context is derived from [`ShutdownController::root`], so
//! one `trigger_shutdown()` reaches every session and every running query.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use pgscope_core::{CancelHandle, Context};
use tokio::sync::watch;

/// Lifecycle state: `Starting -> Accepting -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Listener not yet serving.
    Starting,
    /// Accept loop is running.
    Accepting,
    /// Root context cancelled; queries are winding down.
    Draining,
    /// No queries left in flight.
    Stopped,
}

impl ServerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Accepting => "accepting",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Owns the root scope and counts queries still running.
///
/// The state lives in an `ArcSwap` so status reads never block the accept
/// loop. The in-flight count is a `watch` channel so draining can wait for
/// zero without polling.
#[derive(Debug)]
pub struct ShutdownController {
    root: Context,
    cancel: CancelHandle,
    state: ArcSwap<ServerState>,
    in_flight: Arc<watch::Sender<u64>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (root, cancel) = Context::background().with_cancel();
        let (in_flight, _) = watch::channel(0);
        Self {
            root,
            cancel,
            state: ArcSwap::from_pointee(ServerState::Starting),
            in_flight: Arc::new(in_flight),
        }
    }

    /// Parent of every connection context.
    #[must_use]
    pub fn root(&self) -> &Context {
        &self.root
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        **self.state.load()
    }

    pub fn mark_accepting(&self) {
        self.state.store(Arc::new(ServerState::Accepting));
    }

    /// Enters `Draining` and cancels the root scope. Idempotent.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(ServerState::Draining));
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Counts one running query until the guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.send_modify(|n| *n += 1);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        *self.in_flight.borrow()
    }

    /// Waits until no query is in flight, giving up after `timeout`.
    ///
    /// On success the state becomes `Stopped` and `true` is returned.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut rx = self.in_flight.subscribe();
        let drained = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|res| res.is_ok());
        if drained {
            self.state.store(Arc::new(ServerState::Stopped));
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<watch::Sender<u64>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}
