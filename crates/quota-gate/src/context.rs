//! The cooperative, cancellable, activity-counted operation state machine
//! every asynchronous operation in this crate rides on.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::{GateError, GateResult, Status};

/// A callback invoked exactly once, off the caller's thread, when a context
/// reaches [`ContextState::Completed`].
pub type CompletionCallback = Box<dyn FnOnce(Status) + Send + 'static>;

/// The state an [`AsyncContext`] occupies.
///
/// `reuse()` returns a completed context directly to `Initialized` — the
/// spec's attribute list names a resting `Reused` state, but the lifecycle
/// diagram shows no observable state between `Completed` and `Initialized`;
/// no caller can ever read a context as "Reused", so it is not modeled as a
/// distinct variant here (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Initialized,
    Operational,
    Cancelling,
    Completing,
    Completed,
}

/// Tracks outstanding operations pinned against some owner — a generic
/// parent [`AsyncContext`], or (in `quota_gate`) the gate's own waiters plus
/// its self-reference. Reaching zero is a distinct event from reaching zero
/// *ownership* references (spec.md §9 "Activity counting vs. ref counting");
/// this type only ever answers "how many operations are still outstanding".
#[derive(Debug, Default)]
pub struct ActivityCounter {
    count: std::sync::atomic::AtomicI64,
}

impl ActivityCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: std::sync::atomic::AtomicI64::new(0),
        }
    }

    /// Registers one more outstanding operation.
    pub fn acquire(&self) {
        self.count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    /// Retires one outstanding operation. Returns `true` if this call
    /// observed the count drop to exactly zero — the caller is responsible
    /// for firing whatever is armed on that transition, exactly once.
    pub fn release(&self) -> bool {
        let prev = self
            .count
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
        debug_assert!(prev > 0, "activity count released more times than acquired");
        prev - 1 == 0
    }

    #[must_use]
    pub fn get(&self) -> i64 {
        self.count.load(std::sync::atomic::Ordering::Acquire)
    }
}

struct Inner {
    state: ContextState,
    status: Option<Status>,
    parent: Option<Arc<AsyncContext>>,
    callback: Option<CompletionCallback>,
    cancel_requested: bool,
}

/// One asynchronous operation: the state machine described in spec.md §3.1 /
/// §4.2. `QuotaGate` and `AcquireContext` are both built on this type —
/// `AcquireContext` embeds one to represent the acquire itself, and
/// `QuotaGate` embeds one to represent its own activation/deactivation
/// lifecycle.
///
/// Requires an active Tokio runtime: `complete()` hands the completion
/// callback to `tokio::spawn` so it never runs inline on the caller that
/// triggered completion, mirroring the "callback on a non-caller thread"
/// contract. This is the same requirement `CircuitBreaker` places on its
/// callers via its `RwLock`/`sleep` usage.
pub struct AsyncContext {
    inner: Mutex<Inner>,
    activity: ActivityCounter,
    notify: Notify,
}

impl std::fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock().state;
        f.debug_struct("AsyncContext")
            .field("state", &state)
            .field("activity", &self.activity.get())
            .finish_non_exhaustive()
    }
}

impl Default for AsyncContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncContext {
    /// Creates a new context in `Initialized` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ContextState::Initialized,
                status: None,
                parent: None,
                callback: None,
                cancel_requested: false,
            }),
            activity: ActivityCounter::new(),
            notify: Notify::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ContextState {
        self.inner.lock().state
    }

    /// This context's own activity counter — the count of children that
    /// named `self` as their parent and are still `Operational`.
    #[must_use]
    pub fn activity(&self) -> &ActivityCounter {
        &self.activity
    }

    /// Legal only in `Initialized`. Transitions to `Operational`, registers
    /// one unit of activity on `parent` (if given), and arms `callback` for
    /// the eventual `complete()`. Concurrent `start` calls on the same
    /// context are undefined — callers guarantee single start per cycle.
    #[tracing::instrument(skip(self, parent, callback), level = "debug")]
    pub fn start(
        self: &Arc<Self>,
        parent: Option<Arc<AsyncContext>>,
        callback: Option<CompletionCallback>,
    ) -> GateResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != ContextState::Initialized {
            return Err(GateError::InvalidState(Status::InvalidState));
        }
        if let Some(p) = &parent {
            p.activity.acquire();
        }
        inner.parent = parent;
        inner.callback = callback;
        inner.state = ContextState::Operational;
        trace!("context started");
        Ok(())
    }

    /// Legal in `Operational`. Sets the cancel-requested flag and moves to
    /// `Cancelling`; the owner observes this and completes the context with
    /// `Cancelled` as soon as it safely can. Idempotent and non-blocking —
    /// calling it again (from `Cancelling` or `Completed`) is a no-op.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            ContextState::Operational => {
                inner.cancel_requested = true;
                inner.state = ContextState::Cancelling;
                debug!("cancel requested");
            }
            ContextState::Cancelling => {
                // Already requested; idempotent per spec.md §8.2.
            }
            _ => {
                // Too late to matter: owner has already moved past Operational.
            }
        }
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.lock().cancel_requested
    }

    /// Internal transition used by the owner (`AcquireContext`, `QuotaGate`).
    /// Legal only from `Operational` or `Cancelling`. Sets `status`, moves to
    /// `Completed`, releases the parent's activity slot, then schedules the
    /// callback on a Tokio task so it never runs inline on this call stack.
    #[tracing::instrument(skip(self), fields(status = ?status), level = "debug")]
    pub(crate) fn complete(self: &Arc<Self>, status: Status) {
        let (parent, callback) = {
            let mut inner = self.inner.lock();
            match inner.state {
                ContextState::Operational | ContextState::Cancelling => {}
                other => {
                    warn!(?other, "complete() called from non-operational state, ignoring");
                    return;
                }
            }
            inner.state = ContextState::Completing;
            inner.status = Some(status);
            inner.state = ContextState::Completed;
            (inner.parent.take(), inner.callback.take())
        };

        if let Some(parent) = parent {
            parent.activity.release();
        }

        self.notify.notify_waiters();

        if let Some(callback) = callback {
            tokio::spawn(async move {
                callback(status);
            });
        }
        debug!("context completed");
    }

    /// Legal only from `Completed`. Reads the final outcome.
    pub fn status(&self) -> GateResult<Status> {
        let inner = self.inner.lock();
        inner
            .status
            .filter(|_| inner.state == ContextState::Completed)
            .ok_or(GateError::InvalidState(Status::InvalidState))
    }

    /// Legal only from `Completed`. Resets to `Initialized`, clearing
    /// `status`, `parent`, and `callback`. No reallocation — the same
    /// `Arc<AsyncContext>` is reused for the next cycle.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn reuse(&self) -> GateResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != ContextState::Completed {
            return Err(GateError::InvalidState(Status::InvalidState));
        }
        inner.status = None;
        inner.parent = None;
        inner.callback = None;
        inner.cancel_requested = false;
        inner.state = ContextState::Initialized;
        trace!("context reused");
        Ok(())
    }

    /// Awaitable adapter over the callback core (spec.md §9 "Coroutine /
    /// awaitable variants"): resolves with the terminal [`Status`] once this
    /// context reaches `Completed`, without requiring a callback to have
    /// been armed via `start`. Built entirely from `notify` — no additional
    /// core state, as the design note requires.
    pub async fn join(self: &Arc<Self>) -> Status {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock();
                if inner.state == ContextState::Completed {
                    return inner.status.expect("status set before Completed");
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arm(result: Arc<Mutex<Option<Status>>>) -> CompletionCallback {
        Box::new(move |status| {
            *result.lock() = Some(status);
        })
    }

    #[tokio::test]
    async fn start_then_complete_invokes_callback_once() {
        let ctx = Arc::new(AsyncContext::new());
        let result = Arc::new(Mutex::new(None));
        ctx.start(None, Some(arm(Arc::clone(&result)))).unwrap();
        assert_eq!(ctx.state(), ContextState::Operational);

        ctx.complete(Status::Success);
        assert_eq!(ctx.state(), ContextState::Completed);
        assert_eq!(ctx.status().unwrap(), Status::Success);

        tokio::task::yield_now().await;
        assert_eq!(*result.lock(), Some(Status::Success));
    }

    #[tokio::test]
    async fn start_on_non_initialized_is_invalid_state() {
        let ctx = Arc::new(AsyncContext::new());
        ctx.start(None, None).unwrap();
        let err = ctx.start(None, None).unwrap_err();
        assert_eq!(err.as_status(), Status::InvalidState);
    }

    #[tokio::test]
    async fn reuse_resets_and_requires_completed() {
        let ctx = Arc::new(AsyncContext::new());
        assert!(ctx.reuse().is_err());

        ctx.start(None, None).unwrap();
        ctx.complete(Status::Cancelled);
        ctx.reuse().unwrap();
        assert_eq!(ctx.state(), ContextState::Initialized);
        assert!(ctx.status().is_err());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let ctx = Arc::new(AsyncContext::new());
        ctx.start(None, None).unwrap();
        ctx.cancel();
        ctx.cancel();
        assert!(ctx.is_cancel_requested());
        assert_eq!(ctx.state(), ContextState::Cancelling);
    }

    #[tokio::test]
    async fn parent_activity_count_tracks_child_lifecycle() {
        let parent = Arc::new(AsyncContext::new());
        let child = Arc::new(AsyncContext::new());

        child.start(Some(Arc::clone(&parent)), None).unwrap();
        assert_eq!(parent.activity().get(), 1);

        child.complete(Status::Success);
        assert_eq!(parent.activity().get(), 0);
    }

    #[tokio::test]
    async fn join_resolves_after_complete_even_if_awaited_first() {
        let ctx = Arc::new(AsyncContext::new());
        ctx.start(None, None).unwrap();

        let joiner = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.join().await })
        };

        tokio::task::yield_now().await;
        ctx.complete(Status::ShutdownPending);

        let status = joiner.await.unwrap();
        assert_eq!(status, Status::ShutdownPending);
    }

    #[tokio::test]
    async fn join_resolves_immediately_if_already_completed() {
        let ctx = Arc::new(AsyncContext::new());
        ctx.start(None, None).unwrap();
        ctx.complete(Status::Success);

        let status = ctx.join().await;
        assert_eq!(status, Status::Success);
    }
}
