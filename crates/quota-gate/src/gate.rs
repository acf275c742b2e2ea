//! A FIFO quantitative semaphore: hands out `desired_quanta` tokens in
//! strict enqueue order, built entirely on [`AsyncContext`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::context::{ActivityCounter, AsyncContext, CompletionCallback};
use crate::error::{GateError, GateResult, Status};
use crate::pool::PooledAllocator;

struct QueuedAcquire {
    ctx: Arc<AsyncContext>,
    desired_quanta: u64,
}

struct GateState {
    free_quanta: u64,
    is_active: bool,
    version: u64,
    waiter_list: VecDeque<QueuedAcquire>,
}

/// Pops every waiter the current `free_quanta` can satisfy, in FIFO order,
/// and returns them for completion *outside* the caller's lock — this is
/// spec.md §4.3.2's service algorithm, the heart of the gate.
fn drain_ready_locked(state: &mut GateState) -> Vec<QueuedAcquire> {
    let mut ready = Vec::new();
    while let Some(head) = state.waiter_list.front() {
        if state.free_quanta >= head.desired_quanta {
            let head = state.waiter_list.pop_front().expect("front just checked Some");
            state.free_quanta -= head.desired_quanta;
            ready.push(head);
        } else {
            break;
        }
    }
    ready
}

struct GateInner {
    /// Represents the gate's own Created/Activated/Deactivated lifecycle:
    /// composition standing in for the source's `KQuotaGate : public
    /// KAsyncContextBase` inheritance. The activation callback supplied to
    /// `activate()` is armed here and fires only once this context
    /// completes, which happens when `deactivate()`'s drain has released
    /// every waiter and the gate's own self-reference in `activity`.
    activation_ctx: Arc<AsyncContext>,
    /// "contexts (waiters + gate itself) keeping the gate alive" — spec.md
    /// §3.2. Distinct from `AsyncContext`'s own generic parent-activity
    /// bookkeeping; this one is entirely the gate's internal accounting.
    activity: ActivityCounter,
    state: Mutex<GateState>,
}

impl GateInner {
    fn complete_queued(&self, queued: QueuedAcquire, status: Status) {
        queued.ctx.complete(status);
        if self.activity.release() {
            self.activation_ctx.complete(Status::Success);
        }
    }

    fn complete_many(&self, ready: Vec<QueuedAcquire>, status: Status) {
        for queued in ready {
            self.complete_queued(queued, status);
        }
    }
}

/// A FIFO quantitative semaphore. See the module docs for the full contract.
#[derive(Clone)]
pub struct QuotaGate {
    inner: Arc<GateInner>,
}

impl std::fmt::Debug for QuotaGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("QuotaGate")
            .field("free_quanta", &state.free_quanta)
            .field("is_active", &state.is_active)
            .field("version", &state.version)
            .field("waiters", &state.waiter_list.len())
            .finish_non_exhaustive()
    }
}

impl QuotaGate {
    /// Instantiates a gate in the `Created` state.
    ///
    /// The original `KQuotaGate::Create` factory takes no quanta parameter
    /// at all — only `Activate` sets `FreeQuanta`. `initial_free_quanta` is
    /// accepted here to keep the public signature this crate's contract
    /// names, but it has no effect on gate state; the value passed to
    /// [`QuotaGate::activate`] is authoritative (see DESIGN.md).
    #[must_use]
    pub fn create(initial_free_quanta: u64) -> Self {
        let _ = initial_free_quanta;
        Self {
            inner: Arc::new(GateInner {
                activation_ctx: Arc::new(AsyncContext::new()),
                activity: ActivityCounter::new(),
                state: Mutex::new(GateState {
                    free_quanta: 0,
                    is_active: false,
                    version: 0,
                    waiter_list: VecDeque::new(),
                }),
            }),
        }
    }

    /// Transitions `Created` → `Activated`. `parent`/`callback` form the
    /// activation's outer async context: the callback fires only once the
    /// gate has fully deactivated, not on activation itself.
    #[tracing::instrument(skip(self, parent, callback), level = "debug")]
    pub fn activate(
        &self,
        initial_free_quanta: u64,
        parent: Option<Arc<AsyncContext>>,
        callback: Option<CompletionCallback>,
    ) -> GateResult<()> {
        self.inner.activation_ctx.start(parent, callback)?;
        {
            let mut state = self.inner.state.lock();
            state.free_quanta = initial_free_quanta;
            state.is_active = true;
        }
        // The gate's self-reference in activity_count, preventing premature
        // teardown while active (spec.md §3.2 invariant).
        self.inner.activity.acquire();
        info!(initial_free_quanta, "gate activated");
        Ok(())
    }

    /// Awaitable sugar over [`QuotaGate::activate`] — the activate call
    /// itself never suspends (it either succeeds or fails synchronously);
    /// this exists purely so callers composing with other awaitables don't
    /// need a sync/async split, matching the source's `KCoQuotaGate`.
    pub async fn activate_async(&self, initial_free_quanta: u64) -> GateResult<()> {
        self.activate(initial_free_quanta, None, None)
    }

    /// Legal only while `Activated`; records `owner_version`. The returned
    /// context starts `Initialized`.
    pub fn create_acquire_context(&self) -> GateResult<AcquireContext> {
        let state = self.inner.state.lock();
        if !state.is_active {
            return Err(GateError::InvalidState(Status::InvalidState));
        }
        let owner_version = state.version;
        drop(state);
        Ok(AcquireContext {
            ctx: Arc::new(AsyncContext::new()),
            gate: Arc::clone(&self.inner),
            owner_version,
        })
    }

    /// Like [`QuotaGate::create_acquire_context`], but draws the underlying
    /// [`AsyncContext`] from `pool` instead of allocating a fresh `Arc` every
    /// time — the high-rate path spec.md §4.1/§9 calls out as the pooled
    /// allocator's principal use case. A pool miss surfaces as
    /// [`Status::ResourceExhausted`] through [`GateError::ResourceExhausted`]
    /// (spec.md §7 "Allocator failure ... surfaces ... through
    /// `create_acquire_context`"), leaving the gate's own state untouched.
    pub fn create_acquire_context_pooled(
        &self,
        pool: &PooledAllocator<Arc<AsyncContext>>,
    ) -> GateResult<AcquireContext> {
        let state = self.inner.state.lock();
        if !state.is_active {
            return Err(GateError::InvalidState(Status::InvalidState));
        }
        let owner_version = state.version;
        drop(state);
        let ctx = pool.allocate()?;
        Ok(AcquireContext {
            ctx,
            gate: Arc::clone(&self.inner),
            owner_version,
        })
    }

    /// Legal while `Activated`. `n` may be zero (a no-op release, useful
    /// purely as a wake to re-run the service loop). Releasing more than
    /// was ever acquired is permitted; the gate tracks no ceiling.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn release(&self, n: u64) {
        let ready = {
            let mut state = self.inner.state.lock();
            // Saturate rather than risk silent wraparound on repeated huge
            // releases (spec.md §4.3.2 "Overflow"); `release_quanta` must
            // never fail per spec.md §4.3.3.
            state.free_quanta = state.free_quanta.saturating_add(n);
            drain_ready_locked(&mut state)
        };
        let granted = ready.len();
        self.inner.complete_many(ready, Status::Success);
        debug!(n, granted, "released quanta");
    }

    /// Advisory read — may be stale the instant it returns.
    #[must_use]
    pub fn get_free_quanta(&self) -> u64 {
        self.inner.state.lock().free_quanta
    }

    /// Transitions `Activated` → `Deactivating` → `Deactivated`. Idempotent:
    /// a gate that is not active is left untouched. Every queued acquirer
    /// is detached under the lock and completed with `ShutdownPending`
    /// *outside* it, then the gate's own self-reference is released; when
    /// activity reaches zero the activation callback fires.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn deactivate(&self) {
        let drained: Vec<QueuedAcquire> = {
            let mut state = self.inner.state.lock();
            if !state.is_active {
                trace!("deactivate on an already-inactive gate, no-op");
                return;
            }
            state.is_active = false;
            state.version += 1;
            std::mem::take(&mut state.waiter_list).into_iter().collect()
        };

        let drained_count = drained.len();
        self.inner.complete_many(drained, Status::ShutdownPending);

        if self.inner.activity.release() {
            self.inner.activation_ctx.complete(Status::Success);
        }
        warn!(drained_count, "gate deactivated");
    }

    /// Awaitable sugar: deactivates, then awaits the activation context's
    /// completion (fired once every drained waiter and the gate's own
    /// self-reference have released), mirroring `KCoQuotaGate::DeactivateAsync`.
    pub async fn deactivate_async(&self) -> Status {
        self.deactivate();
        self.inner.activation_ctx.join().await
    }

    /// One-shot awaitable acquire: creates a context, starts the acquire,
    /// and resolves with its terminal status. Convenience wrapper — callers
    /// needing to hold onto the context for an explicit `cancel()` should
    /// use [`QuotaGate::create_acquire_context`] directly.
    pub async fn acquire(&self, desired: u64) -> GateResult<Status> {
        let ctx = self.create_acquire_context()?;
        ctx.acquire(desired).await
    }

    /// Legal only after `Deactivated`. Resets `free_quanta` to zero and
    /// requires `waiter_list` to already be empty (guaranteed by
    /// `deactivate`'s drain). `version` is not incremented again here —
    /// `deactivate` already advanced it exactly once for this cycle.
    pub fn reuse(&self) -> GateResult<()> {
        let mut state = self.inner.state.lock();
        if state.is_active {
            return Err(GateError::InvalidState(Status::InvalidState));
        }
        if !state.waiter_list.is_empty() {
            return Err(GateError::InvalidState(Status::InvalidState));
        }
        state.free_quanta = 0;
        drop(state);
        self.inner.activation_ctx.reuse()?;
        trace!("gate reused");
        Ok(())
    }
}

/// Externally loadable configuration for a [`QuotaGate`], gated behind the
/// `config` feature for symmetry with [`PooledAllocatorConfig`](crate::pool::PooledAllocatorConfig).
/// The gate itself has no tunables beyond its initial quanta — which is a
/// call argument to [`QuotaGate::activate`], not configuration — so this
/// struct carries nothing today; it exists as the extension point future
/// quota classes (e.g. a default initial allowance loaded from a config
/// file) would hang policy off of.
#[cfg(feature = "config")]
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct QuotaGateConfig {}

/// An [`AsyncContext`] parameterised by `desired_quanta`: a pending or
/// satisfied request against a [`QuotaGate`].
pub struct AcquireContext {
    ctx: Arc<AsyncContext>,
    gate: Arc<GateInner>,
    owner_version: u64,
}

impl std::fmt::Debug for AcquireContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquireContext")
            .field("state", &self.ctx.state())
            .field("owner_version", &self.owner_version)
            .finish_non_exhaustive()
    }
}

impl AcquireContext {
    /// Caller passes `desired >= 0` (unsigned, so this is just "any `u64`").
    /// Captures `owner_version` against the gate's current `version` under
    /// the gate lock: a mismatch, or an inactive gate, completes the
    /// context immediately with `ShutdownPending`. Otherwise the context is
    /// queued at the tail and the service loop is run immediately.
    #[tracing::instrument(skip(self, parent, callback), fields(desired), level = "debug")]
    pub fn start_acquire(
        &self,
        desired: u64,
        parent: Option<Arc<AsyncContext>>,
        callback: Option<CompletionCallback>,
    ) -> GateResult<()> {
        self.ctx.start(parent, callback)?;

        let outcome = {
            let mut state = self.gate.state.lock();
            if !state.is_active || self.owner_version != state.version {
                None
            } else {
                self.gate.activity.acquire();
                state.waiter_list.push_back(QueuedAcquire {
                    ctx: Arc::clone(&self.ctx),
                    desired_quanta: desired,
                });
                Some(drain_ready_locked(&mut state))
            }
        };

        match outcome {
            None => {
                debug!("start_acquire against stale/inactive gate, ShutdownPending");
                self.ctx.complete(Status::ShutdownPending);
            }
            Some(ready) => {
                self.gate.complete_many(ready, Status::Success);
            }
        }
        Ok(())
    }

    /// Equivalent to cancelling the underlying context, but arbitrated by
    /// waiter-list membership: this call only wins if it observes the
    /// context still linked in the gate's `waiter_list`. If the service
    /// loop has already popped it, the acquire has already succeeded (or is
    /// completing) and this becomes a no-op — Success wins the race.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn cancel(&self) {
        self.ctx.cancel();

        let removed = {
            let mut state = self.gate.state.lock();
            state
                .waiter_list
                .iter()
                .position(|queued| Arc::ptr_eq(&queued.ctx, &self.ctx))
                .map(|index| state.waiter_list.remove(index).expect("index from position"))
        };

        if let Some(queued) = removed {
            self.gate.complete_queued(queued, Status::Cancelled);
            trace!("cancel won the race");
        } else {
            trace!("cancel lost the race, context already serviced");
        }
    }

    /// Legal only post-completion. Reads the final outcome.
    pub fn status(&self) -> GateResult<Status> {
        self.ctx.status()
    }

    /// Legal only post-completion. Resets this context to `Initialized` so
    /// it can be recycled (e.g. returned to a [`PooledAllocator`](crate::pool::PooledAllocator)).
    ///
    /// Note this only resets the underlying `AsyncContext`; `owner_version`
    /// is fixed at construction (it is captured from the gate that created
    /// this context) and is not refreshed by reuse. A context reused after
    /// its gate has deactivated and reactivated will correctly observe the
    /// stale version and complete `ShutdownPending` on its next
    /// `start_acquire` (spec.md §8.3 scenario 6).
    pub fn reuse(&self) -> GateResult<()> {
        self.ctx.reuse()
    }

    /// Legal only post-completion. Resets the underlying [`AsyncContext`]
    /// to `Initialized` and returns it to `pool`, consuming `self` — this
    /// drops this acquire's back-reference to the gate, breaking the
    /// gate/acquire reference cycle spec.md §9 describes ("the cycle is
    /// broken at completion"). Pair with
    /// [`QuotaGate::create_acquire_context_pooled`].
    pub fn release_to_pool(self, pool: &PooledAllocator<Arc<AsyncContext>>) -> GateResult<()> {
        self.ctx.reuse()?;
        pool.free(self.ctx);
        Ok(())
    }

    /// Awaitable sugar: starts the acquire and resolves with its terminal
    /// status, built only from `AsyncContext::join` — no additional state.
    pub async fn acquire(&self, desired: u64) -> GateResult<Status> {
        self.start_acquire(desired, None, None)?;
        Ok(self.ctx.join().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scenario_single_acquire_below_available() {
        let gate = QuotaGate::create(0);
        gate.activate(10, None, None).unwrap();
        let a = gate.create_acquire_context().unwrap();

        let status = a.acquire(3).await.unwrap();
        assert_eq!(status, Status::Success);
        assert_eq!(gate.get_free_quanta(), 7);
    }

    #[tokio::test]
    async fn scenario_fifo_queuing() {
        let gate = QuotaGate::create(0);
        gate.activate(5, None, None).unwrap();

        let a = gate.create_acquire_context().unwrap();
        let b = gate.create_acquire_context().unwrap();
        let c = gate.create_acquire_context().unwrap();

        a.start_acquire(4, None, None).unwrap();
        b.start_acquire(3, None, None).unwrap();
        c.start_acquire(2, None, None).unwrap();

        assert_eq!(a.status().unwrap(), Status::Success);
        assert!(b.status().is_err());
        assert!(c.status().is_err());

        // free=1+4=5: head b needs 3 (5>=3, grant, free=2), new head c needs 2
        // (2>=2, grant, free=0) — a single release can drain the whole queue
        // in one pass of the §4.3.2 loop, it is not one-grant-per-release.
        gate.release(4);
        assert_eq!(b.status().unwrap(), Status::Success);
        assert_eq!(c.status().unwrap(), Status::Success);
        assert_eq!(gate.get_free_quanta(), 0);
    }

    #[tokio::test]
    async fn scenario_zero_desired_behind_large_acquire() {
        let gate = QuotaGate::create(0);
        gate.activate(0, None, None).unwrap();

        let a = gate.create_acquire_context().unwrap();
        let b = gate.create_acquire_context().unwrap();

        a.start_acquire(5, None, None).unwrap();
        b.start_acquire(0, None, None).unwrap();
        assert!(
            b.status().is_err(),
            "zero-desired must not complete ahead of a pending larger head"
        );

        gate.release(5);
        assert_eq!(a.status().unwrap(), Status::Success);
        assert_eq!(b.status().unwrap(), Status::Success);
    }

    #[tokio::test]
    async fn scenario_cancel_while_queued() {
        let gate = QuotaGate::create(0);
        gate.activate(0, None, None).unwrap();
        let a = gate.create_acquire_context().unwrap();

        a.start_acquire(5, None, None).unwrap();
        a.cancel();

        assert_eq!(a.status().unwrap(), Status::Cancelled);
        assert_eq!(gate.get_free_quanta(), 0);
    }

    #[tokio::test]
    async fn scenario_shutdown_drains_waiters() {
        let gate = QuotaGate::create(0);
        let fired = Arc::new(Mutex::new(false));
        let f = Arc::clone(&fired);
        gate.activate(
            0,
            None,
            Some(Box::new(move |status| {
                assert_eq!(status, Status::Success);
                *f.lock() = true;
            })),
        )
        .unwrap();

        let a = gate.create_acquire_context().unwrap();
        let b = gate.create_acquire_context().unwrap();
        a.start_acquire(5, None, None).unwrap();
        b.start_acquire(5, None, None).unwrap();

        gate.deactivate();

        assert_eq!(a.status().unwrap(), Status::ShutdownPending);
        assert_eq!(b.status().unwrap(), Status::ShutdownPending);

        tokio::task::yield_now().await;
        assert!(*fired.lock(), "activation callback fires after full drain");
    }

    #[tokio::test]
    async fn scenario_stale_reuse_across_versions() {
        let gate = QuotaGate::create(0);
        gate.activate(10, None, None).unwrap();
        let a = gate.create_acquire_context().unwrap();

        gate.deactivate();
        gate.reuse().unwrap();
        gate.activate(10, None, None).unwrap();

        a.start_acquire(1, None, None).unwrap();
        assert_eq!(a.status().unwrap(), Status::ShutdownPending);
        assert_eq!(gate.get_free_quanta(), 10);
    }

    #[tokio::test]
    async fn release_zero_is_a_no_op_wake() {
        let gate = QuotaGate::create(0);
        gate.activate(0, None, None).unwrap();
        gate.release(0);
        assert_eq!(gate.get_free_quanta(), 0);
    }

    #[tokio::test]
    async fn double_cancel_has_the_same_effect_as_one() {
        let gate = QuotaGate::create(0);
        gate.activate(0, None, None).unwrap();
        let a = gate.create_acquire_context().unwrap();
        a.start_acquire(5, None, None).unwrap();
        a.cancel();
        a.cancel();
        assert_eq!(a.status().unwrap(), Status::Cancelled);
    }

    #[tokio::test]
    async fn cancel_after_service_loop_already_granted_is_a_no_op() {
        let gate = QuotaGate::create(0);
        gate.activate(5, None, None).unwrap();
        let a = gate.create_acquire_context().unwrap();
        a.start_acquire(3, None, None).unwrap();
        assert_eq!(a.status().unwrap(), Status::Success);

        a.cancel();
        assert_eq!(a.status().unwrap(), Status::Success, "Success already won");
    }

    #[tokio::test]
    async fn create_acquire_context_fails_before_activation() {
        let gate = QuotaGate::create(0);
        let err = gate.create_acquire_context().unwrap_err();
        assert_eq!(err.as_status(), Status::InvalidState);
    }

    #[tokio::test]
    async fn acquire_context_round_trips_through_pooled_allocator() {
        let pool: PooledAllocator<Arc<AsyncContext>> =
            PooledAllocator::new(|| Ok(Arc::new(AsyncContext::new())), |_| {});

        let gate = QuotaGate::create(0);
        gate.activate(10, None, None).unwrap();

        let a = gate.create_acquire_context_pooled(&pool).unwrap();
        assert_eq!(a.acquire(4).await.unwrap(), Status::Success);
        assert_eq!(gate.get_free_quanta(), 6);
        a.release_to_pool(&pool).unwrap();
        assert_eq!(pool.count(), 1);

        // Recycled on the next pooled creation instead of allocating fresh.
        let b = gate.create_acquire_context_pooled(&pool).unwrap();
        assert_eq!(pool.count(), 0);
        assert_eq!(b.acquire(6).await.unwrap(), Status::Success);
        assert_eq!(gate.get_free_quanta(), 0);
    }

    #[tokio::test]
    async fn activate_deactivate_reuse_activate_behaves_like_fresh_gate() {
        let gate = QuotaGate::create(0);
        gate.activate(7, None, None).unwrap();
        gate.deactivate();
        gate.reuse().unwrap();
        gate.activate(7, None, None).unwrap();

        assert_eq!(gate.get_free_quanta(), 7);
        let a = gate.create_acquire_context().unwrap();
        assert_eq!(a.acquire(7).await.unwrap(), Status::Success);
        assert_eq!(gate.get_free_quanta(), 0);
    }
}
