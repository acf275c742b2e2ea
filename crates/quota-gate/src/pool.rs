//! A size-adaptive lookaside cache for recycling short-lived, expensive-to-
//! construct values — principally [`AcquireContext`](crate::gate::AcquireContext)
//! instances, which are created and released at extremely high rates.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{GateError, GateResult, Status};

/// Threshold below which traffic is "low" and `target_depth` only decays
/// (klookaside.h's `SmallDeltaAllocationsThreshold`).
const SMALL_TRAFFIC_THRESHOLD: u64 = 75;
/// Amount `target_depth` decays per rebalance under low traffic
/// (`SmallDeltaAllocationsAdjustment`). Undocumented in the source; the
/// value is reproduced exactly rather than guessed at (spec.md §9).
const SMALL_DELTA_ADJUSTMENT: usize = 10;
/// Miss-rate threshold in parts per thousand below which `target_depth`
/// decays by one (`MissedVsCachedAllocationThresholdPercentage`). The
/// source's comment calls this "0.5%" while the constant is the integer 5,
/// i.e. 5 per mille — the literal value is preserved, not the comment's
/// reading of it (spec.md §9 "possible source bugs").
const MISS_RATE_THRESHOLD_PER_MILLE: u64 = 5;
/// Floor added to the computed growth delta (`MinLargeMissedCachedThreshold`).
const GROWTH_DELTA_FLOOR: u64 = 5;
/// Ceiling on the growth delta in one rebalance (`MaxLargeMissedCachedThreshold`).
const GROWTH_DELTA_CEILING: u64 = 30;
/// Divisor in the growth formula.
const GROWTH_DIVISOR: u64 = 2000;

const DEFAULT_MIN_DEPTH: usize = 4;
const DEFAULT_MAX_DEPTH: usize = 256;
const DEFAULT_BALANCE_INTERVAL: Duration = Duration::from_millis(3000);

type Factory<T> = Box<dyn Fn() -> GateResult<T> + Send + Sync>;
type Destructor<T> = Box<dyn Fn(T) + Send + Sync>;

struct Inner<T> {
    free_list: Vec<T>,
    target_depth: usize,
    total_allocates: u64,
    total_misses: u64,
    next_balance_tick: Instant,
}

/// A bounded, self-tuning cache of reusable `T` sitting in front of a
/// factory/destructor pair. All operations are thread-safe; the factory and
/// destructor are always invoked outside the allocator's lock (spec.md §9
/// "Allocator factory/destructor under lock").
pub struct PooledAllocator<T> {
    inner: Mutex<Inner<T>>,
    factory: Factory<T>,
    destructor: Destructor<T>,
    min_depth: usize,
    max_depth: usize,
    balance_interval: Duration,
}

impl<T> std::fmt::Debug for PooledAllocator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PooledAllocator")
            .field("free_list_len", &inner.free_list.len())
            .field("target_depth", &inner.target_depth)
            .field("min_depth", &self.min_depth)
            .field("max_depth", &self.max_depth)
            .finish_non_exhaustive()
    }
}

impl<T> PooledAllocator<T> {
    fn new_raw(
        min_depth: usize,
        max_depth: usize,
        balance_interval: Duration,
        factory: Factory<T>,
        destructor: Destructor<T>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                free_list: Vec::with_capacity(max_depth),
                target_depth: min_depth,
                total_allocates: 0,
                total_misses: 0,
                next_balance_tick: Instant::now() + balance_interval,
            }),
            factory,
            destructor,
            min_depth,
            max_depth,
            balance_interval,
        }
    }

    /// Convenience constructor with the source's defaults
    /// (`min_depth=4, max_depth=256, balance_interval=3s`, `KLookaside<T>::Create`).
    pub fn new<F, D>(factory: F, destructor: D) -> Self
    where
        F: Fn() -> GateResult<T> + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        Self::new_raw(
            DEFAULT_MIN_DEPTH,
            DEFAULT_MAX_DEPTH,
            DEFAULT_BALANCE_INTERVAL,
            Box::new(factory),
            Box::new(destructor),
        )
    }

    fn maybe_rebalance(&self, inner: &mut Inner<T>) {
        let now = Instant::now();
        if now < inner.next_balance_tick {
            return;
        }
        let before = inner.target_depth;
        inner.target_depth = Self::adjust_depth(
            inner.target_depth,
            inner.total_allocates,
            inner.total_misses,
            self.min_depth,
            self.max_depth,
        );
        trace!(
            before,
            after = inner.target_depth,
            total_allocates = inner.total_allocates,
            total_misses = inner.total_misses,
            "pool rebalanced"
        );
        inner.total_allocates = 0;
        inner.total_misses = 0;
        inner.next_balance_tick = now + self.balance_interval;
    }

    /// The exact adaptive-depth algorithm of spec.md §4.1.
    fn adjust_depth(
        target_depth: usize,
        total_allocates: u64,
        total_misses: u64,
        min_depth: usize,
        max_depth: usize,
    ) -> usize {
        if total_allocates < SMALL_TRAFFIC_THRESHOLD {
            return target_depth
                .saturating_sub(SMALL_DELTA_ADJUSTMENT)
                .max(min_depth);
        }

        let miss_rate_per_mille = (total_misses * 1000) / total_allocates;

        if miss_rate_per_mille < MISS_RATE_THRESHOLD_PER_MILLE {
            return target_depth.saturating_sub(1).max(min_depth);
        }

        let headroom = max_depth.saturating_sub(target_depth) as u64;
        let delta = ((miss_rate_per_mille * headroom) / GROWTH_DIVISOR + GROWTH_DELTA_FLOOR)
            .min(GROWTH_DELTA_CEILING) as usize;
        (target_depth + delta).min(max_depth)
    }

    /// Under lock: rebalance if due, count the allocate, pop a cached value
    /// if one exists. Otherwise drop the lock and call the factory — an
    /// empty result here means only the factory itself failed.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn allocate(&self) -> GateResult<T> {
        {
            let mut inner = self.inner.lock();
            self.maybe_rebalance(&mut inner);
            inner.total_allocates += 1;
            if let Some(value) = inner.free_list.pop() {
                trace!("pool hit");
                return Ok(value);
            }
            inner.total_misses += 1;
        }
        debug!("pool miss, calling factory");
        (self.factory)()
    }

    /// Under lock: rebalance if due. If the free list has room under
    /// `target_depth`, push and return. Otherwise drop the lock and call the
    /// destructor — this path never fails once a value reaches `free`.
    #[tracing::instrument(skip(self, value), level = "debug")]
    pub fn free(&self, value: T) {
        let overflow = {
            let mut inner = self.inner.lock();
            self.maybe_rebalance(&mut inner);
            if inner.free_list.len() < inner.target_depth {
                inner.free_list.push(value);
                None
            } else {
                Some(value)
            }
        };
        if let Some(value) = overflow {
            trace!("pool at target depth, destroying");
            (self.destructor)(value);
        }
    }

    /// Destroys every cached value via the destructor and empties the list.
    pub fn clear(&self) {
        let drained: Vec<T> = {
            let mut inner = self.inner.lock();
            inner.free_list.drain(..).collect()
        };
        for value in drained {
            (self.destructor)(value);
        }
    }

    /// Current free-list length.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Current target depth — mostly useful for tests and diagnostics.
    #[must_use]
    pub fn target_depth(&self) -> usize {
        self.inner.lock().target_depth
    }
}

/// Builder for [`PooledAllocator`], mirroring the `with_*` chain style
/// `CircuitBreakerConfig` uses.
pub struct PooledAllocatorBuilder {
    min_depth: usize,
    max_depth: usize,
    balance_interval: Duration,
}

impl Default for PooledAllocatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PooledAllocatorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            min_depth: DEFAULT_MIN_DEPTH,
            max_depth: DEFAULT_MAX_DEPTH,
            balance_interval: DEFAULT_BALANCE_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_min_depth(mut self, min_depth: usize) -> Self {
        self.min_depth = min_depth;
        self
    }

    #[must_use]
    pub const fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    #[must_use]
    pub const fn with_balance_interval(mut self, balance_interval: Duration) -> Self {
        self.balance_interval = balance_interval;
        self
    }

    /// Applies a loaded [`PooledAllocatorConfig`] on top of this builder's
    /// defaults.
    #[cfg(feature = "config")]
    #[must_use]
    pub fn with_config(self, config: &PooledAllocatorConfig) -> Self {
        self.with_min_depth(config.min_depth)
            .with_max_depth(config.max_depth)
            .with_balance_interval(config.balance_interval)
    }

    pub fn build<T, F, D>(self, factory: F, destructor: D) -> GateResult<PooledAllocator<T>>
    where
        F: Fn() -> GateResult<T> + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        if self.min_depth > self.max_depth {
            return Err(GateError::InvalidState(Status::InvalidState));
        }
        Ok(PooledAllocator::new_raw(
            self.min_depth,
            self.max_depth,
            self.balance_interval,
            Box::new(factory),
            Box::new(destructor),
        ))
    }
}

/// Externally loadable depth-tuning configuration for a [`PooledAllocator`],
/// gated behind the `config` feature the way `nebula-resilience` gates
/// optional integrations behind their own Cargo features. The gate itself
/// carries no equivalent tunables — its only parameter, initial free quanta,
/// is a call argument, not configuration.
#[cfg(feature = "config")]
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PooledAllocatorConfig {
    pub min_depth: usize,
    pub max_depth: usize,
    #[serde(with = "humantime_serde")]
    pub balance_interval: Duration,
}

#[cfg(feature = "config")]
impl Default for PooledAllocatorConfig {
    fn default() -> Self {
        Self {
            min_depth: DEFAULT_MIN_DEPTH,
            max_depth: DEFAULT_MAX_DEPTH,
            balance_interval: DEFAULT_BALANCE_INTERVAL,
        }
    }
}
