//! Standalone loom model of the quota gate's two core concurrency claims:
//!
//! 1. An activity counter that reaches zero exactly once, and triggers its
//!    zero-callback exactly once, no matter how releases interleave with the
//!    final `deactivate`-driven release (spec.md §9 "Activity counting vs.
//!    ref-counting").
//! 2. A head-of-queue completion race between the service loop (driven by
//!    `release`) and an explicit `cancel`: whichever one observes the waiter
//!    still linked wins, and the other becomes a no-op (spec.md §4.3.2
//!    "Concurrent release and cancel of the same head context").
//!
//! This crate does not depend on `quota-gate` — it models the same shapes
//! with loom's instrumented primitives so the model checker can explore
//! every interleaving, the way `nebula-storage-loom-probe` models the
//! credential refresh-claim CAS in isolation rather than pulling in the
//! whole storage crate.
#![cfg_attr(not(loom), allow(dead_code))]

#[cfg(loom)]
use loom::sync::Mutex;
#[cfg(loom)]
use loom::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

#[cfg(not(loom))]
use std::sync::Mutex;
#[cfg(not(loom))]
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use std::sync::Arc;

/// Minimal model of `AsyncContext`'s activity count: increments for every
/// outstanding child, and a `fired` latch that must flip exactly once when
/// the count drops to zero.
pub struct ActivityCounter {
    count: AtomicI64,
    fired: AtomicUsize,
}

impl ActivityCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: AtomicI64::new(0),
            fired: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` if this release is the one that observed zero.
    pub fn release(&self) -> bool {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        prev - 1 == 0
    }

    /// Marks the zero-callback as fired. Returns the previous fired count —
    /// a model assertion fails if this is ever called with a value other
    /// than 0 already observed (i.e. double-fire).
    pub fn mark_fired(&self) -> usize {
        self.fired.fetch_add(1, Ordering::AcqRel)
    }
}

impl Default for ActivityCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal model of a single head-of-queue waiter: `linked` models presence
/// in the gate's waiter list; whichever of `try_complete_from_service` /
/// `try_complete_from_cancel` observes `linked == true` and flips it to
/// `false` wins, modeling spec.md's "cancel wins only if it observes the
/// context still linked" rule.
pub struct Waiter {
    linked: Mutex<bool>,
    completions: AtomicUsize,
}

impl Waiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            linked: Mutex::new(true),
            completions: AtomicUsize::new(0),
        }
    }

    /// Returns `true` if this call won the race and should run the
    /// completion (Success from service, or Cancelled from cancel).
    fn try_unlink(&self) -> bool {
        let mut linked = self.linked.lock().unwrap();
        if *linked {
            *linked = false;
            true
        } else {
            false
        }
    }

    pub fn try_complete_from_service(&self) -> bool {
        if self.try_unlink() {
            self.completions.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    pub fn try_complete_from_cancel(&self) -> bool {
        if self.try_unlink() {
            self.completions.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::Acquire)
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::thread;

    #[test]
    fn activity_counter_fires_exactly_once() {
        loom::model(|| {
            let counter = Arc::new(ActivityCounter::new());
            counter.acquire();
            counter.acquire();

            let fired_count = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..2)
                .map(|_| {
                    let counter = Arc::clone(&counter);
                    let fired_count = Arc::clone(&fired_count);
                    thread::spawn(move || {
                        if counter.release() {
                            fired_count.fetch_add(1, Ordering::AcqRel);
                            counter.mark_fired();
                        }
                    })
                })
                .collect();

            for t in threads {
                t.join().unwrap();
            }

            assert_eq!(fired_count.load(Ordering::Acquire), 1);
        });
    }

    #[test]
    fn head_of_queue_race_has_exactly_one_winner() {
        loom::model(|| {
            let waiter = Arc::new(Waiter::new());

            let service = {
                let waiter = Arc::clone(&waiter);
                thread::spawn(move || waiter.try_complete_from_service())
            };
            let cancel = {
                let waiter = Arc::clone(&waiter);
                thread::spawn(move || waiter.try_complete_from_cancel())
            };

            let service_won = service.join().unwrap();
            let cancel_won = cancel.join().unwrap();

            assert_ne!(service_won, cancel_won, "exactly one side must win the race");
            assert_eq!(waiter.completions(), 1);
        });
    }
}
