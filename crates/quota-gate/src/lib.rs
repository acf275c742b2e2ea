//! A FIFO quantitative semaphore built on a cancellable, activity-counted
//! async context core, with a self-tuning lookaside pool for recycling the
//! contexts used to acquire from it.
//!
//! # Layering
//!
//! - [`context`] — [`AsyncContext`](context::AsyncContext), the cooperative
//!   state machine every operation in this crate rides on.
//! - [`pool`] — [`PooledAllocator`](pool::PooledAllocator), a bounded,
//!   self-tuning cache for recycling short-lived values at high allocation
//!   rates.
//! - [`gate`] — [`QuotaGate`](gate::QuotaGate) and
//!   [`AcquireContext`](gate::AcquireContext), the semaphore itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use quota_gate::{QuotaGate, Status};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let gate = QuotaGate::create(0);
//! gate.activate(10, None, None).unwrap();
//!
//! let ctx = gate.create_acquire_context().unwrap();
//! let status = ctx.acquire(3).await.unwrap();
//! assert_eq!(status, Status::Success);
//! assert_eq!(gate.get_free_quanta(), 7);
//!
//! gate.release(3);
//! gate.deactivate();
//! # }
//! ```

pub mod context;
pub mod error;
pub mod gate;
pub mod pool;

pub use context::{ActivityCounter, AsyncContext, CompletionCallback, ContextState};
pub use error::{GateError, GateResult, ResultExt, Status};
pub use gate::{AcquireContext, QuotaGate};
pub use pool::{PooledAllocator, PooledAllocatorBuilder};

#[cfg(feature = "config")]
pub use gate::QuotaGateConfig;
#[cfg(feature = "config")]
pub use pool::PooledAllocatorConfig;
