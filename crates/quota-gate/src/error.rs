//! The core's error taxonomy and small `Result` ergonomics built on top of it.

use std::fmt;

/// Terminal outcome of an [`AsyncContext`](crate::context::AsyncContext) or
/// anything built on one (an [`AcquireContext`](crate::gate::AcquireContext),
/// a gate's own activation context).
///
/// A context's `status` is set exactly once, on the transition into
/// `Completed`, and is one of these five values for the lifetime of the
/// crate — there is no open-ended "custom" variant, because every failure
/// this core can produce is one of these contractual codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Status {
    /// The operation completed normally.
    #[error("success")]
    Success,

    /// An explicit `cancel()` won the race with the service loop.
    #[error("cancelled")]
    Cancelled,

    /// The gate was not active (or stopped being active) when the operation
    /// was queued or attempted.
    #[error("shutdown pending")]
    ShutdownPending,

    /// A host allocator (the pooled allocator's factory, or the system
    /// allocator behind it) failed to produce a value.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// The API was called from a state that does not permit it (e.g. `start`
    /// on an already-Operational context, `reuse` on a non-Completed one).
    #[error("invalid state")]
    InvalidState,
}

impl Status {
    /// `true` for [`Status::Success`], `false` for every other outcome.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Error surface for the fallible, synchronous parts of the API — the small
/// set of calls the spec allows to fail before a context even begins its
/// asynchronous life (`start_acquire`'s `InvalidState` guard,
/// `create_acquire_context` before activation, allocator factory failures).
///
/// Asynchronous outcomes never use this type: they are delivered as a
/// [`Status`] through the context's completion callback, per the core's
/// contract that "all other failures are delivered via the context's
/// completion."
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The call was made from a state that forbids it.
    #[error("invalid state: {0}")]
    InvalidState(Status),

    /// The pooled allocator's factory failed to produce a value.
    #[error("allocator exhausted: {message}")]
    ResourceExhausted {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

impl GateError {
    /// The [`Status`] this error would surface as, for callers bridging a
    /// synchronous failure into a context's terminal status.
    #[must_use]
    pub const fn as_status(&self) -> Status {
        match self {
            Self::InvalidState(_) => Status::InvalidState,
            Self::ResourceExhausted { .. } => Status::ResourceExhausted,
        }
    }
}

/// `Result` alias for the crate's fallible synchronous operations.
pub type GateResult<T> = Result<T, GateError>;

/// Extension trait bridging an arbitrary fallible factory or destructor
/// (e.g. a pooled allocator's `T`-producing closure) into [`GateError`].
///
/// Mirrors the `with_context` / `into_*` shape of a resilience-style
/// `ResultExt`, trimmed to the two conversions this core actually needs:
/// wrapping a foreign error as `ResourceExhausted`, and attaching a
/// human-readable label to it.
pub trait ResultExt<T> {
    /// Converts any error into [`GateError::ResourceExhausted`], preserving
    /// it as the source.
    fn into_gate_error(self) -> GateResult<T>;

    /// Like [`ResultExt::into_gate_error`], but labels the failure with a
    /// caller-supplied description (e.g. which factory call failed).
    fn with_context<C, F>(self, f: F) -> GateResult<T>
    where
        C: fmt::Display,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_gate_error(self) -> GateResult<T> {
        self.map_err(|e| GateError::ResourceExhausted {
            message: e.to_string(),
            source: Some(Box::new(e)),
        })
    }

    fn with_context<C, F>(self, f: F) -> GateResult<T>
    where
        C: fmt::Display,
        F: FnOnce() -> C,
    {
        self.map_err(|e| GateError::ResourceExhausted {
            message: format!("{}: {e}", f()),
            source: Some(Box::new(e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_success_only_for_success() {
        assert!(Status::Success.is_success());
        assert!(!Status::Cancelled.is_success());
        assert!(!Status::ShutdownPending.is_success());
        assert!(!Status::ResourceExhausted.is_success());
        assert!(!Status::InvalidState.is_success());
    }

    #[test]
    fn gate_error_maps_to_expected_status() {
        assert_eq!(
            GateError::InvalidState(Status::InvalidState).as_status(),
            Status::InvalidState
        );
        let err = GateError::ResourceExhausted {
            message: "boom".into(),
            source: None,
        };
        assert_eq!(err.as_status(), Status::ResourceExhausted);
    }

    #[test]
    fn result_ext_wraps_foreign_errors() {
        let res: Result<(), std::io::Error> =
            Err(std::io::Error::other("disk full"));
        let wrapped = res.with_context(|| "allocating pooled T");
        assert!(matches!(wrapped, Err(GateError::ResourceExhausted { .. })));
    }
}
