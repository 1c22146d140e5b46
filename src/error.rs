//! Error types and handling for tideway operations.
//!
//! This module provides the crate-wide error type covering every failure mode
//! a caller can observe: lifecycle violations, bridged-operation collisions,
//! teardown misuse, and underlying system errors.

use thiserror::Error;

use crate::request::OpKind;

/// Result type alias for tideway operations.
///
/// This type alias simplifies function signatures throughout the crate by
/// providing a consistent error type while allowing different success types.
pub type Result<T> = std::result::Result<T, TidewayError>;

/// Error type for tideway operations.
///
/// Synchronous precondition failures (closed handle, busy bridge slot) are
/// returned at the call site; asynchronous failures arrive only through the
/// completion callback or future that belongs to the failed operation.
///
/// # Design Notes
///
/// - Uses `thiserror` for automatic `Error` trait implementation
/// - Provides automatic conversion from `std::io::Error` via `#[from]`
/// - End-of-stream is deliberately absent: it is a graceful terminal event,
///   not an error, and is surfaced as a completion notification instead
#[derive(Debug, Error)]
pub enum TidewayError {
    /// The handle has begun closing and accepts no further operations.
    ///
    /// Returned synchronously by every public operation once `close` has
    /// been requested, and used to resolve bridged futures that were still
    /// outstanding when their handle went away.
    #[error("Handle is closed")]
    HandleClosed,

    /// A bridged operation of this kind is already outstanding.
    ///
    /// At most one bridged operation per kind may be in flight on a given
    /// handle. The first operation is unaffected; retry after it resolves.
    #[error("{kind} operation already in progress")]
    OperationInProgress {
        /// Which single-flight slot was occupied.
        kind: OpKind,
    },

    /// The reactor still has pending requests.
    ///
    /// Dropping a reactor while requests are in flight would free leased
    /// transfer buffers out from under their continuations, so teardown
    /// refuses until every request has resolved.
    #[error("Reactor has {count} requests in flight")]
    RequestsInFlight {
        /// Number of requests still awaiting completion.
        count: usize,
    },

    /// Standard I/O error.
    ///
    /// Wraps errno-level failures from the poller and socket plumbing, and
    /// carries asynchronous native failure statuses after conversion.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TidewayError {
    /// `true` if this error reports a closed or closing handle.
    pub fn is_closed(&self) -> bool {
        matches!(self, TidewayError::HandleClosed)
    }
}

// The error type crosses thread boundaries even though the handles never do:
// callers commonly ship failures into channels or join handles.
static_assertions::assert_impl_all!(TidewayError: Send, Sync);
