//! Error taxonomy shared by synchronous returns and URB completion statuses.

use thiserror::Error;

/// Errors surfaced by the host controller, either synchronously to a caller or as the completion
/// status of a URB.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HcdError {
    /// The controller is not running, or the addressed port has no peer attached.
    #[error("no device attached at the addressed port")]
    NoDevice,

    /// The URB pipe names an endpoint that was never built for the active configuration.
    #[error("no such endpoint")]
    NoSuchEndpoint,

    /// The peer handle vanished while the request was being dispatched, or the peer stalled.
    #[error("broken pipe")]
    BrokenPipe,

    /// Link pool, heap or transport resources are exhausted.
    #[error("out of memory")]
    OutOfMemory,

    /// The URB was cancelled before it could complete.
    #[error("URB cancelled")]
    Cancelled,

    /// A transfer timed out inside the bus core. The controller never produces it itself: an
    /// unanswered control request is resent rather than failed.
    #[error("request timed out")]
    Timeout,

    /// The request itself is malformed (bad endpoint number, missing SETUP packet, ...).
    #[error("invalid request")]
    InvalidRequest,

    /// The URB is already being unlinked.
    #[error("URB is already being unlinked")]
    Busy,

    /// The URB is no longer linked to an endpoint (it already completed).
    #[error("URB is not linked to an endpoint")]
    NotLinked,
}

pub type HcdResult<T> = Result<T, HcdError>;

/// Completion status handed to the bus core together with a finished URB.
pub type UrbStatus = HcdResult<()>;
