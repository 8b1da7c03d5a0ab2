//! Errors surfaced to users of the driver.

/// Errors produced while creating or resolving a request.
///
/// Request construction fails with [`InvalidArgument`] or [`Internal`];
/// resolution failures carry the wrapped library's message with query
/// context. Cancellation via [`cancel`] is silent and never surfaces here;
/// [`Cancelled`] appears only when a resolution future is abandoned before
/// completion.
///
/// [`InvalidArgument`]: ResolveError::InvalidArgument
/// [`Internal`]: ResolveError::Internal
/// [`Cancelled`]: ResolveError::Cancelled
/// [`cancel`]: crate::HostnameRequest::cancel
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The request name, port, or DNS-server override could not be parsed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The wrapped resolver library failed to initialize.
    #[error("internal error: {0}")]
    Internal(String),
    /// The queried name does not exist or has no matching records.
    #[error("not found: {0}")]
    NotFound(String),
    /// Any other per-query failure reported by the wrapped library.
    #[error("{0}")]
    Unknown(String),
    /// The resolution was cancelled before a result was published.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// The overall query timeout elapsed before the lookup completed.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

impl ResolveError {
    /// Folds another error into this one, child-error style.
    ///
    /// Same-kind errors concatenate their messages; mixed kinds collapse into
    /// [`ResolveError::Unknown`] carrying both renderings.
    pub(crate) fn merge(self, other: ResolveError) -> ResolveError {
        use ResolveError::*;
        match (self, other) {
            (InvalidArgument(a), InvalidArgument(b)) => InvalidArgument(format!("{a}; {b}")),
            (Internal(a), Internal(b)) => Internal(format!("{a}; {b}")),
            (NotFound(a), NotFound(b)) => NotFound(format!("{a}; {b}")),
            (Unknown(a), Unknown(b)) => Unknown(format!("{a}; {b}")),
            (Cancelled(a), Cancelled(b)) => Cancelled(format!("{a}; {b}")),
            (DeadlineExceeded(a), DeadlineExceeded(b)) => DeadlineExceeded(format!("{a}; {b}")),
            (a, b) => Unknown(format!("{a}; {b}")),
        }
    }
}
