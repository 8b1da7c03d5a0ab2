//! Contract of the event engine the driver schedules against.
//!
//! The driver never blocks and never spawns threads of its own. Deferred
//! work, timers, and socket readiness all go through these traits, so any
//! pollable event loop can host a request. A tokio-backed implementation
//! ships behind the `tokio-engine` feature.

use std::time::Duration;

use crate::error::ResolveError;
use crate::library::SocketHandle;

#[cfg(feature = "tokio-engine")]
pub mod tokio;

/// Handle to a timer armed with [`EventEngine::run_after`].
///
/// Opaque to the driver; engines key their own timer state off it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(
    /// Engine-assigned timer key.
    pub u64,
);

/// Closure scheduled onto the engine.
pub type Closure = Box<dyn FnOnce() + Send>;

/// Readiness callback armed on a [`PolledFd`].
///
/// Runs on the engine. `Err` means the fd was shut down rather than becoming
/// ready.
pub type FdCallback = Box<dyn FnOnce(Result<(), ResolveError>) + Send>;

/// An event loop that can run closures, arm one-shot timers, and cancel
/// them.
pub trait EventEngine: Send + Sync {
    /// Schedules `closure` to run soon, outside the caller's locks.
    fn run_later(&self, closure: Closure);

    /// Arms a one-shot timer firing `closure` after `delay`.
    fn run_after(&self, delay: Duration, closure: Closure) -> TaskHandle;

    /// Attempts to cancel a timer. Returns `true` iff the timer was cancelled
    /// before firing; `false` means the closure ran or is about to run.
    fn cancel(&self, handle: TaskHandle) -> bool;
}

/// Adapter bridging one library-owned socket to the engine's readiness
/// notifications.
///
/// Registrations are one-shot: each armed callback fires exactly once, either
/// with `Ok(())` when the direction becomes ready or with `Err` after
/// [`shutdown`]. The adapter never closes the wrapped socket; the library
/// owns it.
///
/// [`shutdown`]: PolledFd::shutdown
pub trait PolledFd: Send {
    /// Arms a one-shot read-readiness wake.
    fn register_readable(&self, callback: FdCallback);

    /// Arms a one-shot write-readiness wake.
    fn register_writable(&self, callback: FdCallback);

    /// Non-blocking probe: does the socket have queued inbound bytes right
    /// now? Distinct from the readiness hint delivered to callbacks.
    fn is_still_readable(&self) -> bool;

    /// Shuts the adapter down. Idempotent. Pending and future registrations
    /// fire promptly with `Err` carrying `error`.
    fn shutdown(&self, error: ResolveError);

    /// The wrapped socket handle.
    fn wrapped_socket(&self) -> SocketHandle;
}

/// Factory producing [`PolledFd`] adapters, supplied by the embedding caller.
pub trait PolledFdFactory: Send + Sync {
    /// Wraps a library-owned socket in a poller adapter.
    fn new_polled_fd(&self, socket: SocketHandle) -> Box<dyn PolledFd>;
}
