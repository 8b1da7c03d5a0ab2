//! Event engine and polled-fd adapter backed by the tokio runtime.
//!
//! [`TokioEngine`] schedules closures and timers onto a runtime handle;
//! [`TokioPolledFdFactory`] bridges library-owned sockets to the runtime's
//! reactor through [`AsyncFd`]. The adapter never closes a wrapped socket;
//! the library owns it and closes it itself.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::engine::{Closure, EventEngine, FdCallback, PolledFd, PolledFdFactory, TaskHandle};
use crate::error::ResolveError;
use crate::library::SocketHandle;

/// First-claim gate deciding whether a timer fires or is cancelled.
struct TimerClaim(AtomicBool);

impl TimerClaim {
    fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct TimerEntry {
    claim: Arc<TimerClaim>,
    abort: tokio::task::AbortHandle,
}

/// [`EventEngine`] implementation over a tokio runtime handle.
///
/// `run_later` spawns the closure as a task; `run_after` sleeps and then
/// races an atomic claim against [`cancel`], so `cancel` reports exactly
/// whether the closure was stopped before running.
///
/// [`cancel`]: EventEngine::cancel
pub struct TokioEngine {
    handle: Handle,
    weak: Weak<TokioEngine>,
    timers: Mutex<HashMap<u64, TimerEntry>>,
    next_id: AtomicU64,
}

impl TokioEngine {
    /// Creates an engine scheduling onto `handle`.
    pub fn new(handle: Handle) -> Arc<Self> {
        Arc::new_cyclic(|weak| TokioEngine {
            handle,
            weak: weak.clone(),
            timers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Creates an engine scheduling onto the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Arc<Self> {
        Self::new(Handle::current())
    }
}

impl EventEngine for TokioEngine {
    fn run_later(&self, closure: Closure) {
        self.handle.spawn(async move { closure() });
    }

    fn run_after(&self, delay: Duration, closure: Closure) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let claim = Arc::new(TimerClaim(AtomicBool::new(false)));
        let task_claim = Arc::clone(&claim);
        let weak = self.weak.clone();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if task_claim.claim() {
                if let Some(engine) = weak.upgrade() {
                    engine.timers.lock().unwrap().remove(&id);
                }
                closure();
            }
        });
        let mut timers = self.timers.lock().unwrap();
        // A zero-delay timer may have fired before this insert; the claim
        // check under the map lock keeps fired entries out of the map.
        if !claim.claimed() {
            timers.insert(id, TimerEntry { claim, abort: join.abort_handle() });
        }
        TaskHandle(id)
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        let entry = self.timers.lock().unwrap().remove(&handle.0);
        match entry {
            Some(entry) => {
                if entry.claim.claim() {
                    // Aborting the sleeping task drops the closure and any
                    // references it captured.
                    entry.abort.abort();
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }
}

/// Socket handle lent to the adapter; closing it is the library's business.
struct BorrowedSocket(SocketHandle);

impl AsRawFd for BorrowedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// [`PolledFdFactory`] producing [`AsyncFd`]-backed adapters.
pub struct TokioPolledFdFactory {
    handle: Handle,
}

impl TokioPolledFdFactory {
    /// Creates a factory registering sockets with `handle`'s reactor.
    pub fn new(handle: Handle) -> Self {
        TokioPolledFdFactory { handle }
    }

    /// Creates a factory registering sockets with the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl PolledFdFactory for TokioPolledFdFactory {
    fn new_polled_fd(&self, socket: SocketHandle) -> Box<dyn PolledFd> {
        Box::new(TokioPolledFd::new(socket, self.handle.clone()))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

struct FdState {
    socket: SocketHandle,
    handle: Handle,
    // None when reactor registration failed; registrations then complete
    // immediately with an error.
    async_fd: Option<AsyncFd<BorrowedSocket>>,
    shutdown_tx: watch::Sender<Option<ResolveError>>,
}

impl FdState {
    fn shutdown_reason(&self) -> ResolveError {
        self.shutdown_tx
            .borrow()
            .clone()
            .unwrap_or_else(|| ResolveError::Cancelled("socket shut down".into()))
    }

    async fn wait(&self, direction: Direction) -> Result<(), ResolveError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        {
            let current = shutdown_rx.borrow_and_update();
            if let Some(error) = current.clone() {
                return Err(error);
            }
        }
        let Some(async_fd) = &self.async_fd else {
            return Err(ResolveError::Internal(
                "failed to register socket with the reactor".into(),
            ));
        };
        match direction {
            Direction::Read => tokio::select! {
                _ = shutdown_rx.changed() => Err(self.shutdown_reason()),
                ready = async_fd.readable() => match ready {
                    Ok(mut guard) => {
                        guard.clear_ready();
                        Ok(())
                    }
                    Err(e) => Err(ResolveError::Internal(format!("socket poll error: {e}"))),
                },
            },
            Direction::Write => tokio::select! {
                _ = shutdown_rx.changed() => Err(self.shutdown_reason()),
                ready = async_fd.writable() => match ready {
                    Ok(mut guard) => {
                        guard.clear_ready();
                        Ok(())
                    }
                    Err(e) => Err(ResolveError::Internal(format!("socket poll error: {e}"))),
                },
            },
        }
    }
}

/// One-shot readiness adapter over [`AsyncFd`].
struct TokioPolledFd {
    state: Arc<FdState>,
}

impl TokioPolledFd {
    fn new(socket: SocketHandle, handle: Handle) -> Self {
        let guard = handle.enter();
        let async_fd = match AsyncFd::new(BorrowedSocket(socket)) {
            Ok(fd) => Some(fd),
            Err(e) => {
                tracing::warn!(target: "dns_driver", fd = socket, error = %e, "reactor registration failed");
                None
            }
        };
        drop(guard);
        let (shutdown_tx, _) = watch::channel(None);
        TokioPolledFd {
            state: Arc::new(FdState { socket, handle, async_fd, shutdown_tx }),
        }
    }

    fn register(&self, direction: Direction, callback: FdCallback) {
        let state = Arc::clone(&self.state);
        self.state.handle.spawn(async move {
            let outcome = state.wait(direction).await;
            callback(outcome);
        });
    }
}

impl PolledFd for TokioPolledFd {
    fn register_readable(&self, callback: FdCallback) {
        self.register(Direction::Read, callback);
    }

    fn register_writable(&self, callback: FdCallback) {
        self.register(Direction::Write, callback);
    }

    fn is_still_readable(&self) -> bool {
        let mut available: libc::c_int = 0;
        // SAFETY: FIONREAD writes the queued byte count into `available` and
        // touches nothing else.
        let rc = unsafe { libc::ioctl(self.state.socket, libc::FIONREAD, &mut available) };
        rc == 0 && available > 0
    }

    fn shutdown(&self, error: ResolveError) {
        self.state.shutdown_tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(error);
                true
            }
        });
    }

    fn wrapped_socket(&self) -> SocketHandle {
        self.state.socket
    }
}
