//! Request lifecycle machinery shared by the three lookup kinds.
//!
//! Every request is an isolated state machine behind one mutex. Work arrives
//! from three directions: the caller (`start`, `cancel`), the event engine
//! (timers, socket readiness), and the wrapped library (completion callbacks,
//! possibly fired inline from the very call that issued a query). Completion
//! callbacks only enqueue onto a per-request queue; the driver drains that
//! queue under the mutex after every call into the library, so an inline
//! completion can never re-enter the lock it was fired under.
//!
//! The user callback is published through [`EventEngine::run_later`], never
//! under the mutex and never inline from `start`: callers may hold their own
//! locks when they call into the driver, and deferring publication breaks the
//! inverse lock order.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::engine::{EventEngine, PolledFdFactory, TaskHandle};
use crate::error::ResolveError;
use crate::fd_set::{FdNode, FdSet};
use crate::host_port::split_host_port;
use crate::library::{
    Channel, ChannelOptions, LibraryError, ResolverLibrary, SocketHandle, GETSOCK_MAX,
};

mod hostname;
mod srv;
mod txt;

pub use hostname::HostnameRequest;
pub use srv::SrvRequest;
pub use txt::TxtRequest;

/// Period of the backup poll timer.
///
/// The wrapped library relies on being poked periodically; socket events
/// alone can miss its internal retry deadlines.
pub(crate) const BACKUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Entry point for constructing lookup requests.
///
/// Holds the three collaborators every request needs: the event engine to
/// schedule against, the wrapped resolver library, and the factory producing
/// poller adapters for the library's sockets.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use dns_driver::{DnsDriver, RequestOptions};
/// # fn demo(engine: Arc<dyn dns_driver::engine::EventEngine>,
/// #         library: Arc<dyn dns_driver::library::ResolverLibrary>,
/// #         fds: Arc<dyn dns_driver::engine::PolledFdFactory>) {
/// let driver = DnsDriver::new(engine, library, fds);
/// let request = driver
///     .hostname("example.com:443", RequestOptions::new())
///     .unwrap();
/// request.start(|outcome| println!("resolved: {outcome:?}"));
/// # }
/// ```
pub struct DnsDriver {
    engine: Arc<dyn EventEngine>,
    library: Arc<dyn ResolverLibrary>,
    polled_fd_factory: Arc<dyn PolledFdFactory>,
}

impl DnsDriver {
    /// Creates a driver from its three collaborators.
    pub fn new(
        engine: Arc<dyn EventEngine>,
        library: Arc<dyn ResolverLibrary>,
        polled_fd_factory: Arc<dyn PolledFdFactory>,
    ) -> Self {
        DnsDriver { engine, library, polled_fd_factory }
    }

    /// Creates a hostname request for `name` (`host[:port]`).
    ///
    /// Issues parallel A and AAAA queries and publishes the merged address
    /// list sorted by RFC 6724 destination preference.
    pub fn hostname(
        &self,
        name: &str,
        options: RequestOptions,
    ) -> Result<HostnameRequest, ResolveError> {
        HostnameRequest::create(self, name, options)
    }

    /// Creates an SRV request for `name`.
    pub fn srv(&self, name: &str, options: RequestOptions) -> Result<SrvRequest, ResolveError> {
        SrvRequest::create(self, name, options)
    }

    /// Creates a TXT (service config) request for `name`.
    pub fn txt(&self, name: &str, options: RequestOptions) -> Result<TxtRequest, ResolveError> {
        TxtRequest::create(self, name, options)
    }
}

/// Options accepted by the request factories.
///
/// All setters chain:
///
/// ```
/// # use dns_driver::RequestOptions;
/// # use std::time::Duration;
/// let options = RequestOptions::new()
///     .default_port(443)
///     .dns_server("127.0.0.1:5353")
///     .timeout(Duration::from_secs(10));
/// ```
pub struct RequestOptions {
    pub(crate) default_port: Option<u16>,
    pub(crate) dns_server: Option<String>,
    pub(crate) check_port: bool,
    pub(crate) timeout: Duration,
    pub(crate) ipv6_loopback: Option<bool>,
    pub(crate) configure_channel: Option<Arc<dyn Fn(&mut dyn Channel) + Send + Sync>>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            default_port: None,
            dns_server: None,
            check_port: true,
            timeout: Duration::ZERO,
            ipv6_loopback: None,
            configure_channel: None,
        }
    }
}

impl RequestOptions {
    /// Creates the default options: port required, no DNS-server override,
    /// no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Port to use when `name` does not carry one.
    pub fn default_port(mut self, port: u16) -> Self {
        self.default_port = Some(port);
        self
    }

    /// Queries this server instead of the library's configured ones.
    /// Accepts `ip`, `ip:port`, or `[ipv6]:port`; a bare IP defaults to
    /// port 53.
    pub fn dns_server(mut self, server: impl Into<String>) -> Self {
        self.dns_server = Some(server.into());
        self
    }

    /// Whether a port is required (from the name or `default_port`).
    /// Defaults to `true`.
    pub fn check_port(mut self, check_port: bool) -> Self {
        self.check_port = check_port;
        self
    }

    /// Overall resolution deadline. `Duration::ZERO` (the default) arms no
    /// deadline timer.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the runtime IPv6 loopback probe that decides whether a
    /// hostname request issues an AAAA sub-query.
    pub fn ipv6_loopback(mut self, available: bool) -> Self {
        self.ipv6_loopback = Some(available);
        self
    }

    /// Hook run against the freshly created channel before any query is
    /// issued.
    pub fn configure_channel(
        mut self,
        configure: impl Fn(&mut dyn Channel) + Send + Sync + 'static,
    ) -> Self {
        self.configure_channel = Some(Arc::new(configure));
        self
    }
}

/// The user callback, moved out at publish time.
pub(crate) type OnResolve<T> = Box<dyn FnOnce(Result<T, ResolveError>) + Send>;

/// Behavior that differs between the hostname, SRV, and TXT requests:
/// per-kind state and the handling of drained library completions.
pub(crate) trait Kind: Sized + Send + 'static {
    /// User-visible output of this request kind.
    type Output: Send + 'static;
    /// Payload carried by this kind's library completions.
    type Event: Send + 'static;
    /// Kind tag for trace output.
    const KIND: &'static str;

    /// Handles one completion drained from the queue, under the request
    /// mutex.
    fn handle_event(shared: &Shared<Self>, inner: &mut Inner<Self>, event: Self::Event);
}

pub(crate) struct Inner<K: Kind> {
    pub(crate) name: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) timeout: Duration,
    pub(crate) channel: Box<dyn Channel>,
    pub(crate) polled_fd_factory: Arc<dyn PolledFdFactory>,
    pub(crate) fd_set: FdSet,
    pub(crate) query_timeout: Option<TaskHandle>,
    pub(crate) backup_poll: Option<TaskHandle>,
    pub(crate) started: bool,
    pub(crate) shutting_down: bool,
    pub(crate) cancelled: bool,
    pub(crate) timed_out: bool,
    pub(crate) on_resolve: Option<OnResolve<K::Output>>,
    pub(crate) completions_tx: mpsc::Sender<K::Event>,
    completions_rx: mpsc::Receiver<K::Event>,
    pub(crate) state: K,
}

/// Reference-counted core of a request.
///
/// Each armed timer or readiness closure captures a strong `Arc` on this, so
/// a request started and then dropped by its caller stays alive until every
/// outstanding callback has drained.
pub(crate) struct Shared<K: Kind> {
    pub(crate) id: u64,
    weak_self: Weak<Shared<K>>,
    pub(crate) engine: Arc<dyn EventEngine>,
    pub(crate) library: Arc<dyn ResolverLibrary>,
    inner: Mutex<Inner<K>>,
}

impl<K: Kind> Shared<K> {
    pub(crate) fn create(
        driver: &DnsDriver,
        name: &str,
        options: &RequestOptions,
        state: K,
    ) -> Result<Arc<Self>, ResolveError> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let (host, port) = parse_name(name, options)?;
        let mut channel = driver
            .library
            .init(ChannelOptions { stay_open: true })
            .map_err(|e| ResolveError::Internal(format!("failed to init resolver channel: {e}")))?;
        if let Some(configure) = &options.configure_channel {
            configure(channel.as_mut());
        }
        if let Some(server) = &options.dns_server {
            let addr = parse_dns_server(server)?;
            tracing::trace!(target: "dns_driver", name, server = %addr, "using DNS server override");
            channel
                .set_servers(&[addr])
                .map_err(|e| ResolveError::Internal(format!("failed to set DNS server: {e}")))?;
        }
        let (completions_tx, completions_rx) = mpsc::channel();
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: "dns_driver", id, kind = K::KIND, name, host = %host, port, "request created");
        Ok(Arc::new_cyclic(|weak| Shared {
            id,
            weak_self: weak.clone(),
            engine: Arc::clone(&driver.engine),
            library: Arc::clone(&driver.library),
            inner: Mutex::new(Inner {
                name: name.to_string(),
                host,
                port,
                timeout: options.timeout,
                channel,
                polled_fd_factory: Arc::clone(&driver.polled_fd_factory),
                fd_set: FdSet::new(),
                query_timeout: None,
                backup_poll: None,
                started: false,
                shutting_down: false,
                cancelled: false,
                timed_out: false,
                on_resolve: None,
                completions_tx,
                completions_rx,
                state,
            }),
        }))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap()
    }

    fn strong(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("request outlives its armed callbacks")
    }

    /// Transitions to shutting-down if this call is the first to do so.
    ///
    /// Cancellation is silent: the user callback is never invoked. Returns
    /// `false` when the request already resolved, timed out, or was
    /// cancelled.
    pub(crate) fn cancel(&self) -> bool {
        let mut inner = self.lock();
        if inner.shutting_down {
            return false;
        }
        inner.shutting_down = true;
        inner.cancelled = true;
        tracing::trace!(target: "dns_driver", id = self.id, kind = K::KIND, "request cancelled");
        crate::trace_stacktrace();
        self.cancel_timers(&mut inner);
        Self::shutdown_polled_fds(&mut inner, ResolveError::Cancelled("resolution cancelled".into()));
        true
    }

    /// One pass of the socket-poll reconciliation cycle.
    ///
    /// Asks the library for its current socket interests, arms readiness
    /// callbacks for newly interested directions, and shuts down sockets the
    /// library no longer claims. A node with a callback still armed stays in
    /// the set until that callback drains.
    pub(crate) fn work(&self, inner: &mut Inner<K>) {
        let mut new_set = FdSet::new();
        if !inner.shutting_down {
            let interests = inner.channel.getsock();
            for interest in interests.into_iter().take(GETSOCK_MAX) {
                if !interest.readable && !interest.writable {
                    continue;
                }
                let mut node = match inner.fd_set.pop(interest.socket) {
                    Some(node) => node,
                    None => {
                        tracing::trace!(target: "dns_driver", id = self.id, fd = interest.socket, "new fd");
                        FdNode::new(
                            interest.socket,
                            inner.polled_fd_factory.new_polled_fd(interest.socket),
                        )
                    }
                };
                if interest.readable && !node.readable_registered {
                    tracing::trace!(target: "dns_driver", id = self.id, fd = node.socket, "notify read");
                    node.readable_registered = true;
                    let this = self.strong();
                    let socket = node.socket;
                    node.polled_fd
                        .register_readable(Box::new(move |status| this.on_readable(socket, status)));
                }
                if interest.writable && !node.writable_registered {
                    tracing::trace!(target: "dns_driver", id = self.id, fd = node.socket, "notify write");
                    node.writable_registered = true;
                    let this = self.strong();
                    let socket = node.socket;
                    node.polled_fd
                        .register_writable(Box::new(move |status| this.on_writable(socket, status)));
                }
                new_set.push(node);
            }
        }
        // Whatever remains was not returned by getsock and is no longer in
        // use by the library.
        while let Some(mut node) = inner.fd_set.pop_any() {
            if !node.already_shutdown {
                node.polled_fd
                    .shutdown(ResolveError::Cancelled("socket no longer in use".into()));
                node.already_shutdown = true;
            }
            if !node.readable_registered && !node.writable_registered {
                tracing::trace!(target: "dns_driver", id = self.id, fd = node.socket, "delete fd");
                drop(node);
            } else {
                new_set.push(node);
            }
        }
        inner.fd_set = new_set;
    }

    fn on_readable(&self, socket: SocketHandle, status: Result<(), ResolveError>) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        tracing::trace!(target: "dns_driver", id = self.id, fd = socket, status = ?status, "on_readable");
        crate::trace_stacktrace();
        {
            let node = inner
                .fd_set
                .get_mut(socket)
                .expect("fd node tracked while readable callback armed");
            debug_assert!(node.readable_registered);
            node.readable_registered = false;
        }
        if status.is_ok() && !inner.shutting_down {
            loop {
                inner.channel.process(Some(socket), None);
                let still_readable = inner
                    .fd_set
                    .get_mut(socket)
                    .map(|node| node.polled_fd.is_still_readable())
                    .unwrap_or(false);
                if !still_readable {
                    break;
                }
            }
        } else {
            // The fd was shut down (cancel, timeout) or errored. Cancelling
            // the channel fires every pending completion with a cancelled
            // status; the work cycle below cleans up remaining fds.
            inner.channel.cancel();
        }
        self.drain_completions(inner);
        self.work(inner);
    }

    fn on_writable(&self, socket: SocketHandle, status: Result<(), ResolveError>) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        tracing::trace!(target: "dns_driver", id = self.id, fd = socket, status = ?status, "on_writable");
        {
            let node = inner
                .fd_set
                .get_mut(socket)
                .expect("fd node tracked while writable callback armed");
            debug_assert!(node.writable_registered);
            node.writable_registered = false;
        }
        if status.is_ok() && !inner.shutting_down {
            inner.channel.process(None, Some(socket));
        } else {
            inner.channel.cancel();
        }
        self.drain_completions(inner);
        self.work(inner);
    }

    /// Arms the overall deadline (unless the timeout is zero) and the backup
    /// poll timer.
    pub(crate) fn start_timers(&self, inner: &mut Inner<K>) {
        if !inner.timeout.is_zero() {
            tracing::trace!(
                target: "dns_driver",
                id = self.id,
                timeout_ms = inner.timeout.as_millis() as u64,
                "arming query timeout"
            );
            let this = self.strong();
            inner.query_timeout = Some(
                self.engine
                    .run_after(inner.timeout, Box::new(move || this.on_query_timeout())),
            );
        }
        let this = self.strong();
        inner.backup_poll = Some(
            self.engine
                .run_after(BACKUP_POLL_INTERVAL, Box::new(move || this.on_backup_poll())),
        );
    }

    pub(crate) fn cancel_timers(&self, inner: &mut Inner<K>) {
        // A timer cancelled before firing drops its closure and with it the
        // reference that closure holds on this request.
        if let Some(handle) = inner.query_timeout.take() {
            let _ = self.engine.cancel(handle);
        }
        if let Some(handle) = inner.backup_poll.take() {
            let _ = self.engine.cancel(handle);
        }
    }

    fn on_query_timeout(&self) {
        let mut inner = self.lock();
        inner.query_timeout = None;
        tracing::trace!(
            target: "dns_driver",
            id = self.id,
            shutting_down = inner.shutting_down,
            "query timeout fired"
        );
        if !inner.shutting_down {
            inner.shutting_down = true;
            inner.timed_out = true;
            // No error is synthesized here: shutting the fds down routes
            // through channel.cancel, and the per-query cancelled
            // completions drive publication.
            Self::shutdown_polled_fds(
                &mut inner,
                ResolveError::DeadlineExceeded("query timeout elapsed".into()),
            );
        }
    }

    fn on_backup_poll(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.backup_poll = None;
        tracing::trace!(
            target: "dns_driver",
            id = self.id,
            shutting_down = inner.shutting_down,
            "backup poll fired"
        );
        if !inner.shutting_down {
            for idx in 0..inner.fd_set.len() {
                let node = inner.fd_set.node_at(idx);
                if !node.already_shutdown {
                    let socket = node.socket;
                    tracing::trace!(target: "dns_driver", id = self.id, fd = socket, "backup poll process");
                    inner.channel.process(Some(socket), Some(socket));
                }
            }
            self.drain_completions(inner);
            if !inner.shutting_down {
                let this = self.strong();
                inner.backup_poll = Some(
                    self.engine
                        .run_after(BACKUP_POLL_INTERVAL, Box::new(move || this.on_backup_poll())),
                );
            }
            self.work(inner);
        }
    }

    fn shutdown_polled_fds(inner: &mut Inner<K>, error: ResolveError) {
        for node in inner.fd_set.iter_mut() {
            if !node.already_shutdown {
                node.polled_fd.shutdown(error.clone());
                node.already_shutdown = true;
            }
        }
    }

    /// Drains completion events the library has queued, inline ones
    /// included. Runs under the request mutex.
    pub(crate) fn drain_completions(&self, inner: &mut Inner<K>) {
        while let Ok(event) = inner.completions_rx.try_recv() {
            K::handle_event(self, inner, event);
        }
    }

    /// Common tail of every `start`: drain anything the library completed
    /// inline, then enter the work cycle and arm timers unless an inline
    /// completion already published.
    pub(crate) fn after_seed(&self, inner: &mut Inner<K>) {
        self.drain_completions(inner);
        if !inner.shutting_down {
            self.work(inner);
            self.start_timers(inner);
        }
    }

    /// Ends the request's lifecycle: marks it shutting-down, cancels timers,
    /// and hands the user callback and outcome to the engine. Never invokes
    /// the callback under the mutex.
    pub(crate) fn publish(&self, inner: &mut Inner<K>, outcome: Result<K::Output, ResolveError>) {
        inner.shutting_down = true;
        self.cancel_timers(inner);
        if let Some(on_resolve) = inner.on_resolve.take() {
            tracing::trace!(target: "dns_driver", id = self.id, kind = K::KIND, ok = outcome.is_ok(), "publishing result");
            self.engine.run_later(Box::new(move || on_resolve(outcome)));
        }
    }
}

impl<K: Kind> Drop for Shared<K> {
    fn drop(&mut self) {
        tracing::trace!(target: "dns_driver", id = self.id, kind = K::KIND, "request destroyed");
    }
}

/// Maps a per-query library failure into the user-visible taxonomy.
///
/// A cancelled completion observed after the deadline fired surfaces as
/// `DeadlineExceeded`; the library cannot tell the two apart.
pub(crate) fn completion_error(
    qtype: &str,
    name: &str,
    err: LibraryError,
    timed_out: bool,
) -> ResolveError {
    let msg = format!("resolver library error qtype={qtype} name={name}: {err}");
    match err {
        LibraryError::NotFound => ResolveError::NotFound(msg),
        LibraryError::Cancelled if timed_out => ResolveError::DeadlineExceeded(msg),
        LibraryError::Cancelled => ResolveError::Cancelled(msg),
        LibraryError::Other(_) => ResolveError::Unknown(msg),
    }
}

fn parse_name(name: &str, options: &RequestOptions) -> Result<(String, u16), ResolveError> {
    let Some((host, port)) = split_host_port(name) else {
        return Err(ResolveError::InvalidArgument(format!(
            "unparseable host:port: {name:?}"
        )));
    };
    let port = port
        .map(|p| {
            p.parse::<u16>().map_err(|_| {
                ResolveError::InvalidArgument(format!("invalid port in name: {name:?}"))
            })
        })
        .transpose()?;
    let port = match port {
        Some(port) => port,
        None if options.check_port => match options.default_port {
            Some(default) => default,
            None => {
                return Err(ResolveError::InvalidArgument(format!(
                    "no port in name: {name:?}"
                )))
            }
        },
        None => 0,
    };
    Ok((host, port))
}

fn parse_dns_server(server: &str) -> Result<SocketAddr, ResolveError> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    Err(ResolveError::InvalidArgument(format!(
        "cannot parse authority {server}"
    )))
}

/// Future resolving to a request's outcome.
///
/// Returned by the `resolve` convenience methods. If the request is cancelled
/// (publication suppressed), the future resolves to
/// [`ResolveError::Cancelled`] once the request's callbacks drain.
#[cfg(feature = "tokio-engine")]
pub struct Resolution<T> {
    rx: tokio::sync::oneshot::Receiver<Result<T, ResolveError>>,
}

#[cfg(feature = "tokio-engine")]
impl<T> Resolution<T> {
    pub(crate) fn wire() -> (OnResolve<T>, Self)
    where
        T: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let on_resolve: OnResolve<T> = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        (on_resolve, Resolution { rx })
    }
}

#[cfg(feature = "tokio-engine")]
impl<T> std::future::Future for Resolution<T> {
    type Output = Result<T, ResolveError>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        use std::future::Future as _;
        match std::pin::Pin::new(&mut self.rx).poll(cx) {
            std::task::Poll::Ready(Ok(outcome)) => std::task::Poll::Ready(outcome),
            std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Err(
                ResolveError::Cancelled("request cancelled before completion".into()),
            )),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}
