//! Hostname resolution: parallel A and AAAA sub-queries merged into one
//! sorted result.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::{Arc, OnceLock};

use crate::error::ResolveError;
use crate::library::{AddressFamily, LibraryError};
use crate::sort;

use super::{completion_error, DnsDriver, Inner, Kind, RequestOptions, Shared};

/// Whether this host can bind the IPv6 loopback, probed once per process.
/// Decides whether an AAAA sub-query is worth issuing at all.
fn ipv6_loopback_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| UdpSocket::bind(("::1", 0)).is_ok())
}

pub(crate) struct HostnameQuery {
    /// In-flight sub-queries. Incremented *before* each query is issued so an
    /// inline completion cannot drive it to zero and publish prematurely.
    pending_queries: usize,
    /// Addresses accumulated across sub-queries, in arrival order until the
    /// final sort.
    result: Vec<SocketAddr>,
    /// Child errors merged across sub-queries; surfaced only when `result`
    /// stays empty.
    error: Option<ResolveError>,
    ipv6_loopback: Option<bool>,
}

impl Kind for HostnameQuery {
    type Output = Vec<SocketAddr>;
    type Event = (&'static str, Result<Vec<IpAddr>, LibraryError>);
    const KIND: &'static str = "hostname";

    fn handle_event(shared: &Shared<Self>, inner: &mut Inner<Self>, event: Self::Event) {
        let (qtype, outcome) = event;
        match outcome {
            Ok(addrs) => {
                tracing::trace!(
                    target: "dns_driver",
                    id = shared.id,
                    qtype,
                    host = %inner.host,
                    count = addrs.len(),
                    "sub-query succeeded"
                );
                crate::trace_stacktrace();
                for ip in addrs {
                    let addr = SocketAddr::new(ip, inner.port);
                    tracing::trace!(target: "dns_driver", id = shared.id, qtype, %addr, "resolved address");
                    inner.state.result.push(addr);
                }
            }
            Err(err) => {
                let err = completion_error(qtype, &inner.host, err, inner.timed_out);
                tracing::trace!(target: "dns_driver", id = shared.id, qtype, error = %err, "sub-query failed");
                crate::trace_stacktrace();
                inner.state.error = Some(match inner.state.error.take() {
                    Some(prev) => prev.merge(err),
                    None => err,
                });
            }
        }
        debug_assert!(inner.state.pending_queries > 0);
        inner.state.pending_queries -= 1;
        if inner.state.pending_queries > 0 {
            return;
        }
        if inner.cancelled {
            // Cancellation is silent; the drained completion only balanced
            // the query count.
            return;
        }
        if !inner.state.result.is_empty() {
            // Records win over a child error from the other sub-query.
            log_address_list(shared.id, "input", &inner.state.result);
            sort::rfc6724_sort(&mut inner.state.result);
            log_address_list(shared.id, "output", &inner.state.result);
            let result = std::mem::take(&mut inner.state.result);
            shared.publish(inner, Ok(result));
        } else {
            let error = inner
                .state
                .error
                .take()
                .expect("an empty result implies at least one sub-query error");
            shared.publish(inner, Err(error));
        }
    }
}

fn log_address_list(id: u64, direction: &str, addrs: &[SocketAddr]) {
    if !tracing::enabled!(target: "dns_driver::address_sorting", tracing::Level::TRACE) {
        return;
    }
    for (index, addr) in addrs.iter().enumerate() {
        tracing::trace!(
            target: "dns_driver::address_sorting",
            id,
            direction,
            index,
            addr = %addr,
            precedence = sort::precedence(&addr.ip()),
            label = sort::label(&addr.ip()),
            "address sorting"
        );
    }
}

/// An in-flight hostname lookup.
///
/// Created by [`DnsDriver::hostname`]. Resolves the request's host to a list
/// of socket addresses carrying the request port, ordered by RFC 6724
/// destination preference. An IPv4/IPv6 literal resolves without touching
/// the wrapped library.
pub struct HostnameRequest {
    shared: Arc<Shared<HostnameQuery>>,
}

impl std::fmt::Debug for HostnameRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostnameRequest")
            .field("id", &self.shared.id)
            .finish()
    }
}

impl HostnameRequest {
    pub(crate) fn create(
        driver: &DnsDriver,
        name: &str,
        options: RequestOptions,
    ) -> Result<Self, ResolveError> {
        let state = HostnameQuery {
            pending_queries: 0,
            result: Vec::new(),
            error: None,
            ipv6_loopback: options.ipv6_loopback,
        };
        Ok(HostnameRequest { shared: Shared::create(driver, name, &options, state)? })
    }

    /// Begins resolution. May be called at most once.
    ///
    /// `on_resolve` is always dispatched through the engine, never invoked
    /// from inside this call, IP literals and inline library completions
    /// included.
    pub fn start(
        &self,
        on_resolve: impl FnOnce(Result<Vec<SocketAddr>, ResolveError>) + Send + 'static,
    ) {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let inner = &mut *guard;
        assert!(!inner.started, "start may only be called once");
        inner.started = true;
        inner.on_resolve = Some(Box::new(on_resolve));
        tracing::trace!(
            target: "dns_driver",
            id = shared.id,
            name = %inner.name,
            "starting hostname resolution"
        );
        // Early out for IP literals: no library traffic, no timers.
        if let Ok(ip) = inner.host.parse::<IpAddr>() {
            let addr = SocketAddr::new(ip, inner.port);
            tracing::trace!(target: "dns_driver", id = shared.id, %addr, "resolved as IP literal");
            shared.publish(inner, Ok(vec![addr]));
            return;
        }
        // Pre-increment, then issue: the library may invoke a completion
        // inline for trivially-bad input, and the count reaching zero
        // publishes.
        inner.state.pending_queries += 1;
        if inner.state.ipv6_loopback.unwrap_or_else(ipv6_loopback_available) {
            inner.state.pending_queries += 1;
            let tx = inner.completions_tx.clone();
            inner.channel.gethostbyname(
                &inner.host,
                AddressFamily::V6,
                Box::new(move |outcome| {
                    let _ = tx.send(("AAAA", outcome));
                }),
            );
        }
        let tx = inner.completions_tx.clone();
        inner.channel.gethostbyname(
            &inner.host,
            AddressFamily::V4,
            Box::new(move |outcome| {
                let _ = tx.send(("A", outcome));
            }),
        );
        shared.after_seed(inner);
    }

    /// Cancels the lookup. Returns `true` iff this call effected the
    /// transition to shutting-down; `on_resolve` will then never be invoked.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    /// Starts the request and returns its outcome as a future.
    #[cfg(feature = "tokio-engine")]
    pub fn resolve(&self) -> super::Resolution<Vec<SocketAddr>> {
        let (on_resolve, resolution) = super::Resolution::wire();
        self.start(move |outcome| on_resolve(outcome));
        resolution
    }
}
