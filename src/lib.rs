#![deny(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

/*!
Asynchronous driver adapting a callback-driven DNS resolver library to a
pollable event engine.

# Introduction

Some resolver libraries do not speak futures. They own their sockets, run
their own retry state machine, and expect their caller to find out which
sockets they currently care about, watch those sockets, and call back in
whenever one becomes ready. This crate is the machinery around such a
library: it polls the library's socket set through an [event
engine](engine::EventEngine), pumps the library on readiness and on a backup
timer, applies an overall deadline, and delivers each lookup's single result
through a deferred callback or a future.

Three lookup kinds are provided:

- [`HostnameRequest`]: parallel A and AAAA sub-queries, merged and sorted by
  RFC 6724 destination preference ([`sort`]);
- [`SrvRequest`]: SRV records for the load-balancer service name;
- [`TxtRequest`]: the service-config attribute, reassembled across TXT
  rdata chunks.

```no_run
# use std::sync::Arc;
# use dns_driver::{DnsDriver, RequestOptions};
# fn demo(engine: Arc<dyn dns_driver::engine::EventEngine>,
#         library: Arc<dyn dns_driver::library::ResolverLibrary>,
#         fds: Arc<dyn dns_driver::engine::PolledFdFactory>) {
let driver = DnsDriver::new(engine, library, fds);
let request = driver
    .hostname("example.com:443", RequestOptions::new().timeout(std::time::Duration::from_secs(5)))
    .unwrap();
request.start(|outcome| match outcome {
    Ok(addresses) => println!("resolved: {addresses:?}"),
    Err(error) => eprintln!("failed: {error}"),
});
# }
```

A request may be [cancelled](HostnameRequest::cancel) at any time;
cancellation is silent (the callback is never invoked) and returns whether
this call was the one that shut the request down.

# Collaborators

The wrapped resolver library and the event engine are trait contracts
([`library`], [`engine`]), so any callback-based resolver and any pollable
event loop can host a request. The `tokio-engine` feature (default) ships a
tokio-backed engine and polled-fd adapter in [`engine::tokio`].

# Tracing

Diagnostics go through [`tracing`] under three targets: `dns_driver`
(lifecycle and socket activity), `dns_driver::address_sorting` (verbatim
input/output of the RFC 6724 sort), and `dns_driver::stacktrace` (backtrace
captures at lifecycle transitions).
*/

mod error;
pub use error::ResolveError;

mod record;
pub use record::SrvRecord;

mod request;
#[cfg(feature = "tokio-engine")]
pub use request::Resolution;
pub use request::{DnsDriver, HostnameRequest, RequestOptions, SrvRequest, TxtRequest};

pub mod engine;
pub mod library;
pub mod sort;

mod fd_set;
mod host_port;

/// Logs the current backtrace when the stacktrace target is enabled.
pub(crate) fn trace_stacktrace() {
    if tracing::enabled!(target: "dns_driver::stacktrace", tracing::Level::TRACE) {
        tracing::trace!(
            target: "dns_driver::stacktrace",
            backtrace = %std::backtrace::Backtrace::force_capture()
        );
    }
}
