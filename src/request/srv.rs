//! SRV lookups for the load-balancer service name.

use std::sync::Arc;

use crate::error::ResolveError;
use crate::library::{DnsClass, DnsType, LibraryError};
use crate::record::SrvRecord;

use super::{completion_error, DnsDriver, Inner, Kind, RequestOptions, Shared};

/// Service prefix queried for SRV records.
const SRV_SERVICE_PREFIX: &str = "_grpclb._tcp.";

pub(crate) struct SrvQuery {
    /// Full query name, `_grpclb._tcp.<host>`.
    service_name: String,
}

impl Kind for SrvQuery {
    type Output = Vec<SrvRecord>;
    type Event = Result<Vec<u8>, LibraryError>;
    const KIND: &'static str = "srv";

    fn handle_event(shared: &Shared<Self>, inner: &mut Inner<Self>, event: Self::Event) {
        if inner.cancelled {
            return;
        }
        match event {
            Err(err) => {
                let error = completion_error("SRV", &inner.state.service_name, err, inner.timed_out);
                tracing::trace!(target: "dns_driver", id = shared.id, error = %error, "SRV query failed");
                shared.publish(inner, Err(error));
            }
            Ok(buf) => {
                // A reply that fails to parse publishes an empty record list.
                let records = shared.library.parse_srv_reply(&buf).unwrap_or_default();
                tracing::trace!(
                    target: "dns_driver",
                    id = shared.id,
                    name = %inner.state.service_name,
                    count = records.len(),
                    "SRV query succeeded"
                );
                shared.publish(inner, Ok(records));
            }
        }
    }
}

/// An in-flight SRV lookup.
///
/// Created by [`DnsDriver::srv`]. Queries `_grpclb._tcp.<host>` and publishes
/// the records in the order the reply parser produced them.
pub struct SrvRequest {
    shared: Arc<Shared<SrvQuery>>,
}

impl SrvRequest {
    pub(crate) fn create(
        driver: &DnsDriver,
        name: &str,
        options: RequestOptions,
    ) -> Result<Self, ResolveError> {
        let state = SrvQuery { service_name: String::new() };
        Ok(SrvRequest { shared: Shared::create(driver, name, &options, state)? })
    }

    /// Begins the lookup. May be called at most once.
    ///
    /// A `localhost` target is not queried; an error describing the skip is
    /// published instead.
    pub fn start(
        &self,
        on_resolve: impl FnOnce(Result<Vec<SrvRecord>, ResolveError>) + Send + 'static,
    ) {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let inner = &mut *guard;
        assert!(!inner.started, "start may only be called once");
        inner.started = true;
        inner.on_resolve = Some(Box::new(on_resolve));
        if inner.host.eq_ignore_ascii_case("localhost") {
            shared.publish(
                inner,
                Err(ResolveError::Unknown(
                    "Skip querying for SRV records for localhost target".into(),
                )),
            );
            return;
        }
        inner.state.service_name = format!("{SRV_SERVICE_PREFIX}{}", inner.host);
        tracing::trace!(
            target: "dns_driver",
            id = shared.id,
            name = %inner.state.service_name,
            "starting SRV query"
        );
        let tx = inner.completions_tx.clone();
        inner.channel.query(
            &inner.state.service_name,
            DnsClass::In,
            DnsType::Srv,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
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
    pub fn resolve(&self) -> super::Resolution<Vec<SrvRecord>> {
        let (on_resolve, resolution) = super::Resolution::wire();
        self.start(move |outcome| on_resolve(outcome));
        resolution
    }
}
