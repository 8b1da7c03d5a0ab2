//! TXT lookups for the service-config attribute.

use std::sync::Arc;

use crate::error::ResolveError;
use crate::library::{DnsClass, DnsType, LibraryError, TxtChunk};

use super::{completion_error, DnsDriver, Inner, Kind, RequestOptions, Shared};

/// Name prefix queried for the service config.
const CONFIG_NAME_PREFIX: &str = "_grpc_config.";

/// Attribute prefix identifying the service-config TXT record.
const SERVICE_CONFIG_ATTRIBUTE_PREFIX: &str = "grpc_config=";

pub(crate) struct TxtQuery {
    /// Full query name, `_grpc_config.<host>`.
    config_name: String,
}

/// Reassembles the service config from TXT rdata chunks.
///
/// The first record-start chunk whose data begins with `grpc_config=` wins;
/// its prefix is stripped, and immediately following chunks that are
/// continuations of the same record (not flagged as a record start) are
/// concatenated, since a long TXT value arrives split across 255-byte rdata
/// segments. Returns the empty string when no chunk matches.
pub(crate) fn reassemble_service_config(chunks: &[TxtChunk]) -> String {
    let prefix = SERVICE_CONFIG_ATTRIBUTE_PREFIX.as_bytes();
    let Some(start) = chunks
        .iter()
        .position(|chunk| chunk.record_start && chunk.data.starts_with(prefix))
    else {
        return String::new();
    };
    let mut config = chunks[start].data[prefix.len()..].to_vec();
    for chunk in &chunks[start + 1..] {
        if chunk.record_start {
            break;
        }
        config.extend_from_slice(&chunk.data);
    }
    String::from_utf8_lossy(&config).into_owned()
}

impl Kind for TxtQuery {
    type Output = String;
    type Event = Result<Vec<u8>, LibraryError>;
    const KIND: &'static str = "txt";

    fn handle_event(shared: &Shared<Self>, inner: &mut Inner<Self>, event: Self::Event) {
        if inner.cancelled {
            return;
        }
        let parsed = event.and_then(|buf| shared.library.parse_txt_reply_ext(&buf));
        match parsed {
            Err(err) => {
                let error = completion_error("TXT", &inner.state.config_name, err, inner.timed_out);
                tracing::trace!(target: "dns_driver", id = shared.id, error = %error, "TXT query failed");
                shared.publish(inner, Err(error));
            }
            Ok(chunks) => {
                let config = reassemble_service_config(&chunks);
                tracing::trace!(
                    target: "dns_driver",
                    id = shared.id,
                    name = %inner.state.config_name,
                    config = %config,
                    "TXT query succeeded"
                );
                shared.publish(inner, Ok(config));
            }
        }
    }
}

/// An in-flight TXT (service config) lookup.
///
/// Created by [`DnsDriver::txt`]. Queries `_grpc_config.<host>` through the
/// library's search-domain rules and publishes the reassembled
/// `grpc_config=` attribute value, possibly empty.
pub struct TxtRequest {
    shared: Arc<Shared<TxtQuery>>,
}

impl TxtRequest {
    pub(crate) fn create(
        driver: &DnsDriver,
        name: &str,
        options: RequestOptions,
    ) -> Result<Self, ResolveError> {
        let state = TxtQuery { config_name: String::new() };
        Ok(TxtRequest { shared: Shared::create(driver, name, &options, state)? })
    }

    /// Begins the lookup. May be called at most once.
    ///
    /// A `localhost` target is not queried; an error describing the skip is
    /// published instead.
    pub fn start(&self, on_resolve: impl FnOnce(Result<String, ResolveError>) + Send + 'static) {
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
                    "Skip querying for TXT records for localhost target".into(),
                )),
            );
            return;
        }
        inner.state.config_name = format!("{CONFIG_NAME_PREFIX}{}", inner.host);
        tracing::trace!(
            target: "dns_driver",
            id = shared.id,
            name = %inner.state.config_name,
            "starting TXT query"
        );
        let tx = inner.completions_tx.clone();
        inner.channel.search(
            &inner.state.config_name,
            DnsClass::In,
            DnsType::Txt,
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
    pub fn resolve(&self) -> super::Resolution<String> {
        let (on_resolve, resolution) = super::Resolution::wire();
        self.start(move |outcome| on_resolve(outcome));
        resolution
    }
}
