//! Contract of the wrapped resolver library.
//!
//! The driver does not speak DNS on the wire. It drives an external,
//! callback-based resolver library that owns its own sockets and retry state.
//! [`ResolverLibrary`] creates per-request [`Channel`]s and parses raw
//! replies; the driver's job is to poll the channel's sockets through the
//! event engine and to pump [`Channel::process`] at the right moments.
//!
//! Completion callbacks handed to a channel may be invoked *inline*, from
//! within the very call that issued the query (trivially-bad input is the
//! usual case) or from within [`Channel::process`] / [`Channel::cancel`].
//! Implementations must treat them as fire-once and `Send`.

use std::net::IpAddr;
use std::net::SocketAddr;

use crate::record::SrvRecord;

/// Identifier of a socket owned by the wrapped library.
///
/// The library creates and closes these sockets itself; the driver only
/// registers them with the event engine and hands them back to
/// [`Channel::process`].
pub type SocketHandle = i32;

/// Upper bound on the number of sockets [`Channel::getsock`] reports.
pub const GETSOCK_MAX: usize = 16;

/// Address family of a hostname sub-query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4 (an `A` query).
    V4,
    /// IPv6 (an `AAAA` query).
    V6,
}

/// DNS class of a raw query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsClass {
    /// The Internet class.
    In,
}

/// DNS record type of a raw query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsType {
    /// Service location records.
    Srv,
    /// Text records.
    Txt,
}

/// One socket the library currently wants monitored, with its per-direction
/// interest.
#[derive(Clone, Copy, Debug)]
pub struct SocketInterest {
    /// The socket to monitor.
    pub socket: SocketHandle,
    /// The library wants to be told when this socket is readable.
    pub readable: bool,
    /// The library wants to be told when this socket is writable.
    pub writable: bool,
}

/// Options for [`ResolverLibrary::init`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelOptions {
    /// Keep the channel's sockets open between queries.
    pub stay_open: bool,
}

/// One TXT rdata segment as produced by [`ResolverLibrary::parse_txt_reply_ext`].
///
/// A TXT value longer than one rdata segment is split across consecutive
/// chunks; only the first carries `record_start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxtChunk {
    /// True when this chunk begins a new TXT record.
    pub record_start: bool,
    /// Raw rdata bytes of this segment.
    pub data: Vec<u8>,
}

/// Per-query failure reported by the wrapped library.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LibraryError {
    /// The name does not exist or has no matching records.
    #[error("host not found")]
    NotFound,
    /// The query was cancelled before completing.
    #[error("query cancelled")]
    Cancelled,
    /// Any other library failure, carrying the library's message.
    #[error("{0}")]
    Other(String),
}

/// Completion callback for [`Channel::gethostbyname`].
pub type HostDoneCallback = Box<dyn FnOnce(Result<Vec<IpAddr>, LibraryError>) + Send>;

/// Completion callback for [`Channel::query`] and [`Channel::search`],
/// carrying the raw reply buffer.
pub type QueryDoneCallback = Box<dyn FnOnce(Result<Vec<u8>, LibraryError>) + Send>;

/// A resolver library the driver can wrap.
///
/// Mirrors the init/parse surface of a callback-based resolver; the per-
/// request state lives in the [`Channel`] it creates.
pub trait ResolverLibrary: Send + Sync {
    /// Creates a per-request channel.
    fn init(&self, options: ChannelOptions) -> Result<Box<dyn Channel>, LibraryError>;

    /// Parses a raw SRV reply into records, in reply order.
    fn parse_srv_reply(&self, buf: &[u8]) -> Result<Vec<SrvRecord>, LibraryError>;

    /// Parses a raw TXT reply into rdata chunks, flagging record starts.
    fn parse_txt_reply_ext(&self, buf: &[u8]) -> Result<Vec<TxtChunk>, LibraryError>;
}

/// Per-request resolver state: in-flight queries, servers, retry timers, and
/// the sockets backing them.
///
/// Dropping the channel destroys that state; the library closes its own
/// sockets.
pub trait Channel: Send {
    /// Overrides the servers this channel queries.
    fn set_servers(&mut self, servers: &[SocketAddr]) -> Result<(), LibraryError>;

    /// Issues an address lookup for `host` in the given family. `on_done`
    /// may be invoked inline.
    fn gethostbyname(&mut self, host: &str, family: AddressFamily, on_done: HostDoneCallback);

    /// Issues a raw query for `name`. `on_done` may be invoked inline.
    fn query(&mut self, name: &str, class: DnsClass, qtype: DnsType, on_done: QueryDoneCallback);

    /// Like [`Channel::query`], but applies the library's search-domain
    /// rules to `name`.
    fn search(&mut self, name: &str, class: DnsClass, qtype: DnsType, on_done: QueryDoneCallback);

    /// Reports the sockets the library currently wants monitored, at most
    /// [`GETSOCK_MAX`] of them.
    fn getsock(&mut self) -> Vec<SocketInterest>;

    /// Advances the library's state machine. Either side may be `None`;
    /// passing a socket asserts that direction is ready on it. Completions
    /// may fire inline from this call.
    fn process(&mut self, read: Option<SocketHandle>, write: Option<SocketHandle>);

    /// Forces every pending completion on this channel to fire with
    /// [`LibraryError::Cancelled`].
    fn cancel(&mut self);
}
