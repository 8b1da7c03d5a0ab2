//! Deterministic test doubles for the driver's collaborators: an event
//! engine with virtual time and an explicit run queue, a scriptable resolver
//! library, and polled-fd adapters whose readiness the test controls.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dns_driver::engine::{
    Closure, EventEngine, FdCallback, PolledFd, PolledFdFactory, TaskHandle,
};
use dns_driver::library::{
    AddressFamily, Channel, ChannelOptions, DnsClass, DnsType, HostDoneCallback, LibraryError,
    QueryDoneCallback, ResolverLibrary, SocketHandle, SocketInterest, TxtChunk,
};
use dns_driver::{DnsDriver, ResolveError, SrvRecord};

/// Event engine with virtual time. Closures never run inside engine calls;
/// tests pump them explicitly with [`MockEngine::run_all`] or
/// [`MockEngine::advance`].
pub struct MockEngine {
    inner: Mutex<EngineInner>,
}

struct EngineInner {
    now: Duration,
    ready: VecDeque<Closure>,
    timers: BTreeMap<u64, MockTimer>,
    next_id: u64,
}

struct MockTimer {
    deadline: Duration,
    closure: Closure,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(MockEngine {
            inner: Mutex::new(EngineInner {
                now: Duration::ZERO,
                ready: VecDeque::new(),
                timers: BTreeMap::new(),
                next_id: 1,
            }),
        })
    }

    /// Runs queued closures (including ones they enqueue) until none remain.
    pub fn run_all(&self) {
        loop {
            let closure = self.inner.lock().unwrap().ready.pop_front();
            match closure {
                Some(closure) => closure(),
                None => break,
            }
        }
    }

    /// Advances virtual time, queues timers that came due in deadline order,
    /// and runs the queue dry.
    pub fn advance(&self, by: Duration) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.now += by;
            let now = inner.now;
            let mut due: Vec<(Duration, u64)> = inner
                .timers
                .iter()
                .filter(|(_, timer)| timer.deadline <= now)
                .map(|(id, timer)| (timer.deadline, *id))
                .collect();
            due.sort();
            for (_, id) in due {
                let timer = inner.timers.remove(&id).unwrap();
                inner.ready.push_back(timer.closure);
            }
        }
        self.run_all();
    }

    /// Number of timers currently armed.
    pub fn armed_timers(&self) -> usize {
        self.inner.lock().unwrap().timers.len()
    }

    /// Absolute virtual deadlines of the armed timers, ascending.
    pub fn armed_deadlines(&self) -> Vec<Duration> {
        let inner = self.inner.lock().unwrap();
        let mut deadlines: Vec<Duration> = inner.timers.values().map(|t| t.deadline).collect();
        deadlines.sort();
        deadlines
    }
}

impl EventEngine for MockEngine {
    fn run_later(&self, closure: Closure) {
        self.inner.lock().unwrap().ready.push_back(closure);
    }

    fn run_after(&self, delay: Duration, closure: Closure) -> TaskHandle {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        let deadline = inner.now + delay;
        inner.timers.insert(id, MockTimer { deadline, closure });
        TaskHandle(id)
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        self.inner.lock().unwrap().timers.remove(&handle.0).is_some()
    }
}

#[derive(Default)]
struct FdEntry {
    read_cb: Option<FdCallback>,
    write_cb: Option<FdCallback>,
    shutdown: Option<ResolveError>,
    still_readable: bool,
}

/// Registry of mock fd adapters. Readiness fires only when a test triggers
/// it; shutdown delivers pending callbacks through the engine, as the real
/// adapter does.
pub struct MockFds {
    engine: Arc<dyn EventEngine>,
    state: Mutex<HashMap<SocketHandle, FdEntry>>,
}

impl MockFds {
    pub fn new(engine: Arc<dyn EventEngine>) -> Arc<Self> {
        Arc::new(MockFds { engine, state: Mutex::new(HashMap::new()) })
    }

    /// Fires the armed read callback with `Ok` through the engine. Returns
    /// whether a callback was armed.
    pub fn trigger_readable(&self, socket: SocketHandle) -> bool {
        let callback = self
            .state
            .lock()
            .unwrap()
            .get_mut(&socket)
            .and_then(|entry| entry.read_cb.take());
        match callback {
            Some(callback) => {
                self.engine.run_later(Box::new(move || callback(Ok(()))));
                true
            }
            None => false,
        }
    }

    /// Fires the armed write callback with `Ok` through the engine.
    pub fn trigger_writable(&self, socket: SocketHandle) -> bool {
        let callback = self
            .state
            .lock()
            .unwrap()
            .get_mut(&socket)
            .and_then(|entry| entry.write_cb.take());
        match callback {
            Some(callback) => {
                self.engine.run_later(Box::new(move || callback(Ok(()))));
                true
            }
            None => false,
        }
    }

    /// The status this socket's adapter was shut down with, if any.
    pub fn shutdown_status(&self, socket: SocketHandle) -> Option<ResolveError> {
        self.state
            .lock()
            .unwrap()
            .get(&socket)
            .and_then(|entry| entry.shutdown.clone())
    }

    /// Whether (read, write) callbacks are currently armed on this socket.
    pub fn registered(&self, socket: SocketHandle) -> (bool, bool) {
        let state = self.state.lock().unwrap();
        match state.get(&socket) {
            Some(entry) => (entry.read_cb.is_some(), entry.write_cb.is_some()),
            None => (false, false),
        }
    }

    /// Makes [`PolledFd::is_still_readable`] report `value` for this socket.
    pub fn set_still_readable(&self, socket: SocketHandle, value: bool) {
        self.state.lock().unwrap().entry(socket).or_default().still_readable = value;
    }
}

/// Factory handing out adapters backed by a [`MockFds`] registry.
pub struct MockFdFactory {
    fds: Arc<MockFds>,
}

impl MockFdFactory {
    pub fn new(fds: Arc<MockFds>) -> Self {
        MockFdFactory { fds }
    }
}

impl PolledFdFactory for MockFdFactory {
    fn new_polled_fd(&self, socket: SocketHandle) -> Box<dyn PolledFd> {
        self.fds.state.lock().unwrap().entry(socket).or_default();
        Box::new(MockPolledFd { socket, fds: Arc::clone(&self.fds) })
    }
}

struct MockPolledFd {
    socket: SocketHandle,
    fds: Arc<MockFds>,
}

impl PolledFd for MockPolledFd {
    fn register_readable(&self, callback: FdCallback) {
        let mut state = self.fds.state.lock().unwrap();
        let entry = state.entry(self.socket).or_default();
        if let Some(error) = entry.shutdown.clone() {
            drop(state);
            self.fds.engine.run_later(Box::new(move || callback(Err(error))));
            return;
        }
        entry.read_cb = Some(callback);
    }

    fn register_writable(&self, callback: FdCallback) {
        let mut state = self.fds.state.lock().unwrap();
        let entry = state.entry(self.socket).or_default();
        if let Some(error) = entry.shutdown.clone() {
            drop(state);
            self.fds.engine.run_later(Box::new(move || callback(Err(error))));
            return;
        }
        entry.write_cb = Some(callback);
    }

    fn is_still_readable(&self) -> bool {
        self.fds
            .state
            .lock()
            .unwrap()
            .get(&self.socket)
            .map(|entry| entry.still_readable)
            .unwrap_or(false)
    }

    fn shutdown(&self, error: ResolveError) {
        let (read_cb, write_cb) = {
            let mut state = self.fds.state.lock().unwrap();
            let entry = state.entry(self.socket).or_default();
            if entry.shutdown.is_some() {
                return;
            }
            entry.shutdown = Some(error.clone());
            (entry.read_cb.take(), entry.write_cb.take())
        };
        if let Some(callback) = read_cb {
            let error = error.clone();
            self.fds.engine.run_later(Box::new(move || callback(Err(error))));
        }
        if let Some(callback) = write_cb {
            self.fds.engine.run_later(Box::new(move || callback(Err(error))));
        }
    }

    fn wrapped_socket(&self) -> SocketHandle {
        self.socket
    }
}

/// How a scripted reply is delivered.
#[derive(Clone, Copy)]
pub enum ReplyMode {
    /// The completion fires inline from the issuing call.
    Inline,
    /// The completion fires when the channel is processed on this socket.
    OnSocket(SocketHandle),
}

#[derive(Default)]
struct LibState {
    host_replies: HashMap<(String, AddressFamily), (ReplyMode, Result<Vec<IpAddr>, LibraryError>)>,
    query_replies: HashMap<String, (ReplyMode, Result<Vec<u8>, LibraryError>)>,
    srv_parse: Option<Result<Vec<SrvRecord>, LibraryError>>,
    txt_parse: Option<Result<Vec<TxtChunk>, LibraryError>>,
    init_error: Option<LibraryError>,
    set_servers_error: Option<LibraryError>,
    deliver_on_process: bool,
    issued: Vec<String>,
    servers: Vec<SocketAddr>,
    channels_created: usize,
    stay_open: Vec<bool>,
}

/// Scriptable resolver library. Unscripted queries fail inline with
/// `NotFound`.
pub struct MockLibrary {
    state: Arc<Mutex<LibState>>,
}

impl MockLibrary {
    pub fn new() -> Arc<Self> {
        let state = LibState { deliver_on_process: true, ..LibState::default() };
        Arc::new(MockLibrary { state: Arc::new(Mutex::new(state)) })
    }

    pub fn script_host(
        &self,
        host: &str,
        family: AddressFamily,
        mode: ReplyMode,
        reply: Result<Vec<IpAddr>, LibraryError>,
    ) {
        self.state
            .lock()
            .unwrap()
            .host_replies
            .insert((host.to_string(), family), (mode, reply));
    }

    pub fn script_query(&self, name: &str, mode: ReplyMode, reply: Result<Vec<u8>, LibraryError>) {
        self.state.lock().unwrap().query_replies.insert(name.to_string(), (mode, reply));
    }

    pub fn script_srv_parse(&self, parse: Result<Vec<SrvRecord>, LibraryError>) {
        self.state.lock().unwrap().srv_parse = Some(parse);
    }

    pub fn script_txt_parse(&self, parse: Result<Vec<TxtChunk>, LibraryError>) {
        self.state.lock().unwrap().txt_parse = Some(parse);
    }

    pub fn script_init_error(&self, error: LibraryError) {
        self.state.lock().unwrap().init_error = Some(error);
    }

    pub fn script_set_servers_error(&self, error: LibraryError) {
        self.state.lock().unwrap().set_servers_error = Some(error);
    }

    /// When `false`, processing the channel delivers nothing: the library is
    /// still waiting on the network.
    pub fn set_deliver_on_process(&self, deliver: bool) {
        self.state.lock().unwrap().deliver_on_process = deliver;
    }

    /// Log of issued queries, e.g. `"A example.com"`.
    pub fn issued(&self) -> Vec<String> {
        self.state.lock().unwrap().issued.clone()
    }

    pub fn servers(&self) -> Vec<SocketAddr> {
        self.state.lock().unwrap().servers.clone()
    }

    pub fn channels_created(&self) -> usize {
        self.state.lock().unwrap().channels_created
    }

    pub fn stay_open_flags(&self) -> Vec<bool> {
        self.state.lock().unwrap().stay_open.clone()
    }
}

impl ResolverLibrary for MockLibrary {
    fn init(&self, options: ChannelOptions) -> Result<Box<dyn Channel>, LibraryError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.init_error.clone() {
            return Err(error);
        }
        state.channels_created += 1;
        state.stay_open.push(options.stay_open);
        Ok(Box::new(MockChannel { script: Arc::clone(&self.state), pending: Vec::new() }))
    }

    fn parse_srv_reply(&self, _buf: &[u8]) -> Result<Vec<SrvRecord>, LibraryError> {
        self.state.lock().unwrap().srv_parse.clone().unwrap_or(Ok(Vec::new()))
    }

    fn parse_txt_reply_ext(&self, _buf: &[u8]) -> Result<Vec<TxtChunk>, LibraryError> {
        self.state.lock().unwrap().txt_parse.clone().unwrap_or(Ok(Vec::new()))
    }
}

enum PendingReply {
    Host(HostDoneCallback, Result<Vec<IpAddr>, LibraryError>),
    Raw(QueryDoneCallback, Result<Vec<u8>, LibraryError>),
}

impl PendingReply {
    fn fire(self) {
        match self {
            PendingReply::Host(callback, reply) => callback(reply),
            PendingReply::Raw(callback, reply) => callback(reply),
        }
    }

    fn fire_cancelled(self) {
        match self {
            PendingReply::Host(callback, _) => callback(Err(LibraryError::Cancelled)),
            PendingReply::Raw(callback, _) => callback(Err(LibraryError::Cancelled)),
        }
    }
}

struct PendingQuery {
    socket: SocketHandle,
    reply: PendingReply,
}

struct MockChannel {
    script: Arc<Mutex<LibState>>,
    pending: Vec<PendingQuery>,
}

impl MockChannel {
    fn issue_raw(&mut self, log: String, name: &str, on_done: QueryDoneCallback) {
        let (mode, reply) = {
            let mut state = self.script.lock().unwrap();
            state.issued.push(log);
            state
                .query_replies
                .get(name)
                .cloned()
                .unwrap_or((ReplyMode::Inline, Err(LibraryError::NotFound)))
        };
        match mode {
            ReplyMode::Inline => on_done(reply),
            ReplyMode::OnSocket(socket) => self
                .pending
                .push(PendingQuery { socket, reply: PendingReply::Raw(on_done, reply) }),
        }
    }
}

impl Channel for MockChannel {
    fn set_servers(&mut self, servers: &[SocketAddr]) -> Result<(), LibraryError> {
        let mut state = self.script.lock().unwrap();
        if let Some(error) = state.set_servers_error.clone() {
            return Err(error);
        }
        state.servers = servers.to_vec();
        Ok(())
    }

    fn gethostbyname(&mut self, host: &str, family: AddressFamily, on_done: HostDoneCallback) {
        let (mode, reply) = {
            let mut state = self.script.lock().unwrap();
            let qtype = match family {
                AddressFamily::V4 => "A",
                AddressFamily::V6 => "AAAA",
            };
            state.issued.push(format!("{qtype} {host}"));
            state
                .host_replies
                .get(&(host.to_string(), family))
                .cloned()
                .unwrap_or((ReplyMode::Inline, Err(LibraryError::NotFound)))
        };
        match mode {
            ReplyMode::Inline => on_done(reply),
            ReplyMode::OnSocket(socket) => self
                .pending
                .push(PendingQuery { socket, reply: PendingReply::Host(on_done, reply) }),
        }
    }

    fn query(&mut self, name: &str, _class: DnsClass, qtype: DnsType, on_done: QueryDoneCallback) {
        self.issue_raw(format!("{qtype:?} {name}"), name, on_done);
    }

    fn search(&mut self, name: &str, _class: DnsClass, qtype: DnsType, on_done: QueryDoneCallback) {
        self.issue_raw(format!("search {qtype:?} {name}"), name, on_done);
    }

    fn getsock(&mut self) -> Vec<SocketInterest> {
        let mut sockets: Vec<SocketHandle> = Vec::new();
        for pending in &self.pending {
            if !sockets.contains(&pending.socket) {
                sockets.push(pending.socket);
            }
        }
        sockets
            .into_iter()
            .map(|socket| SocketInterest { socket, readable: true, writable: false })
            .collect()
    }

    fn process(&mut self, read: Option<SocketHandle>, _write: Option<SocketHandle>) {
        if !self.script.lock().unwrap().deliver_on_process {
            return;
        }
        if let Some(socket) = read {
            let mut idx = 0;
            while idx < self.pending.len() {
                if self.pending[idx].socket == socket {
                    self.pending.remove(idx).reply.fire();
                } else {
                    idx += 1;
                }
            }
        }
    }

    fn cancel(&mut self) {
        for pending in self.pending.drain(..) {
            pending.reply.fire_cancelled();
        }
    }
}

/// A standard mock world: engine, library, fds, and a driver wired to them.
pub struct World {
    pub engine: Arc<MockEngine>,
    pub library: Arc<MockLibrary>,
    pub fds: Arc<MockFds>,
    pub driver: DnsDriver,
}

impl World {
    pub fn new() -> Self {
        let engine = MockEngine::new();
        let library = MockLibrary::new();
        let fds = MockFds::new(engine.clone());
        let driver = DnsDriver::new(
            engine.clone(),
            library.clone(),
            Arc::new(MockFdFactory::new(fds.clone())),
        );
        World { engine, library, fds, driver }
    }
}

/// Slot collecting every published outcome. Publication happening exactly
/// once means the slot holds exactly one entry.
pub type Slot<T> = Arc<Mutex<Vec<Result<T, ResolveError>>>>;

/// Builds an `on_resolve` callback recording into a [`Slot`].
pub fn capture<T: Send + 'static>(
) -> (impl FnOnce(Result<T, ResolveError>) + Send + 'static, Slot<T>) {
    let slot: Slot<T> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&slot);
    (
        move |outcome| {
            sink.lock().unwrap().push(outcome);
        },
        slot,
    )
}

/// Shorthand for building a [`TxtChunk`].
pub fn chunk(record_start: bool, data: &str) -> TxtChunk {
    TxtChunk { record_start, data: data.as_bytes().to_vec() }
}

/// Prints driver traces while a test runs. Safe to call from every test;
/// only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}
