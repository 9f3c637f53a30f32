//! The permanent message connection: a reconnecting client with a queued
//! outbound cache and exponential backoff.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::warn;

use crate::address::{Address, UnixEndpoint};
use crate::connection::{Connection, ConnectionState, Interest};
use crate::dispatcher::{Dispatcher, MessageSender, Responder};
use crate::error::{Error, Result};
use crate::message::{Message, PARAM_CACHE};
use crate::time::{Duration, MonoTime};
use crate::transport::stream::{drain_complete_lines, MAX_LINE_LEN};

/// Base delay of the first reconnect attempt after a failure.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Upper bound the backoff delay never exceeds, however many attempts have
/// failed in a row, rather than letting it grow unbounded.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3600);
/// Default time-to-live applied to a cached message that does not specify
/// its own `ttl=` directive.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
/// Smallest TTL a `ttl=` directive can request.
pub const MIN_CACHE_TTL: Duration = Duration::from_secs(10);
/// Largest TTL a `ttl=` directive can request.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(86_400);
/// Default cap on the number of cached outbound messages; beyond this the
/// oldest entry is dropped with a warning rather than growing unbounded.
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 4096;

/// Tunables for a [`PermanentConnection`]'s backoff and cache policy.
#[derive(Debug, Clone, Copy)]
pub struct PermanentConfig {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Cache TTL applied when a message's `cache` parameter doesn't
    /// specify `ttl=`.
    pub default_ttl: Duration,
    /// Upper bound on cached, unsent messages.
    pub max_cache_entries: usize,
}

impl Default for PermanentConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            default_ttl: DEFAULT_CACHE_TTL,
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
        }
    }
}

/// Notified of connection-lifecycle transitions. Lifecycle hooks beyond the
/// base [`Connection`] trait's, specific to the reconnecting client.
pub trait PermanentHooks {
    /// A connect attempt just succeeded.
    fn process_connected(&mut self) {}
    /// A connect attempt (or an established connection) just failed;
    /// `reason` is a human-readable description. A reconnect is already
    /// scheduled by the time this fires.
    fn process_connection_failed(&mut self, reason: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Connected,
    ShutDown,
}

struct CacheEntry {
    encoded: Vec<u8>,
    expires_at: MonoTime,
}

/// Parsed form of the `cache` parameter's directive grammar:
/// semicolon-separated `name[=value]` pairs.
struct CacheDirective {
    no: bool,
    ttl: Option<Duration>,
}

fn parse_cache_directive(msg: &Message) -> CacheDirective {
    let mut directive = CacheDirective { no: false, ttl: None };
    let Some(raw) = msg.get_parameter(PARAM_CACHE) else {
        return directive;
    };
    for entry in raw.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('=') {
            Some(("ttl", value)) => {
                if let Ok(secs) = value.parse::<u64>() {
                    directive.ttl = Some(Duration::from_secs(secs));
                }
            }
            None if entry == "no" => directive.no = true,
            _ => {}
        }
    }
    directive
}

/// A client connection that reconnects indefinitely (with exponential
/// backoff) and caches outbound messages sent while disconnected, flushing
/// them oldest-first once reconnected.
///
/// States: `Disconnected → Connecting → Connected → Disconnected`, with a
/// latched terminal `ShutDown`.
pub struct PermanentConnection {
    state: ConnectionState,
    addr: Address,
    phase: Phase,
    socket: Option<Socket>,
    input: Vec<u8>,
    output: VecDeque<u8>,
    cache: Vec<CacheEntry>,
    dispatcher: Rc<Dispatcher>,
    hooks: Rc<RefCell<dyn PermanentHooks>>,
    config: PermanentConfig,
    attempt: u32,
}

impl PermanentConnection {
    /// Construct a connection that will attempt to reach `addr` once
    /// registered with a reactor (see [`Connection::connection_added`]).
    pub fn new(
        name: impl Into<String>,
        addr: Address,
        dispatcher: Rc<Dispatcher>,
        hooks: Rc<RefCell<dyn PermanentHooks>>,
        config: PermanentConfig,
    ) -> Self {
        Self {
            state: ConnectionState::new(name),
            addr,
            phase: Phase::Disconnected,
            socket: None,
            input: Vec::new(),
            output: VecDeque::new(),
            cache: Vec::new(),
            dispatcher,
            hooks,
            config,
            attempt: 0,
        }
    }

    /// True once [`PermanentConnection::shut_down`] has been called; no
    /// further sends or reconnects happen after this.
    pub fn is_shut_down(&self) -> bool {
        self.phase == Phase::ShutDown
    }

    /// True while a TCP/Unix handshake is established and messages flow.
    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    /// Number of messages currently queued, waiting for a reconnect.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Latch the terminal state: no further sends are accepted and no
    /// reconnect is attempted. Does not by itself unregister the
    /// connection from its reactor.
    pub fn shut_down(&mut self) {
        self.phase = Phase::ShutDown;
        self.socket = None;
        self.state.set_timeout_date(None);
    }

    fn open_socket(&self) -> io::Result<(Socket, SockAddr)> {
        match &self.addr {
            Address::Ip { addr, .. } => {
                let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
                let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
                socket.set_nonblocking(true)?;
                Ok((socket, SockAddr::from(*addr)))
            }
            Address::Unix(UnixEndpoint::Path(path)) => {
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.set_nonblocking(true)?;
                let sock_addr = SockAddr::unix(path)?;
                Ok((socket, sock_addr))
            }
            Address::Unix(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a permanent connection needs a concrete IP or Unix-path address",
            )),
        }
    }

    fn begin_connect(&mut self) {
        if self.phase == Phase::ShutDown {
            return;
        }
        match self.open_socket() {
            Ok((socket, sock_addr)) => match socket.connect(&sock_addr) {
                Ok(()) => {
                    self.socket = Some(socket);
                    self.on_connected();
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                {
                    self.socket = Some(socket);
                    self.phase = Phase::Connecting;
                }
                Err(e) => self.fail(e.to_string()),
            },
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn on_connected(&mut self) {
        self.phase = Phase::Connected;
        self.attempt = 0;
        self.state.set_timeout_date(None);
        self.hooks.borrow_mut().process_connected();
        self.flush_cache();
    }

    fn fail(&mut self, reason: String) {
        if self.phase == Phase::ShutDown {
            return;
        }
        self.phase = Phase::Disconnected;
        self.socket = None;
        self.input.clear();
        let factor = 1u128.checked_shl(self.attempt).unwrap_or(u128::MAX);
        let backoff_micros = self
            .config
            .base_delay
            .as_micros()
            .saturating_mul(factor)
            .min(self.config.max_delay.as_micros());
        self.attempt = self.attempt.saturating_add(1);
        self.state
            .set_timeout_date(Some(MonoTime::now() + Duration::from_micros(backoff_micros)));
        warn!(
            target: "reactor::permanent",
            "{}: connection failed: {reason}, retrying in {}ms",
            self.state.name(),
            backoff_micros / 1_000
        );
        self.hooks.borrow_mut().process_connection_failed(&reason);
    }

    fn evict_expired(&mut self, now: MonoTime) {
        self.cache.retain(|e| e.expires_at > now);
    }

    fn enqueue_cache(&mut self, msg: &Message, ttl: Duration) {
        let now = MonoTime::now();
        self.evict_expired(now);
        if self.cache.len() >= self.config.max_cache_entries {
            warn!(target: "reactor::permanent", "{}: outbound cache full, dropping oldest", self.state.name());
            self.cache.remove(0);
        }
        self.cache.push(CacheEntry {
            encoded: msg.encode().into_bytes(),
            expires_at: now + ttl,
        });
    }

    fn flush_cache(&mut self) {
        self.evict_expired(MonoTime::now());
        for entry in self.cache.drain(..) {
            self.output.extend(entry.encoded);
            self.output.push_back(b'\n');
        }
    }

    fn drain_lines(&mut self) -> Result<()> {
        let lines = drain_complete_lines(&mut self.input, MAX_LINE_LEN, self.state.name())?;
        for raw in lines {
            let Ok(text) = std::str::from_utf8(&raw) else {
                warn!(target: "reactor::permanent", "{}: non-UTF8 line discarded", self.state.name());
                continue;
            };
            match Message::decode(text) {
                Ok(msg) => {
                    let mut responder = CacheBufferResponder(&mut self.output);
                    self.dispatcher.dispatch(&msg, &mut responder)?;
                }
                Err(e) => {
                    warn!(target: "reactor::permanent", "{}: malformed message: {e}", self.state.name());
                }
            }
        }
        Ok(())
    }
}

struct CacheBufferResponder<'a>(&'a mut VecDeque<u8>);

impl Responder for CacheBufferResponder<'_> {
    fn reply(&mut self, message: &Message) -> Result<()> {
        self.0.extend(message.encode().as_bytes());
        self.0.push_back(b'\n');
        Ok(())
    }
}

impl MessageSender for PermanentConnection {
    /// `CONNECTED`: writes immediately. `CONNECTING`/`DISCONNECTED`: caches
    /// when `cache` is true or the message's own `cache` parameter isn't
    /// `no` (caching is the default), else drops and returns `false`.
    /// `SHUT_DOWN`: always drops and returns `false`.
    fn send_message(&mut self, message: &Message, cache: bool) -> Result<bool> {
        match self.phase {
            Phase::ShutDown => Ok(false),
            Phase::Connected => {
                self.output.extend(message.encode().as_bytes());
                self.output.push_back(b'\n');
                Ok(true)
            }
            Phase::Connecting | Phase::Disconnected => {
                let directive = parse_cache_directive(message);
                if !cache && directive.no {
                    return Ok(false);
                }
                let ttl = directive
                    .ttl
                    .unwrap_or(self.config.default_ttl)
                    .max(MIN_CACHE_TTL)
                    .min(MAX_CACHE_TTL);
                self.enqueue_cache(message, ttl);
                Ok(true)
            }
        }
    }
}

impl Connection for PermanentConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn is_reader(&self) -> bool {
        self.phase == Phase::Connected
    }

    fn is_writer(&self) -> bool {
        match self.phase {
            Phase::Connecting => true,
            Phase::Connected => !self.output.is_empty(),
            _ => false,
        }
    }

    fn socket(&self) -> RawFd {
        self.socket.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    fn events(&self) -> Interest {
        match self.phase {
            Phase::Connecting => Interest::WRITE,
            Phase::Connected if self.is_writer() => Interest::READ | Interest::WRITE,
            Phase::Connected => Interest::READ,
            _ => Interest::NONE,
        }
    }

    fn process_read(&mut self) -> Result<()> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(());
        };
        let mut chunk = [0u8; 64 * 1024];
        match socket.read(&mut chunk) {
            Ok(0) => {
                self.fail("peer closed".to_string());
                Ok(())
            }
            Ok(n) => {
                self.input.extend_from_slice(&chunk[..n]);
                self.drain_lines()
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                self.fail(e.to_string());
                Ok(())
            }
        }
    }

    fn process_write(&mut self) -> Result<()> {
        if self.phase == Phase::Connecting {
            let outcome = self.socket.as_ref().map(Socket::take_error);
            match outcome {
                Some(Ok(None)) => self.on_connected(),
                Some(Ok(Some(e))) => self.fail(e.to_string()),
                Some(Err(e)) => self.fail(e.to_string()),
                None => {}
            }
            return Ok(());
        }

        let Some(socket) = self.socket.as_mut() else {
            return Ok(());
        };
        while !self.output.is_empty() {
            let (front, _) = self.output.as_slices();
            match socket.write(front) {
                Ok(0) => break,
                Ok(n) => {
                    self.output.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    self.fail(e.to_string());
                    return Ok(());
                }
            }
        }
        if self.output.is_empty() {
            self.process_empty_buffer();
        }
        Ok(())
    }

    fn process_error(&mut self) {
        self.fail("poll reported a socket error".to_string());
    }

    fn process_hup(&mut self) {
        if self.phase != Phase::ShutDown {
            self.fail("poll reported a hangup".to_string());
        }
    }

    fn process_timeout(&mut self) -> Result<()> {
        if self.phase == Phase::Disconnected {
            self.begin_connect();
        }
        Ok(())
    }

    fn connection_added(&mut self) {
        self.begin_connect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::listen_tcp;
    use crate::reactor::{ConnectionHandle, Reactor};
    use std::cell::Cell;
    use std::net::TcpListener;

    #[derive(Default)]
    struct Hooks {
        connected: Cell<u32>,
        failed: Cell<u32>,
    }
    impl PermanentHooks for Hooks {
        fn process_connected(&mut self) {
            self.connected.set(self.connected.get() + 1);
        }
        fn process_connection_failed(&mut self, _reason: &str) {
            self.failed.set(self.failed.get() + 1);
        }
    }

    fn free_port() -> std::net::SocketAddr {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    }

    #[test]
    fn cache_directive_parses_no_and_ttl() {
        let mut msg = Message::new("X").unwrap();
        msg.set_parameter(PARAM_CACHE, "ttl=30");
        let d = parse_cache_directive(&msg);
        assert!(!d.no);
        assert_eq!(d.ttl.unwrap().as_micros(), Duration::from_secs(30).as_micros());

        msg.set_parameter(PARAM_CACHE, "no");
        let d = parse_cache_directive(&msg);
        assert!(d.no);
    }

    #[test]
    fn send_message_while_disconnected_caches_by_default() {
        let dispatcher = Rc::new(Dispatcher::new());
        let hooks: Rc<RefCell<dyn PermanentHooks>> = Rc::new(RefCell::new(Hooks::default()));
        let addr = Address::parse(&free_port().to_string(), "127.0.0.1", 0).unwrap();
        let mut conn = PermanentConnection::new("perm", addr, dispatcher, hooks, PermanentConfig::default());

        let msg = Message::new("DELAYED").unwrap();
        assert_eq!(conn.send_message(&msg, true).unwrap(), true);
        assert_eq!(conn.cached_len(), 1);
    }

    #[test]
    fn cache_no_is_dropped_when_not_forced() {
        let dispatcher = Rc::new(Dispatcher::new());
        let hooks: Rc<RefCell<dyn PermanentHooks>> = Rc::new(RefCell::new(Hooks::default()));
        let addr = Address::parse(&free_port().to_string(), "127.0.0.1", 0).unwrap();
        let mut conn = PermanentConnection::new("perm", addr, dispatcher, hooks, PermanentConfig::default());

        let mut msg = Message::new("EPHEMERAL").unwrap();
        msg.set_parameter(PARAM_CACHE, "no");
        assert_eq!(conn.send_message(&msg, false).unwrap(), false);
        assert_eq!(conn.cached_len(), 0);
    }

    #[test]
    fn shut_down_rejects_all_sends() {
        let dispatcher = Rc::new(Dispatcher::new());
        let hooks: Rc<RefCell<dyn PermanentHooks>> = Rc::new(RefCell::new(Hooks::default()));
        let addr = Address::parse(&free_port().to_string(), "127.0.0.1", 0).unwrap();
        let mut conn = PermanentConnection::new("perm", addr, dispatcher, hooks, PermanentConfig::default());
        conn.shut_down();
        let msg = Message::new("X").unwrap();
        assert_eq!(conn.send_message(&msg, true).unwrap(), false);
    }

    #[test]
    fn reconnects_and_flushes_cache_once_server_appears() {
        let listen_addr = free_port();
        // Nothing listening yet: the first connect attempt must fail and
        // schedule a retry rather than blocking.
        let dispatcher = Rc::new(Dispatcher::new());
        let hooks: Rc<RefCell<dyn PermanentHooks>> = Rc::new(RefCell::new(Hooks::default()));
        let addr = Address::parse(&listen_addr.to_string(), "127.0.0.1", 0).unwrap();
        let conn = Rc::new(RefCell::new(PermanentConnection::new(
            "perm",
            addr,
            dispatcher,
            hooks,
            PermanentConfig {
                base_delay: Duration::from_millis(10),
                ..PermanentConfig::default()
            },
        )));

        let mut reactor = Reactor::new();
        let handle: ConnectionHandle = conn.clone();
        reactor.add_connection(handle);

        conn.borrow_mut()
            .send_message(&Message::new("DELAYED").unwrap(), true)
            .unwrap();
        assert_eq!(conn.borrow().cached_len(), 1);

        // Start the listener now, after the first failed attempt.
        let _listener = listen_tcp(listen_addr).unwrap();

        for _ in 0..20 {
            reactor.tick().unwrap();
            if conn.borrow().is_connected() {
                break;
            }
        }
        assert!(conn.borrow().is_connected());
    }
}
