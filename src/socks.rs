//! SOCKS5 originator: opens outgoing connections on behalf of pipe peers.
//!
//! Each session is one outgoing SOCKS5 conversation, identified by a random
//! non-zero 64-bit token, and walks the usual ladder: method selection,
//! optional user/pass sub-negotiation, CONNECT, then raw byte relay through
//! the TCP multiplexer.
//!
//! Properties:
//! * SOCKS5 only
//! * TCP only, CONNECT command only
//! * IPv4, IPv6 and domain-name addressing
//! * user/pass sub-negotiation is parsed and accepted but credentials are
//!   not validated
//!
//! Inbound requests are queued through `push_request` and drained by one
//! maintenance thread; a request is assumed to hold exactly one complete
//! SOCKS message until the session reaches the relay state.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace};
use rand::Rng;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::tcpmux::{TcpEvent, TcpMux};

/// Server-side session identifier.
pub type Token = u64;

/// Zero never names a live session.
pub const INVALID_TOKEN: Token = 0;

// SOCKS5 protocol constants.
pub const VERSION5: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_USERPASS: u8 = 0x02;
pub const AUTH_NO_ACCEPT: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NETWORK_UNREACH: u8 = 0x03;
pub const REP_HOST_UNREACH: u8 = 0x04;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Timeout for one connect attempt against one resolved address.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(6);

/// Send/receive timeouts installed on a connected target socket.
const IO_TIMEOUT: Duration = Duration::from_secs(4);

/// How long the maintenance thread may park before re-checking stop.
const LOOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Events emitted toward the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksEvent {
    /// Bytes to ship back toward the peer: a SOCKS reply or target payload.
    Response { token: Token, data: Vec<u8> },
    /// The originator wants the pipe peer's session closed, typically after
    /// a malformed SOCKS message.
    CloseClient { token: Token },
    /// The target TCP connection closed.
    Disconnected { token: Token },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Waiting for the method-selection greeting.
    New,
    /// Waiting for the user/pass sub-negotiation.
    NeedsAuth,
    /// (No)auth done, waiting for the CONNECT command.
    NeedsCmd,
    /// CONNECT succeeded; bytes relay to the target.
    Connected,
}

struct Session {
    state: SessionState,
    last_activity: Instant,
}

struct Request {
    token: Token,
    data: Vec<u8>,
}

struct Inner {
    sessions: Mutex<HashMap<Token, Session>>,
    tcp: Arc<TcpMux>,
    tcp_events: Receiver<TcpEvent>,
    request_tx: Sender<Request>,
    request_rx: Receiver<Request>,
    events: Sender<SocksEvent>,
    stopped: AtomicBool,
    max_sessions: usize,
}

/// The originator. One maintenance thread drains the request queue and the
/// multiplexer's event stream.
pub struct SocksProxy {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SocksProxy {
    /// Creates the originator and hands out its event stream.
    pub fn new(max_sessions: usize) -> (Arc<SocksProxy>, Receiver<SocksEvent>) {
        let (tcp, tcp_events) = TcpMux::new();
        let (request_tx, request_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();

        let proxy = Arc::new(SocksProxy {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                tcp,
                tcp_events,
                request_tx,
                request_rx,
                events: events_tx,
                stopped: AtomicBool::new(false),
                max_sessions,
            }),
            thread: Mutex::new(None),
        });
        (proxy, events_rx)
    }

    /// Starts the maintenance thread. A no-op when already launched or when
    /// the stop flag was raised first.
    pub fn launch(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut guard = self.thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *guard = Some(thread::spawn(move || maintenance_loop(inner)));
    }

    /// Allocates a fresh session in the `new` state.
    ///
    /// Returns [`INVALID_TOKEN`] when the table is at its ceiling.
    pub fn create_session(&self) -> Token {
        let mut sessions = self.inner.sessions.lock().unwrap();
        if sessions.len() >= self.inner.max_sessions {
            debug!("session table full ({} live)", sessions.len());
            return INVALID_TOKEN;
        }

        let mut rng = rand::thread_rng();
        let token = loop {
            let token: Token = rng.gen();
            if token != INVALID_TOKEN && token != Token::MAX && !sessions.contains_key(&token) {
                break token;
            }
        };
        sessions.insert(
            token,
            Session { state: SessionState::New, last_activity: Instant::now() },
        );
        token
    }

    /// Queues one inbound SOCKS message for `token`. Messages for unknown
    /// sessions are dropped at dispatch.
    pub fn push_request(&self, token: Token, data: Vec<u8>) {
        let _ = self.inner.request_tx.send(Request { token, data });
    }

    /// Owner-initiated teardown of a session. Emits nothing: the owner
    /// already knows. Idempotent.
    pub fn disconnect_session(&self, token: Token) {
        self.inner.erase_session(token);
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    /// Stops the maintenance thread, every target socket, and clears the
    /// session table. Idempotent.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.inner.tcp.stop();
        self.inner.sessions.lock().unwrap().clear();
    }
}

fn maintenance_loop(inner: Arc<Inner>) {
    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        crossbeam_channel::select! {
            recv(inner.request_rx) -> msg => match msg {
                Ok(request) => inner.handle_request(request),
                Err(_) => return,
            },
            recv(inner.tcp_events) -> msg => match msg {
                Ok(event) => inner.handle_tcp_event(event),
                Err(_) => return,
            },
            default(LOOP_TIMEOUT) => {}
        }
    }
}

enum ConnectCommit {
    Done,
    RegisterFailed,
    SessionGone,
}

impl Inner {
    fn handle_request(&self, request: Request) {
        let Request { token, data } = request;

        let state = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get_mut(&token) {
                Some(session) => {
                    session.last_activity = Instant::now();
                    session.state
                }
                None => {
                    trace!("request for unknown session {:#x} dropped", token);
                    return;
                }
            }
        };

        let ok = match state {
            SessionState::New => self.handle_greeting(token, &data),
            SessionState::NeedsAuth => self.handle_auth(token, &data),
            SessionState::NeedsCmd => self.handle_connect_request(token, &data),
            SessionState::Connected => self.tcp.send(token, data),
        };

        if !ok {
            let _ = self.events.send(SocksEvent::CloseClient { token });
            self.erase_session(token);
        }
    }

    /// Method selection. `no-auth` wins as soon as it is offered; otherwise
    /// user/pass is accepted if offered; otherwise the session fails.
    fn handle_greeting(&self, token: Token, data: &[u8]) -> bool {
        if data.len() >= 3 && data[0] == VERSION5 {
            let nmethods = data[1] as usize;
            let methods = &data[2..data.len().min(2 + nmethods)];

            if methods.contains(&AUTH_NONE) {
                self.set_state(token, SessionState::NeedsCmd);
                self.send_to_client(token, vec![VERSION5, AUTH_NONE]);
                return true;
            }
            if methods.contains(&AUTH_USERPASS) {
                self.set_state(token, SessionState::NeedsAuth);
                self.send_to_client(token, vec![VERSION5, AUTH_USERPASS]);
                return true;
            }
        }

        self.send_to_client(token, vec![VERSION5, AUTH_NO_ACCEPT]);
        false
    }

    /// RFC 1929 user/pass sub-negotiation. Credentials are not validated.
    fn handle_auth(&self, token: Token, data: &[u8]) -> bool {
        if data.len() >= 5 && data[0] == 1 && data[1] >= 1 {
            let user_len = data[1] as usize;
            if data.len() >= 4 + user_len {
                let pass_len = data[2 + user_len] as usize;
                if data.len() == 3 + user_len + pass_len {
                    let user = String::from_utf8_lossy(&data[2..2 + user_len]);
                    let pass = String::from_utf8_lossy(&data[3 + user_len..]);
                    debug!("session {:#x}: user [{}], pass [{}]", token, user, pass);

                    self.set_state(token, SessionState::NeedsCmd);
                    self.send_to_client(token, vec![1, 0]);
                    return true;
                }
            }
        }

        self.send_to_client(token, vec![1, 1]);
        false
    }

    fn handle_connect_request(&self, token: Token, data: &[u8]) -> bool {
        let target = match parse_connect_request(data) {
            Ok(target) => target,
            Err(code) => {
                self.send_reply(token, code);
                return false;
            }
        };

        let addrs = match target.resolve() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("session {:#x}: resolving {} failed: {}", token, target, e);
                self.send_reply(token, REP_GENERAL_FAILURE);
                return false;
            }
        };

        let stream = match connect_target(&addrs) {
            Ok(stream) => stream,
            Err(code) => {
                debug!("session {:#x}: connecting {} failed (reply {})", token, target, code);
                self.send_reply(token, code);
                return false;
            }
        };

        let commit = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get_mut(&token) {
                Some(session) => {
                    if self.tcp.register(token, stream) {
                        session.state = SessionState::Connected;
                        ConnectCommit::Done
                    } else {
                        ConnectCommit::RegisterFailed
                    }
                }
                None => ConnectCommit::SessionGone,
            }
        };

        match commit {
            ConnectCommit::Done => {
                debug!("session {:#x}: connected to {}", token, target);
                self.send_reply(token, REP_SUCCESS);
                true
            }
            ConnectCommit::RegisterFailed => {
                self.send_reply(token, REP_GENERAL_FAILURE);
                false
            }
            // Disconnected while the connect was in flight; the socket was
            // dropped and there is nobody left to answer.
            ConnectCommit::SessionGone => true,
        }
    }

    fn handle_tcp_event(&self, event: TcpEvent) {
        match event {
            TcpEvent::Received { id, data } => {
                if self.sessions.lock().unwrap().contains_key(&id) {
                    self.send_to_client(id, data);
                } else {
                    // Session vanished; disconnect from the target too.
                    self.tcp.disconnect(id);
                }
            }
            TcpEvent::Disconnected { id } => {
                if self.sessions.lock().unwrap().remove(&id).is_some() {
                    let _ = self.events.send(SocksEvent::Disconnected { token: id });
                }
            }
        }
    }

    fn set_state(&self, token: Token, state: SessionState) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(&token) {
            session.state = state;
        }
    }

    fn send_to_client(&self, token: Token, data: Vec<u8>) {
        let _ = self.events.send(SocksEvent::Response { token, data });
    }

    /// Ships a SOCKS reply. Sticks to ATYP=IPv4 with zeroed address and port
    /// regardless of the request's address type; expected clients rely on
    /// this exact shape.
    fn send_reply(&self, token: Token, code: u8) {
        self.send_to_client(
            token,
            vec![VERSION5, code, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0],
        );
    }

    fn erase_session(&self, token: Token) {
        let removed = self.sessions.lock().unwrap().remove(&token);
        if let Some(session) = removed {
            trace!(
                "session {:#x}: erased ({:?} since last activity)",
                token,
                session.last_activity.elapsed()
            );
            self.tcp.disconnect(token);
        }
    }
}

/// Target of a CONNECT command.
enum Target {
    Addr(SocketAddr),
    Name(String, u16),
}

impl Target {
    fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        match self {
            Target::Addr(addr) => Ok(vec![*addr]),
            Target::Name(host, port) => Ok((host.as_str(), *port).to_socket_addrs()?.collect()),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Addr(addr) => write!(f, "{}", addr),
            Target::Name(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Parses a SOCKS5 CONNECT request, returning the reply code on failure.
fn parse_connect_request(data: &[u8]) -> Result<Target, u8> {
    if data.len() < 10 || data[0] != VERSION5 || data[2] != 0 {
        return Err(REP_GENERAL_FAILURE);
    }
    if data[1] != CMD_CONNECT {
        return Err(REP_CMD_NOT_SUPPORTED);
    }

    match data[3] {
        ATYP_IPV4 => {
            // header(4) + addr(4) + port(2)
            let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            let port = u16::from_be_bytes([data[8], data[9]]);
            Ok(Target::Addr(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        ATYP_IPV6 => {
            // header(4) + addr(16) + port(2)
            if data.len() < 22 {
                return Err(REP_GENERAL_FAILURE);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            let port = u16::from_be_bytes([data[20], data[21]]);
            Ok(Target::Addr(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        }
        ATYP_DOMAIN => {
            // header(4) + len(1) + name(len) + port(2)
            let name_len = data[4] as usize;
            let need = 7 + name_len;
            if name_len == 0 || data.len() < need {
                return Err(REP_GENERAL_FAILURE);
            }
            let host = String::from_utf8_lossy(&data[5..5 + name_len]).into_owned();
            let port = u16::from_be_bytes([data[need - 2], data[need - 1]]);
            Ok(Target::Name(host, port))
        }
        _ => Err(REP_ADDR_NOT_SUPPORTED),
    }
}

/// Tries each resolved address in order; the first failure's reply code is
/// the one reported when every attempt fails.
fn connect_target(addrs: &[SocketAddr]) -> Result<TcpStream, u8> {
    let mut first_err: Option<u8> = None;

    for addr in addrs {
        match TcpStream::connect_timeout(addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                let configured = stream
                    .set_read_timeout(Some(IO_TIMEOUT))
                    .and_then(|_| stream.set_write_timeout(Some(IO_TIMEOUT)));
                match configured {
                    Ok(()) => return Ok(stream),
                    Err(e) => {
                        first_err.get_or_insert(error_to_reply(&e));
                    }
                }
            }
            Err(e) => {
                first_err.get_or_insert(error_to_reply(&e));
            }
        }
    }

    Err(first_err.unwrap_or(REP_GENERAL_FAILURE))
}

fn error_to_reply(e: &io::Error) -> u8 {
    match e.kind() {
        ErrorKind::NetworkUnreachable | ErrorKind::NetworkDown => REP_NETWORK_UNREACH,
        ErrorKind::HostUnreachable => REP_HOST_UNREACH,
        ErrorKind::ConnectionRefused => REP_CONN_REFUSED,
        ErrorKind::Unsupported | ErrorKind::InvalidInput => REP_ADDR_NOT_SUPPORTED,
        ErrorKind::TimedOut | ErrorKind::WouldBlock => REP_TTL_EXPIRED,
        _ => REP_GENERAL_FAILURE,
    }
}
