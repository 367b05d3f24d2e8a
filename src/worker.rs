//! Dispatch core: binds pipe instances into per-client channel pairs and
//! routes decoded frames to the SOCKS originator and back.
//!
//! The worker owns three tables: instance-token → channel, client-id →
//! client, and session-token → client-id (the reverse route for traffic
//! coming back from targets). All three are touched only by the worker's
//! maintenance thread, which drains the pipe server's and the originator's
//! event channels.
//!
//! A channel is one pipe instance. A client is one logical peer owning at
//! most one read channel and at most one write channel (possibly the same
//! instance, duplex). The peer's declared direction flags are inverted for
//! the server's bookkeeping: a channel the peer reads from is one the server
//! writes to.

use crossbeam_channel::Receiver;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;

use crate::pipe::{InstanceToken, PipeEvent, PipeServer};
use crate::proto::{self, ClientId, Extract, Frame, FrameBody, SocksId};
use crate::socks::{SocksEvent, SocksProxy, Token, INVALID_TOKEN};

/// Default ceiling on concurrently connected logical clients.
pub const DEFAULT_MAX_CLIENTS: usize = 4096;

/// Default ceiling on concurrently live SOCKS sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 4096;

/// How long the maintenance thread may park before re-checking stop.
const LOOP_TIMEOUT: Duration = Duration::from_secs(1);

// Server-side channel direction bits.
const CHAN_READ: u32 = 0x01;
const CHAN_WRITE: u32 = 0x02;

/// Why the worker's maintenance loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `stop()` was called.
    Stopped,
    /// A peer sent `uninstall_self`; the process surface decides what that
    /// means beyond shutting the worker down.
    UninstallRequested,
}

/// Worker parameters.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Filesystem path of the pipe endpoint.
    pub endpoint: PathBuf,
    pub max_clients: usize,
    pub max_sessions: usize,
}

impl WorkerConfig {
    pub fn new<P: AsRef<Path>>(endpoint: P) -> WorkerConfig {
        WorkerConfig {
            endpoint: endpoint.as_ref().to_path_buf(),
            max_clients: DEFAULT_MAX_CLIENTS,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// One pipe instance as the worker sees it.
struct Channel {
    /// Owning client, zero until the setup frame arrives.
    client_id: ClientId,
    /// Server-side direction bits, zero until setup.
    config: u32,
    /// Accumulates raw bytes until whole frames can be extracted.
    input: BytesMut,
}

impl Channel {
    fn new() -> Channel {
        Channel { client_id: proto::INVALID_CLIENT_ID, config: 0, input: BytesMut::new() }
    }
}

/// One logical peer.
struct Client {
    id: ClientId,
    chan_read: Option<InstanceToken>,
    chan_write: Option<InstanceToken>,
    /// peer socks-id → server-side session token; injective per client.
    socks_id_to_token: HashMap<SocksId, Token>,
}

impl Client {
    fn new(id: ClientId) -> Client {
        Client { id, chan_read: None, chan_write: None, socks_id_to_token: HashMap::new() }
    }

    fn find_socks_id(&self, session: Token) -> Option<SocksId> {
        self.socks_id_to_token
            .iter()
            .find(|(_, &token)| token == session)
            .map(|(&socks_id, _)| socks_id)
    }
}

/// The bridge: pipe endpoint on one side, SOCKS originator on the other.
pub struct Worker {
    pipe: Arc<PipeServer>,
    socks: Arc<SocksProxy>,
    pipe_events: Receiver<PipeEvent>,
    socks_events: Receiver<SocksEvent>,
    stopped: Arc<AtomicBool>,
    uninstall: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    max_clients: usize,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Worker {
        let (pipe, pipe_events) = PipeServer::new(&config.endpoint);
        let (socks, socks_events) = SocksProxy::new(config.max_sessions);
        Worker {
            pipe,
            socks,
            pipe_events,
            socks_events,
            stopped: Arc::new(AtomicBool::new(false)),
            uninstall: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            max_clients: config.max_clients,
        }
    }

    /// Path of the served endpoint.
    pub fn endpoint(&self) -> &Path {
        self.pipe.path()
    }

    /// Binds the endpoint and starts the whole stack. A no-op when already
    /// launched or when the stop flag was raised first.
    pub fn launch(&self) -> io::Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.thread.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }

        self.pipe.launch()?;
        self.socks.launch();

        let mut dispatch = Dispatch {
            pipe: Arc::clone(&self.pipe),
            socks: Arc::clone(&self.socks),
            stopped: Arc::clone(&self.stopped),
            uninstall: Arc::clone(&self.uninstall),
            channels: HashMap::new(),
            clients: HashMap::new(),
            socks_token_to_client: HashMap::new(),
            max_clients: self.max_clients,
        };
        let pipe_events = self.pipe_events.clone();
        let socks_events = self.socks_events.clone();
        *guard = Some(thread::spawn(move || dispatch.run(pipe_events, socks_events)));
        Ok(())
    }

    /// Blocks until the maintenance loop ends, then tears the stack down and
    /// reports why the loop ended.
    pub fn wait(&self) -> ExitReason {
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.pipe.stop();
        self.socks.stop();
        if self.uninstall.load(Ordering::SeqCst) {
            ExitReason::UninstallRequested
        } else {
            ExitReason::Stopped
        }
    }

    /// Stops everything. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.pipe.stop();
        self.socks.stop();
    }
}

/// State owned by the maintenance thread. No locks: the tables have exactly
/// one user.
struct Dispatch {
    pipe: Arc<PipeServer>,
    socks: Arc<SocksProxy>,
    stopped: Arc<AtomicBool>,
    uninstall: Arc<AtomicBool>,
    channels: HashMap<InstanceToken, Channel>,
    clients: HashMap<ClientId, Client>,
    socks_token_to_client: HashMap<Token, ClientId>,
    max_clients: usize,
}

impl Dispatch {
    fn run(&mut self, pipe_events: Receiver<PipeEvent>, socks_events: Receiver<SocksEvent>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            crossbeam_channel::select! {
                recv(pipe_events) -> event => match event {
                    Ok(event) => self.handle_pipe_event(event),
                    Err(_) => break,
                },
                recv(socks_events) -> event => match event {
                    Ok(event) => self.handle_socks_event(event),
                    Err(_) => break,
                },
                default(LOOP_TIMEOUT) => {}
            }
        }

        // Close every instance and drop all routing state.
        let tokens: Vec<InstanceToken> = self.channels.keys().copied().collect();
        for token in tokens {
            self.pipe.disconnect_instance(token);
        }
        self.channels.clear();
        self.clients.clear();
        self.socks_token_to_client.clear();
    }

    fn handle_pipe_event(&mut self, event: PipeEvent) {
        match event {
            PipeEvent::Connected(token) => {
                trace!("instance {} connected", token);
                // Force-clean any stale channel left under a reused token,
                // along with whatever client depended on it.
                self.erase_channel_and_client(token, false);
            }
            PipeEvent::Recv { token, data } => {
                let channel = self.channels.entry(token).or_insert_with(Channel::new);
                channel.input.extend_from_slice(&data);
                self.process_channel(token);
            }
            PipeEvent::Sent { token, len, queued } => {
                trace!("instance {} wrote {} bytes ({} queued)", token, len, queued);
            }
            PipeEvent::Closed(token) => {
                trace!("instance {} closed", token);
                self.erase_channel_and_client(token, true);
            }
        }
    }

    /// Drains complete frames out of one channel's input buffer. Parse
    /// errors other than "incomplete" tear the channel (and its client)
    /// down.
    fn process_channel(&mut self, token: InstanceToken) {
        let must_erase = loop {
            if self.stopped.load(Ordering::SeqCst) {
                break false;
            }
            let extracted = match self.channels.get_mut(&token) {
                Some(channel) => proto::extract_next_frame(&mut channel.input),
                None => break false,
            };
            match extracted {
                Extract::Frame(frame) => {
                    if self.handle_frame(token, frame) {
                        break true;
                    }
                }
                Extract::Incomplete => break false,
                error => {
                    debug!("channel {}: parse error {:?}", token, error);
                    break true;
                }
            }
        };

        if must_erase {
            self.erase_channel_and_client(token, true);
        }
    }

    /// Routes one frame. Returns true when the channel must be torn down.
    fn handle_frame(&mut self, token: InstanceToken, frame: Frame) -> bool {
        let (client_id, config) = match self.channels.get(&token) {
            Some(channel) => (channel.client_id, channel.config),
            None => return false,
        };

        // The first frame on a channel must be channel_setup, exactly once.
        if client_id == proto::INVALID_CLIENT_ID || config == 0 {
            return match frame.body {
                FrameBody::ChannelSetup { client_id, flags } => {
                    self.handle_channel_setup(token, frame.uid, client_id, flags)
                }
                _ => {
                    debug!("channel {}: first frame is not channel_setup", token);
                    true
                }
            };
        }

        match frame.body {
            // A second setup, or a frame only the server may send.
            FrameBody::ChannelSetup { .. } | FrameBody::ChannelSetupAck { .. } => true,
            // The server never expects a status from the peer.
            FrameBody::Status(_) => false,
            FrameBody::Ping => self.handle_ping(token, frame.uid),
            FrameBody::Socks { socks_id, data } => self.handle_socks(token, socks_id, data),
            FrameBody::SocksClose { socks_id } | FrameBody::SocksDisconnected { socks_id } => {
                self.handle_socks_close(token, frame.uid, socks_id)
            }
            FrameBody::UninstallSelf => {
                debug!("peer requested uninstall");
                self.uninstall.store(true, Ordering::SeqCst);
                self.stopped.store(true, Ordering::SeqCst);
                false
            }
            FrameBody::Unknown(opcode) => {
                debug!("channel {}: unsupported opcode {}", token, opcode);
                match self.find_write_channel(token) {
                    Some(write_token) => {
                        self.send_on_channel(
                            write_token,
                            proto::make_status(frame.uid, proto::STATUS_UNSUPPORTED),
                            true,
                        );
                        false
                    }
                    None => true,
                }
            }
        }
    }

    fn handle_channel_setup(
        &mut self,
        token: InstanceToken,
        uid: u32,
        peer_client_id: ClientId,
        flags: u32,
    ) -> bool {
        // Invert the peer's declared directions into the server's view.
        let mut config = 0u32;
        if flags & proto::SETUP_READ != 0 {
            config |= CHAN_WRITE;
        }
        if flags & proto::SETUP_WRITE != 0 {
            config |= CHAN_READ;
        }
        if config == 0 {
            debug!("channel {}: setup with no direction", token);
            return true;
        }

        let client_id = if peer_client_id == proto::INVALID_CLIENT_ID {
            // New client: allocate an id that is not live right now.
            if self.clients.len() >= self.max_clients {
                warn!("client table full ({} live), refusing setup", self.clients.len());
                return true;
            }
            let id = loop {
                let id = proto::generate_client_id();
                if !self.clients.contains_key(&id) {
                    break id;
                }
            };
            let mut client = Client::new(id);
            if config & CHAN_READ != 0 {
                client.chan_read = Some(token);
            }
            if config & CHAN_WRITE != 0 {
                client.chan_write = Some(token);
            }
            self.clients.insert(id, client);
            id
        } else {
            let Some(client) = self.clients.get_mut(&peer_client_id) else {
                debug!("channel {}: setup names unknown client {:#x}", token, peer_client_id);
                return true;
            };
            // One read and one write channel per client, ever.
            if (flags & proto::SETUP_READ != 0 && client.chan_write.is_some())
                || (flags & proto::SETUP_WRITE != 0 && client.chan_read.is_some())
            {
                debug!("client {:#x}: channel slot collision", peer_client_id);
                return true;
            }
            if config & CHAN_READ != 0 {
                client.chan_read = Some(token);
            }
            if config & CHAN_WRITE != 0 {
                client.chan_write = Some(token);
            }
            peer_client_id
        };

        if let Some(channel) = self.channels.get_mut(&token) {
            channel.client_id = client_id;
            channel.config = config;
        }
        debug!("channel {}: client {:#x}, server flags {:#x}", token, client_id, config);

        // The ack bypasses the direction check: the acked channel may be
        // read-only from the server's side, yet the peer expects its ack
        // there.
        self.send_on_channel(token, proto::make_channel_setup_ack(uid, client_id), false);
        false
    }

    fn handle_ping(&mut self, token: InstanceToken, uid: u32) -> bool {
        match self.find_write_channel(token) {
            Some(write_token) => {
                self.send_on_channel(write_token, proto::make_status(uid, proto::STATUS_OK), true);
                false
            }
            None => true,
        }
    }

    fn handle_socks(&mut self, token: InstanceToken, socks_id: SocksId, data: Vec<u8>) -> bool {
        if socks_id == proto::INVALID_SOCKS_ID {
            return false;
        }

        let client_id = match self.channels.get(&token) {
            Some(channel) => channel.client_id,
            None => return true,
        };
        let Some(client) = self.clients.get_mut(&client_id) else {
            return true;
        };

        // socks_id is the peer's name for the session, the token is ours;
        // the split keeps two peers' identical ids apart.
        let session = match client.socks_id_to_token.get(&socks_id) {
            Some(&session) => session,
            None => {
                let session = self.socks.create_session();
                if session == INVALID_TOKEN {
                    debug!("client {:#x}: session allocation refused", client_id);
                    return true;
                }
                client.socks_id_to_token.insert(socks_id, session);
                self.socks_token_to_client.insert(session, client_id);
                trace!("client {:#x}: socks id {} -> session {:#x}", client_id, socks_id, session);
                session
            }
        };

        self.socks.push_request(session, data);
        false
    }

    fn handle_socks_close(&mut self, token: InstanceToken, uid: u32, socks_id: SocksId) -> bool {
        let client_id = match self.channels.get(&token) {
            Some(channel) => channel.client_id,
            None => return true,
        };
        let Some(client) = self.clients.get_mut(&client_id) else {
            return true;
        };

        // Unbind both directions so the peer may reuse its id.
        let session = client.socks_id_to_token.remove(&socks_id);
        let write_token = client.chan_write;

        if let Some(session) = session {
            self.socks_token_to_client.remove(&session);
        }
        if let Some(write_token) = write_token {
            self.send_on_channel(write_token, proto::make_status(uid, proto::STATUS_OK), true);
        }
        if let Some(session) = session {
            self.socks.disconnect_session(session);
        }
        false
    }

    fn handle_socks_event(&mut self, event: SocksEvent) {
        match event {
            SocksEvent::Response { token, data } => self.forward_response(token, data),
            SocksEvent::CloseClient { token } => self.forward_close(token, false),
            SocksEvent::Disconnected { token } => self.forward_close(token, true),
        }
    }

    /// Ships originator output toward the owning peer as a `socks` frame.
    fn forward_response(&mut self, session: Token, data: Vec<u8>) {
        let Some(&client_id) = self.socks_token_to_client.get(&session) else {
            // Nobody left to route to; make sure the target side dies too.
            self.socks.disconnect_session(session);
            return;
        };
        let Some(client) = self.clients.get(&client_id) else {
            self.socks_token_to_client.remove(&session);
            self.socks.disconnect_session(session);
            return;
        };
        let Some(socks_id) = client.find_socks_id(session) else {
            self.socks.disconnect_session(session);
            return;
        };
        if data.is_empty() {
            return;
        }
        let Some(write_token) = client.chan_write else {
            return;
        };
        let packet = proto::make_socks(socks_id, &data);
        self.send_on_channel(write_token, packet, true);
    }

    /// Relays `socks_close` (originator wants the peer session gone) or
    /// `socks_disconnected` (the target connection closed).
    fn forward_close(&mut self, session: Token, disconnected: bool) {
        let Some(&client_id) = self.socks_token_to_client.get(&session) else {
            return;
        };
        let Some(client) = self.clients.get_mut(&client_id) else {
            self.socks_token_to_client.remove(&session);
            return;
        };
        let Some(socks_id) = client.find_socks_id(session) else {
            return;
        };
        let write_token = client.chan_write;

        // Either way the originator has erased the session already, and it is
        // free to hand the token to somebody else's next session. Unbind both
        // maps so the id can be reused by the peer and the stale route can
        // never resolve into a foreign session.
        client.socks_id_to_token.remove(&socks_id);
        self.socks_token_to_client.remove(&session);

        if let Some(write_token) = write_token {
            let packet = if disconnected {
                proto::make_socks_disconnected(socks_id)
            } else {
                proto::make_socks_close(socks_id)
            };
            self.send_on_channel(write_token, packet, true);
        }
    }

    /// The channel frames to `token` should be answered on: the channel
    /// itself while unconfigured, the client's write channel afterwards.
    fn find_write_channel(&self, token: InstanceToken) -> Option<InstanceToken> {
        let channel = self.channels.get(&token)?;
        if channel.client_id == proto::INVALID_CLIENT_ID {
            return Some(token);
        }
        self.clients.get(&channel.client_id)?.chan_write
    }

    /// Writes a packet on a channel. With `validate`, refuses channels whose
    /// server-side direction excludes write.
    fn send_on_channel(&self, token: InstanceToken, packet: Vec<u8>, validate: bool) -> bool {
        let Some(channel) = self.channels.get(&token) else {
            return false;
        };
        if validate && channel.config != 0 && channel.config & CHAN_WRITE == 0 {
            debug!("channel {}: not a write channel", token);
            return false;
        }
        self.pipe.send(token, packet)
    }

    /// Removes a channel; if it belongs to a client, the whole client goes
    /// with it (both channels, all sessions).
    fn erase_channel_and_client(&mut self, token: InstanceToken, disconnect: bool) {
        let Some(client_id) = self.channels.get(&token).map(|c| c.client_id) else {
            return;
        };

        if client_id == proto::INVALID_CLIENT_ID {
            // Channel was still waiting for its setup frame.
            self.channels.remove(&token);
            if disconnect {
                self.pipe.disconnect_instance(token);
            }
        } else {
            // Keep the triggering instance open when it is only being
            // recycled (disconnect == false): its token was just reused.
            let except = if disconnect { 0 } else { token };
            self.erase_client(client_id, disconnect, except);
        }
    }

    /// Erases a client, its channels and its sessions. `except_token`
    /// shields one instance from the disconnect (zero shields none).
    fn erase_client(&mut self, client_id: ClientId, disconnect: bool, except_token: InstanceToken) {
        if client_id == proto::INVALID_CLIENT_ID {
            return;
        }
        let Some(client) = self.clients.remove(&client_id) else {
            return;
        };
        debug!("erasing client {:#x}", client.id);

        let sessions: Vec<Token> = client.socks_id_to_token.values().copied().collect();
        for session in &sessions {
            self.socks_token_to_client.remove(session);
        }

        let read_token = client.chan_read;
        let write_token = client.chan_write;
        if let Some(token) = read_token {
            self.channels.remove(&token);
        }
        if let Some(token) = write_token {
            if read_token != Some(token) {
                self.channels.remove(&token);
            }
        }

        if disconnect {
            for token in [read_token, write_token].into_iter().flatten() {
                if except_token == 0 || token != except_token {
                    self.pipe.disconnect_instance(token);
                }
            }
        }

        for session in sessions {
            self.socks.disconnect_session(session);
        }
    }
}
