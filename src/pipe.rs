//! Multi-instance server for the local duplex endpoint.
//!
//! One Unix-domain stream socket path serves any number of concurrent peer
//! connections ("instances"). Each instance gets a stable non-zero token that
//! stays unique for the server's lifetime, outliving the handle behind it.
//!
//! Writes are admission-controlled: at most [`MAX_PENDING_WRITES`] buffers
//! are in flight per instance, queued on a bounded channel the write loop
//! drains in FIFO order. Excess buffers wait in an overflow queue and move
//! into the window as writes complete, so `send` never blocks and a slowly
//! reading peer cannot grow the kernel-side backlog without bound.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Stable identifier of one accepted instance.
pub type InstanceToken = u64;

/// Size of the per-instance read buffer.
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Cap on concurrently in-flight writes per instance.
pub const MAX_PENDING_WRITES: usize = 10;

/// How long the loops may park before re-checking the stop flag.
const LOOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval of the accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Events emitted toward the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeEvent {
    /// A peer connected; a fresh instance exists under this token.
    Connected(InstanceToken),
    /// Bytes arrived on an instance.
    Recv { token: InstanceToken, data: Vec<u8> },
    /// One queued buffer was fully written; `queued` is what remains.
    Sent { token: InstanceToken, len: usize, queued: usize },
    /// The instance closed from the peer side or failed.
    Closed(InstanceToken),
}

struct Instance {
    stream: UnixStream,
    window_tx: Sender<Vec<u8>>,
    overflow: Arc<Mutex<VecDeque<Vec<u8>>>>,
    read_handle: Option<JoinHandle<()>>,
    write_handle: Option<JoinHandle<()>>,
}

struct Shared {
    path: PathBuf,
    instances: Mutex<HashMap<InstanceToken, Instance>>,
    events: Sender<PipeEvent>,
    stopped: AtomicBool,
    next_token: AtomicU64,
}

impl Shared {
    /// Closes `token` and emits `Closed` if it was still registered.
    fn close_instance(self: &Arc<Self>, token: InstanceToken) {
        let instance = self.instances.lock().unwrap().remove(&token);
        if let Some(instance) = instance {
            let _ = instance.stream.shutdown(Shutdown::Both);
            let _ = self.events.send(PipeEvent::Closed(token));
        }
    }
}

/// The endpoint server.
pub struct PipeServer {
    shared: Arc<Shared>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PipeServer {
    /// Creates the server for `path` and hands out its event stream.
    /// Nothing is bound until `launch()`.
    pub fn new<P: AsRef<Path>>(path: P) -> (Arc<PipeServer>, Receiver<PipeEvent>) {
        let (events_tx, events_rx) = unbounded();
        let server = Arc::new(PipeServer {
            shared: Arc::new(Shared {
                path: path.as_ref().to_path_buf(),
                instances: Mutex::new(HashMap::new()),
                events: events_tx,
                stopped: AtomicBool::new(false),
                next_token: AtomicU64::new(1),
            }),
            accept_handle: Mutex::new(None),
        });
        (server, events_rx)
    }

    /// Path of the endpoint.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Binds the endpoint and starts accepting. A no-op when already
    /// launched or when the stop flag was raised first.
    pub fn launch(&self) -> std::io::Result<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.accept_handle.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }

        // A stale socket file from a previous run would make bind fail.
        if self.shared.path.exists() {
            let _ = fs::remove_file(&self.shared.path);
        }

        let listener = UnixListener::bind(&self.shared.path)?;
        listener.set_nonblocking(true)?;

        let shared = Arc::clone(&self.shared);
        *guard = Some(thread::spawn(move || accept_loop(shared, listener)));
        Ok(())
    }

    /// Queues `data` for writing on an instance. Never blocks: buffers past
    /// the in-flight window wait in the overflow queue. False when the token
    /// no longer resolves.
    pub fn send(&self, token: InstanceToken, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return true;
        }
        let instances = self.shared.instances.lock().unwrap();
        let Some(instance) = instances.get(&token) else {
            return false;
        };

        let mut overflow = instance.overflow.lock().unwrap();
        if overflow.is_empty() {
            match instance.window_tx.try_send(data) {
                Ok(()) => return true,
                Err(TrySendError::Full(data)) => {
                    overflow.push_back(data);
                    return true;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
        overflow.push_back(data);
        true
    }

    /// Queued-but-unwritten buffer count for an instance (in-flight window
    /// plus overflow).
    pub fn output_queue_len(&self, token: InstanceToken) -> usize {
        let instances = self.shared.instances.lock().unwrap();
        match instances.get(&token) {
            Some(instance) => instance.window_tx.len() + instance.overflow.lock().unwrap().len(),
            None => 0,
        }
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.shared.instances.lock().unwrap().len()
    }

    /// Owner-initiated close of one instance. No `Closed` event is emitted;
    /// false when the token was already gone.
    pub fn disconnect_instance(&self, token: InstanceToken) -> bool {
        let instance = self.shared.instances.lock().unwrap().remove(&token);
        match instance {
            Some(instance) => {
                trace!("instance {}: disconnected by owner", token);
                let _ = instance.stream.shutdown(Shutdown::Both);
                true
            }
            None => false,
        }
    }

    /// Stops accepting, closes every instance, unlinks the socket file.
    /// Idempotent.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        let instances: Vec<Instance> = {
            let mut map = self.shared.instances.lock().unwrap();
            map.drain().map(|(_, instance)| instance).collect()
        };
        for mut instance in instances {
            let _ = instance.stream.shutdown(Shutdown::Both);
            for handle in [instance.read_handle.take(), instance.write_handle.take()] {
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
            }
        }

        let _ = fs::remove_file(&self.shared.path);
    }
}

fn accept_loop(shared: Arc<Shared>, listener: UnixListener) {
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => setup_instance(&shared, stream),
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("endpoint accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn setup_instance(shared: &Arc<Shared>, stream: UnixStream) {
    let token = shared.next_token.fetch_add(1, Ordering::SeqCst);

    let configured = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(LOOP_TIMEOUT)));
    if let Err(e) = configured {
        debug!("instance {}: setup failed: {}", token, e);
        return;
    }
    let (read_stream, write_stream) = match (stream.try_clone(), stream.try_clone()) {
        (Ok(r), Ok(w)) => (r, w),
        _ => return,
    };

    let (window_tx, window_rx) = bounded(MAX_PENDING_WRITES);
    let overflow = Arc::new(Mutex::new(VecDeque::new()));

    shared.instances.lock().unwrap().insert(
        token,
        Instance {
            stream,
            window_tx: window_tx.clone(),
            overflow: Arc::clone(&overflow),
            read_handle: None,
            write_handle: None,
        },
    );

    trace!("instance {}: connected", token);
    let _ = shared.events.send(PipeEvent::Connected(token));

    let read_handle = {
        let shared = Arc::clone(shared);
        thread::spawn(move || read_loop(shared, token, read_stream))
    };
    let write_handle = {
        let shared = Arc::clone(shared);
        thread::spawn(move || write_loop(shared, token, write_stream, window_tx, window_rx, overflow))
    };

    let mut instances = shared.instances.lock().unwrap();
    if let Some(instance) = instances.get_mut(&token) {
        instance.read_handle = Some(read_handle);
        instance.write_handle = Some(write_handle);
    }
}

fn read_loop(shared: Arc<Shared>, token: InstanceToken, mut stream: UnixStream) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];

    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                trace!("instance {}: peer closed", token);
                shared.close_instance(token);
                return;
            }
            Ok(n) => {
                let _ = shared.events.send(PipeEvent::Recv { token, data: buf[..n].to_vec() });
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                debug!("instance {}: read failed: {}", token, e);
                shared.close_instance(token);
                return;
            }
        }
    }
}

fn write_loop(
    shared: Arc<Shared>,
    token: InstanceToken,
    mut stream: UnixStream,
    window_tx: Sender<Vec<u8>>,
    window_rx: Receiver<Vec<u8>>,
    overflow: Arc<Mutex<VecDeque<Vec<u8>>>>,
) {
    loop {
        match window_rx.recv_timeout(LOOP_TIMEOUT) {
            Ok(buf) => {
                if let Err(e) = stream.write_all(&buf) {
                    debug!("instance {}: write failed: {}", token, e);
                    shared.close_instance(token);
                    return;
                }

                // Move waiting buffers into the freed window slot(s), oldest
                // first, then report the write.
                let queued = {
                    let mut overflow = overflow.lock().unwrap();
                    while let Some(next) = overflow.pop_front() {
                        match window_tx.try_send(next) {
                            Ok(()) => {}
                            Err(TrySendError::Full(next)) => {
                                overflow.push_front(next);
                                break;
                            }
                            Err(TrySendError::Disconnected(_)) => break,
                        }
                    }
                    overflow.len() + window_rx.len()
                };
                let _ = shared.events.send(PipeEvent::Sent { token, len: buf.len(), queued });
            }
            Err(RecvTimeoutError::Timeout) => {
                // This loop keeps a window sender for the refill path, so the
                // channel never reports disconnected on its own; poll the
                // registry instead.
                if shared.stopped.load(Ordering::SeqCst)
                    || !shared.instances.lock().unwrap().contains_key(&token)
                {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static PATH_SEQ: AtomicU32 = AtomicU32::new(0);

    fn endpoint_path() -> PathBuf {
        std::env::temp_dir().join(format!(
            "sockspipe-pipe-test-{}-{}",
            std::process::id(),
            PATH_SEQ.fetch_add(1, Ordering::SeqCst)
        ))
    }

    fn server() -> (Arc<PipeServer>, Receiver<PipeEvent>, PathBuf) {
        let path = endpoint_path();
        let (server, events) = PipeServer::new(&path);
        server.launch().unwrap();
        (server, events, path)
    }

    fn expect_connected(events: &Receiver<PipeEvent>) -> InstanceToken {
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            PipeEvent::Connected(token) => token,
            other => panic!("unexpected event {:?}", other),
        }
    }

    fn recv_bytes(events: &Receiver<PipeEvent>, want_token: InstanceToken) -> Vec<u8> {
        loop {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                PipeEvent::Recv { token, data } => {
                    assert_eq!(token, want_token);
                    return data;
                }
                PipeEvent::Sent { .. } => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_accept_and_recv() {
        let (server, events, path) = server();

        let mut peer = UnixStream::connect(&path).unwrap();
        let token = expect_connected(&events);
        assert_ne!(token, 0);
        assert_eq!(server.instance_count(), 1);

        peer.write_all(b"over the pipe").unwrap();
        assert_eq!(recv_bytes(&events, token), b"over the pipe");

        server.stop();
    }

    #[test]
    fn test_tokens_are_unique_per_instance() {
        let (server, events, path) = server();

        let _a = UnixStream::connect(&path).unwrap();
        let _b = UnixStream::connect(&path).unwrap();
        let ta = expect_connected(&events);
        let tb = expect_connected(&events);
        assert_ne!(ta, tb);

        server.stop();
    }

    #[test]
    fn test_send_reaches_peer_and_reports_sent() {
        let (server, events, path) = server();

        let mut peer = UnixStream::connect(&path).unwrap();
        let token = expect_connected(&events);

        assert!(server.send(token, b"hello peer".to_vec()));
        let mut buf = [0u8; 32];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello peer");

        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            PipeEvent::Sent { token: t, len, .. } => {
                assert_eq!(t, token);
                assert_eq!(len, 10);
            }
            other => panic!("unexpected event {:?}", other),
        }

        server.stop();
    }

    #[test]
    fn test_peer_close_emits_closed() {
        let (server, events, path) = server();

        let peer = UnixStream::connect(&path).unwrap();
        let token = expect_connected(&events);
        drop(peer);

        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            PipeEvent::Closed(token)
        );
        assert_eq!(server.instance_count(), 0);

        server.stop();
    }

    #[test]
    fn test_excess_writes_wait_in_overflow() {
        let (server, events, path) = server();

        // Peer that never reads: the write loop blocks inside the kernel
        // once its buffers fill, so queued submissions pile up behind it.
        let _peer = UnixStream::connect(&path).unwrap();
        let token = expect_connected(&events);

        let chunk = vec![0x42u8; 256 * 1024];
        let mut accepted = 0usize;
        for _ in 0..MAX_PENDING_WRITES + 5 {
            assert!(server.send(token, chunk.clone()));
            accepted += 1;
        }
        assert_eq!(accepted, MAX_PENDING_WRITES + 5);

        // At least the submissions beyond the window plus the one stuck in
        // the kernel write must still be queued.
        assert!(server.output_queue_len(token) >= 4);

        server.stop();
    }

    #[test]
    fn test_disconnect_instance_is_silent_and_idempotent() {
        let (server, events, path) = server();

        let _peer = UnixStream::connect(&path).unwrap();
        let token = expect_connected(&events);

        assert!(server.disconnect_instance(token));
        assert!(!server.disconnect_instance(token));
        assert!(!server.send(token, b"x".to_vec()));
        assert!(
            events.recv_timeout(Duration::from_millis(200)).is_err(),
            "owner-initiated disconnect emits no event"
        );

        server.stop();
    }

    #[test]
    fn test_stop_unlinks_socket_and_is_idempotent() {
        let (server, _events, path) = server();
        assert!(path.exists());

        server.stop();
        server.stop();
        assert!(!path.exists());

        // stop flag raised: launch is a no-op and binds nothing
        server.launch().unwrap();
        assert!(!path.exists());
    }
}
