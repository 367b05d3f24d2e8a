//! Multiplexer for established target TCP sockets.
//!
//! Sockets are registered under a caller-chosen 64-bit id once connected and
//! stay owned by the multiplexer until they disconnect or the owner
//! unregisters them. Traffic surfaces as [`TcpEvent`]s on the channel handed
//! out at construction; the owner may drop the receiver at any time.
//!
//! One read loop and one write loop run per registered socket. Buffers queued
//! for the same socket are written in FIFO order; a partial `write` keeps the
//! residual bytes at the head of the queue so byte order is preserved.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Size of the per-socket receive buffer.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// How long the loops may park before re-checking the stop flag.
const LOOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Traffic events emitted toward the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpEvent {
    /// Bytes read from the socket registered under `id`.
    Received { id: u64, data: Vec<u8> },
    /// The socket closed or failed; it has been unregistered.
    Disconnected { id: u64 },
}

struct SocketEntry {
    stream: TcpStream,
    queue_tx: Sender<Vec<u8>>,
    read_handle: Option<JoinHandle<()>>,
    write_handle: Option<JoinHandle<()>>,
}

struct Shared {
    sockets: Mutex<HashMap<u64, SocketEntry>>,
    events: Sender<TcpEvent>,
    stopped: AtomicBool,
}

impl Shared {
    /// Unregisters `id` and emits `Disconnected` if it was still registered.
    fn drop_socket(self: &Arc<Self>, id: u64) {
        let entry = self.sockets.lock().unwrap().remove(&id);
        if let Some(entry) = entry {
            let _ = entry.stream.shutdown(Shutdown::Both);
            let _ = self.events.send(TcpEvent::Disconnected { id });
        }
    }
}

/// Registry of connected target sockets with per-socket FIFO output.
pub struct TcpMux {
    shared: Arc<Shared>,
}

impl TcpMux {
    /// Creates the multiplexer and hands out its event stream.
    pub fn new() -> (Arc<TcpMux>, Receiver<TcpEvent>) {
        let (events_tx, events_rx) = unbounded();
        let mux = Arc::new(TcpMux {
            shared: Arc::new(Shared {
                sockets: Mutex::new(HashMap::new()),
                events: events_tx,
                stopped: AtomicBool::new(false),
            }),
        });
        (mux, events_rx)
    }

    /// Takes ownership of a connected, blocking-mode stream under `id`.
    ///
    /// Refuses a zero id, a duplicate id, and anything after `stop()`.
    pub fn register(&self, id: u64, stream: TcpStream) -> bool {
        if id == 0 || self.shared.stopped.load(Ordering::SeqCst) {
            return false;
        }
        if stream.set_read_timeout(Some(LOOP_TIMEOUT)).is_err() {
            return false;
        }
        let (read_stream, write_stream) = match (stream.try_clone(), stream.try_clone()) {
            (Ok(r), Ok(w)) => (r, w),
            _ => return false,
        };

        let (queue_tx, queue_rx) = unbounded();
        {
            let mut sockets = self.shared.sockets.lock().unwrap();
            if sockets.contains_key(&id) {
                return false;
            }
            sockets.insert(
                id,
                SocketEntry { stream, queue_tx, read_handle: None, write_handle: None },
            );
        }

        let read_handle = {
            let shared = Arc::clone(&self.shared);
            thread::spawn(move || read_loop(shared, id, read_stream))
        };
        let write_handle = {
            let shared = Arc::clone(&self.shared);
            thread::spawn(move || write_loop(shared, id, write_stream, queue_rx))
        };

        let mut sockets = self.shared.sockets.lock().unwrap();
        if let Some(entry) = sockets.get_mut(&id) {
            entry.read_handle = Some(read_handle);
            entry.write_handle = Some(write_handle);
        }
        true
    }

    /// Queues `data` for writing on the socket registered under `id`.
    pub fn send(&self, id: u64, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return true;
        }
        let sockets = self.shared.sockets.lock().unwrap();
        match sockets.get(&id) {
            Some(entry) => entry.queue_tx.send(data).is_ok(),
            None => false,
        }
    }

    /// True while `id` maps to a live socket.
    pub fn is_registered(&self, id: u64) -> bool {
        self.shared.sockets.lock().unwrap().contains_key(&id)
    }

    /// Owner-initiated teardown: half-closes both directions and
    /// unregisters. No `Disconnected` event is emitted.
    pub fn disconnect(&self, id: u64) {
        let entry = self.shared.sockets.lock().unwrap().remove(&id);
        if let Some(entry) = entry {
            let _ = entry.stream.shutdown(Shutdown::Both);
        }
    }

    /// Shuts every socket down and joins the loops. Idempotent.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let entries: Vec<SocketEntry> = {
            let mut sockets = self.shared.sockets.lock().unwrap();
            sockets.drain().map(|(_, entry)| entry).collect()
        };
        for mut entry in entries {
            let _ = entry.stream.shutdown(Shutdown::Both);
            for handle in [entry.read_handle.take(), entry.write_handle.take()] {
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
            }
        }
    }
}

fn read_loop(shared: Arc<Shared>, id: u64, mut stream: TcpStream) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                trace!("socket {:#x}: clean close", id);
                shared.drop_socket(id);
                return;
            }
            Ok(n) => {
                let _ = shared.events.send(TcpEvent::Received { id, data: buf[..n].to_vec() });
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                debug!("socket {:#x}: read failed: {}", id, e);
                shared.drop_socket(id);
                return;
            }
        }
    }
}

fn write_loop(shared: Arc<Shared>, id: u64, mut stream: TcpStream, queue_rx: Receiver<Vec<u8>>) {
    loop {
        match queue_rx.recv_timeout(LOOP_TIMEOUT) {
            Ok(buf) => {
                let mut offset = 0;
                while offset < buf.len() {
                    if shared.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    match stream.write(&buf[offset..]) {
                        Ok(0) => {
                            shared.drop_socket(id);
                            return;
                        }
                        Ok(n) => offset += n,
                        Err(e)
                            if matches!(
                                e.kind(),
                                ErrorKind::WouldBlock
                                    | ErrorKind::TimedOut
                                    | ErrorKind::Interrupted
                            ) => {}
                        Err(e) => {
                            debug!("socket {:#x}: write failed: {}", id, e);
                            shared.drop_socket(id);
                            return;
                        }
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shared.stopped.load(Ordering::SeqCst) {
                    return;
                }
            }
            // The entry is gone; nothing left to write.
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddr, TcpListener};

    /// Echo server on an ephemeral port.
    fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn recv_data(events: &Receiver<TcpEvent>, id: u64) -> Vec<u8> {
        let deadline = Duration::from_secs(5);
        match events.recv_timeout(deadline).unwrap() {
            TcpEvent::Received { id: got, data } => {
                assert_eq!(got, id);
                data
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_register_and_echo() {
        let addr = echo_server();
        let (mux, events) = TcpMux::new();

        let stream = TcpStream::connect(addr).unwrap();
        assert!(mux.register(7, stream));
        assert!(mux.is_registered(7));

        assert!(mux.send(7, b"ping pong".to_vec()));
        assert_eq!(recv_data(&events, 7), b"ping pong");

        mux.stop();
    }

    #[test]
    fn test_register_rejects_zero_and_duplicate_ids() {
        let addr = echo_server();
        let (mux, _events) = TcpMux::new();

        assert!(!mux.register(0, TcpStream::connect(addr).unwrap()));
        assert!(mux.register(1, TcpStream::connect(addr).unwrap()));
        assert!(!mux.register(1, TcpStream::connect(addr).unwrap()));

        mux.stop();
    }

    #[test]
    fn test_send_to_unknown_id_fails() {
        let (mux, _events) = TcpMux::new();
        assert!(!mux.send(99, b"x".to_vec()));
        mux.stop();
    }

    #[test]
    fn test_sends_keep_fifo_order() {
        let addr = echo_server();
        let (mux, events) = TcpMux::new();
        mux.register(3, TcpStream::connect(addr).unwrap());

        for i in 0..20u8 {
            assert!(mux.send(3, vec![i; 64]));
        }

        let mut echoed = Vec::new();
        while echoed.len() < 20 * 64 {
            echoed.extend_from_slice(&recv_data(&events, 3));
        }
        let mut expected = Vec::new();
        for i in 0..20u8 {
            expected.extend_from_slice(&[i; 64]);
        }
        assert_eq!(echoed, expected);

        mux.stop();
    }

    #[test]
    fn test_peer_close_emits_disconnected_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (mux, events) = TcpMux::new();

        let stream = TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        mux.register(5, stream);

        drop(accepted); // remote side goes away

        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            TcpEvent::Disconnected { id: 5 }
        );
        assert!(!mux.is_registered(5));
        assert!(
            events.recv_timeout(Duration::from_millis(200)).is_err(),
            "disconnect must be reported exactly once"
        );

        mux.stop();
    }

    #[test]
    fn test_disconnect_is_silent_and_idempotent() {
        let addr = echo_server();
        let (mux, events) = TcpMux::new();
        mux.register(9, TcpStream::connect(addr).unwrap());

        mux.disconnect(9);
        mux.disconnect(9); // second call is a no-op

        assert!(!mux.is_registered(9));
        assert!(!mux.send(9, b"x".to_vec()));
        assert!(
            events.recv_timeout(Duration::from_millis(200)).is_err(),
            "owner-initiated disconnect emits no event"
        );

        mux.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let addr = echo_server();
        let (mux, _events) = TcpMux::new();
        mux.register(2, TcpStream::connect(addr).unwrap());

        mux.stop();
        mux.stop();
        assert!(!mux.register(4, TcpStream::connect(addr).unwrap()));
    }
}
