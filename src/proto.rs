//! Wire protocol for the pipe endpoint.
//!
//! Every frame is a 17-byte header followed by an opcode-dependent payload.
//! All multi-byte integers are little-endian on the wire. The CRC-32 covers
//! the whole frame with the CRC field itself zeroed.
//!
//! Peers are required to send a `channel_setup` frame before anything else on
//! a freshly connected instance. A client with limited asynchronous I/O
//! support may connect twice and declare one instance read-only and the other
//! write-only instead of using a single duplex instance.

use bytes::{Buf, BytesMut};
use rand::Rng;

/// Identifier the server assigns to a logical peer.
pub type ClientId = u64;

/// Identifier the peer assigns to one of its SOCKS sessions.
pub type SocksId = u64;

/// Zero is reserved as "invalid" in every identifier space.
pub const INVALID_CLIENT_ID: ClientId = 0;
pub const INVALID_SOCKS_ID: SocksId = 0;

/// First four bytes of every frame.
pub const MAGIC: [u8; 4] = [0xe4, 0x85, 0xb4, 0xb2];

/// Header size: magic(4) + len(4) + crc32(4) + uid(4) + opcode(1).
pub const HEADER_SIZE: usize = 17;

/// Hard cap on a whole frame, header included.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload that fits under [`MAX_FRAME_SIZE`].
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

// Opcodes.
pub const OP_CHANNEL_SETUP: u8 = 1;
pub const OP_CHANNEL_SETUP_ACK: u8 = 2;
pub const OP_STATUS: u8 = 5;
pub const OP_PING: u8 = 10;
pub const OP_SOCKS: u8 = 150;
pub const OP_SOCKS_CLOSE: u8 = 151;
pub const OP_SOCKS_DISCONNECTED: u8 = 152;
pub const OP_UNINSTALL_SELF: u8 = 240;

// Status codes carried by `status` frames.
pub const STATUS_OK: u8 = 0;
pub const STATUS_UNSUPPORTED: u8 = 1;

// Channel-setup direction flags, expressed from the peer's perspective.
// The server inverts them for its own bookkeeping: a channel the peer reads
// from is a channel the server writes to, and vice-versa.
pub const SETUP_READ: u32 = 0x01;
pub const SETUP_WRITE: u32 = 0x02;
pub const SETUP_DUPLEX: u32 = SETUP_READ | SETUP_WRITE;

/// One decoded frame, header fields already converted to host order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request identifier. Non-zero in requests; responses echo it.
    pub uid: u32,
    pub body: FrameBody,
}

/// Opcode-dependent payload of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    ChannelSetup { client_id: ClientId, flags: u32 },
    ChannelSetupAck { client_id: ClientId },
    Status(u8),
    Ping,
    Socks { socks_id: SocksId, data: Vec<u8> },
    SocksClose { socks_id: SocksId },
    SocksDisconnected { socks_id: SocksId },
    UninstallSelf,
    /// Complete, CRC-valid frame with an opcode this codec does not know.
    /// Answering it (`status(unsupported)`) is the dispatcher's business.
    Unknown(u8),
}

/// Outcome of one [`extract_next_frame`] call.
///
/// Every variant documents how the input buffer was advanced, so a caller can
/// keep feeding the same buffer and the scanner resynchronizes on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extract {
    /// A complete, CRC-verified frame; the buffer was advanced past it.
    Frame(Frame),
    /// Magic found but not enough bytes yet; garbage before the magic was
    /// dropped, the rest preserved.
    Incomplete,
    /// No magic anywhere; the whole buffer was discarded.
    Garbage,
    /// Length field inconsistent with the opcode's payload shape; the
    /// declared number of bytes was dropped.
    Malformed,
    /// Declared length exceeds [`MAX_FRAME_SIZE`]; only the magic was
    /// dropped so scanning resumes at the next candidate.
    TooBig,
    /// CRC mismatch; the declared number of bytes was dropped.
    BadCrc,
}

/// Extracts at most one frame from the front of `stream`.
pub fn extract_next_frame(stream: &mut BytesMut) -> Extract {
    if stream.is_empty() {
        return Extract::Incomplete;
    }

    let start = match find_magic(&stream[..]) {
        Some(pos) => pos,
        None => {
            stream.clear();
            return Extract::Garbage;
        }
    };

    // Drop leading garbage so every offset below is frame-relative.
    if start > 0 {
        stream.advance(start);
    }

    if stream.len() < HEADER_SIZE {
        return Extract::Incomplete;
    }

    let declared = read_u32(&stream[4..8]) as usize;

    if declared > MAX_FRAME_SIZE {
        stream.advance(MAGIC.len());
        return Extract::TooBig;
    }
    if declared < HEADER_SIZE {
        // Cannot even hold the header. Still advance past the magic so the
        // scanner does not find the same bogus candidate forever.
        stream.advance(declared.max(MAGIC.len()));
        return Extract::Malformed;
    }
    if declared > stream.len() {
        return Extract::Incomplete;
    }

    if packet_crc32(&stream[..declared]) != read_u32(&stream[8..12]) {
        stream.advance(declared);
        return Extract::BadCrc;
    }

    let opcode = stream[16];
    let payload_len = declared - HEADER_SIZE;
    let length_ok = match opcode {
        OP_CHANNEL_SETUP => payload_len == 12,
        OP_CHANNEL_SETUP_ACK => payload_len == 8,
        OP_STATUS => payload_len == 1,
        OP_PING | OP_UNINSTALL_SELF => payload_len == 0,
        OP_SOCKS => payload_len > 8,
        OP_SOCKS_CLOSE | OP_SOCKS_DISCONNECTED => payload_len == 8,
        _ => true, // unknown opcodes carry whatever they carry
    };
    if !length_ok {
        stream.advance(declared);
        return Extract::Malformed;
    }

    let packet = stream.split_to(declared);
    let uid = read_u32(&packet[12..16]);
    let payload = &packet[HEADER_SIZE..];

    let body = match opcode {
        OP_CHANNEL_SETUP => FrameBody::ChannelSetup {
            client_id: read_u64(&payload[..8]),
            flags: read_u32(&payload[8..12]),
        },
        OP_CHANNEL_SETUP_ACK => FrameBody::ChannelSetupAck {
            client_id: read_u64(&payload[..8]),
        },
        OP_STATUS => FrameBody::Status(payload[0]),
        OP_PING => FrameBody::Ping,
        OP_SOCKS => FrameBody::Socks {
            socks_id: read_u64(&payload[..8]),
            data: payload[8..].to_vec(),
        },
        OP_SOCKS_CLOSE => FrameBody::SocksClose {
            socks_id: read_u64(&payload[..8]),
        },
        OP_SOCKS_DISCONNECTED => FrameBody::SocksDisconnected {
            socks_id: read_u64(&payload[..8]),
        },
        OP_UNINSTALL_SELF => FrameBody::UninstallSelf,
        other => FrameBody::Unknown(other),
    };

    Extract::Frame(Frame { uid, body })
}

/// CRC-32 (IEEE 802.3) over a whole frame with the CRC field zeroed.
pub fn packet_crc32(packet: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&packet[..8]);
    hasher.update(&[0u8; 4]);
    hasher.update(&packet[12..]);
    hasher.finalize()
}

/// Draws a fresh non-zero request identifier.
pub fn generate_uid() -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let uid: u32 = rng.gen();
        if uid != 0 {
            return uid;
        }
    }
}

/// Draws a fresh non-zero client identifier. Uniqueness among live clients
/// is the caller's business (rejection sampling against its table).
pub fn generate_client_id() -> ClientId {
    let mut rng = rand::thread_rng();
    loop {
        let id: ClientId = rng.gen();
        if id != INVALID_CLIENT_ID {
            return id;
        }
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC.len()).position(|w| w == &MAGIC[..])
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn read_u64(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn new_packet(uid: Option<u32>, opcode: u8, payload_len: usize) -> Vec<u8> {
    debug_assert!(payload_len <= MAX_PAYLOAD_SIZE);

    let total = HEADER_SIZE + payload_len;
    let mut packet = vec![0u8; total];
    packet[..4].copy_from_slice(&MAGIC);
    packet[4..8].copy_from_slice(&(total as u32).to_le_bytes());
    packet[12..16].copy_from_slice(&uid.unwrap_or_else(generate_uid).to_le_bytes());
    packet[16] = opcode;
    packet
}

fn seal_packet(mut packet: Vec<u8>) -> Vec<u8> {
    let crc = packet_crc32(&packet);
    packet[8..12].copy_from_slice(&crc.to_le_bytes());
    packet
}

pub fn make_channel_setup(client_id: ClientId, flags: u32) -> Vec<u8> {
    let mut packet = new_packet(None, OP_CHANNEL_SETUP, 12);
    packet[HEADER_SIZE..HEADER_SIZE + 8].copy_from_slice(&client_id.to_le_bytes());
    packet[HEADER_SIZE + 8..HEADER_SIZE + 12].copy_from_slice(&flags.to_le_bytes());
    seal_packet(packet)
}

pub fn make_channel_setup_ack(uid: u32, client_id: ClientId) -> Vec<u8> {
    let mut packet = new_packet(Some(uid), OP_CHANNEL_SETUP_ACK, 8);
    packet[HEADER_SIZE..HEADER_SIZE + 8].copy_from_slice(&client_id.to_le_bytes());
    seal_packet(packet)
}

pub fn make_status(uid: u32, status: u8) -> Vec<u8> {
    let mut packet = new_packet(Some(uid), OP_STATUS, 1);
    packet[HEADER_SIZE] = status;
    seal_packet(packet)
}

pub fn make_ping() -> Vec<u8> {
    seal_packet(new_packet(None, OP_PING, 0))
}

pub fn make_socks(socks_id: SocksId, data: &[u8]) -> Vec<u8> {
    debug_assert!(socks_id != INVALID_SOCKS_ID);
    debug_assert!(!data.is_empty());

    let mut packet = new_packet(None, OP_SOCKS, 8 + data.len());
    packet[HEADER_SIZE..HEADER_SIZE + 8].copy_from_slice(&socks_id.to_le_bytes());
    packet[HEADER_SIZE + 8..].copy_from_slice(data);
    seal_packet(packet)
}

pub fn make_socks_close(socks_id: SocksId) -> Vec<u8> {
    debug_assert!(socks_id != INVALID_SOCKS_ID);

    let mut packet = new_packet(None, OP_SOCKS_CLOSE, 8);
    packet[HEADER_SIZE..HEADER_SIZE + 8].copy_from_slice(&socks_id.to_le_bytes());
    seal_packet(packet)
}

pub fn make_socks_disconnected(socks_id: SocksId) -> Vec<u8> {
    debug_assert!(socks_id != INVALID_SOCKS_ID);

    let mut packet = new_packet(None, OP_SOCKS_DISCONNECTED, 8);
    packet[HEADER_SIZE..HEADER_SIZE + 8].copy_from_slice(&socks_id.to_le_bytes());
    seal_packet(packet)
}

pub fn make_uninstall_self() -> Vec<u8> {
    seal_packet(new_packet(None, OP_UNINSTALL_SELF, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_one(bytes: &[u8]) -> Extract {
        let mut stream = BytesMut::from(bytes);
        let out = extract_next_frame(&mut stream);
        if let Extract::Frame(_) = out {
            assert!(stream.is_empty(), "frame should consume the whole packet");
        }
        out
    }

    fn expect_frame(bytes: &[u8]) -> Frame {
        match extract_one(bytes) {
            Extract::Frame(frame) => frame,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_setup_roundtrip() {
        let packet = make_channel_setup(0, SETUP_DUPLEX);
        assert_eq!(packet.len(), HEADER_SIZE + 12);

        let frame = expect_frame(&packet);
        assert_ne!(frame.uid, 0);
        assert_eq!(
            frame.body,
            FrameBody::ChannelSetup { client_id: 0, flags: SETUP_DUPLEX }
        );
    }

    #[test]
    fn test_channel_setup_ack_echoes_uid() {
        let packet = make_channel_setup_ack(0x11563412, 0xdead_beef_cafe_f00d);
        let frame = expect_frame(&packet);
        assert_eq!(frame.uid, 0x11563412);
        assert_eq!(
            frame.body,
            FrameBody::ChannelSetupAck { client_id: 0xdead_beef_cafe_f00d }
        );
    }

    #[test]
    fn test_status_roundtrip() {
        let frame = expect_frame(&make_status(42, STATUS_UNSUPPORTED));
        assert_eq!(frame.uid, 42);
        assert_eq!(frame.body, FrameBody::Status(STATUS_UNSUPPORTED));
    }

    #[test]
    fn test_ping_and_uninstall_roundtrip() {
        assert_eq!(expect_frame(&make_ping()).body, FrameBody::Ping);
        assert_eq!(
            expect_frame(&make_uninstall_self()).body,
            FrameBody::UninstallSelf
        );
    }

    #[test]
    fn test_socks_roundtrip() {
        let inner = vec![5u8, 1, 0];
        let frame = expect_frame(&make_socks(7, &inner));
        assert_eq!(frame.body, FrameBody::Socks { socks_id: 7, data: inner });
    }

    #[test]
    fn test_socks_close_and_disconnected_roundtrip() {
        assert_eq!(
            expect_frame(&make_socks_close(9)).body,
            FrameBody::SocksClose { socks_id: 9 }
        );
        assert_eq!(
            expect_frame(&make_socks_disconnected(9)).body,
            FrameBody::SocksDisconnected { socks_id: 9 }
        );
    }

    #[test]
    fn test_empty_stream_is_incomplete() {
        let mut stream = BytesMut::new();
        assert_eq!(extract_next_frame(&mut stream), Extract::Incomplete);
    }

    #[test]
    fn test_garbage_only_clears_stream() {
        let mut stream = BytesMut::from(&b"no magic in here at all"[..]);
        assert_eq!(extract_next_frame(&mut stream), Extract::Garbage);
        assert!(stream.is_empty());
    }

    #[test]
    fn test_garbage_prefix_is_skipped() {
        let mut bytes = b"leading junk".to_vec();
        bytes.extend_from_slice(&make_ping());

        let mut stream = BytesMut::from(&bytes[..]);
        match extract_next_frame(&mut stream) {
            Extract::Frame(frame) => assert_eq!(frame.body, FrameBody::Ping),
            other => panic!("expected a frame, got {:?}", other),
        }
        assert!(stream.is_empty());
    }

    #[test]
    fn test_truncated_header_keeps_tail() {
        let packet = make_ping();
        let mut stream = BytesMut::from(&packet[..HEADER_SIZE - 3]);
        assert_eq!(extract_next_frame(&mut stream), Extract::Incomplete);
        assert_eq!(stream.len(), HEADER_SIZE - 3);

        stream.extend_from_slice(&packet[HEADER_SIZE - 3..]);
        assert!(matches!(extract_next_frame(&mut stream), Extract::Frame(_)));
    }

    #[test]
    fn test_truncated_payload_keeps_tail() {
        let packet = make_socks(1, b"hello");
        let mut stream = BytesMut::from(&packet[..packet.len() - 2]);
        assert_eq!(extract_next_frame(&mut stream), Extract::Incomplete);

        stream.extend_from_slice(&packet[packet.len() - 2..]);
        assert!(matches!(extract_next_frame(&mut stream), Extract::Frame(_)));
    }

    #[test]
    fn test_concatenated_packets_with_interleaved_garbage() {
        let packets = [
            make_channel_setup(0, SETUP_READ),
            make_ping(),
            make_socks(3, b"\x05\x01\x00"),
            make_socks_close(3),
        ];

        let mut stream = BytesMut::new();
        for (i, packet) in packets.iter().enumerate() {
            stream.extend_from_slice(format!("junk#{}", i).as_bytes());
            stream.extend_from_slice(packet);
        }

        let mut frames = Vec::new();
        loop {
            match extract_next_frame(&mut stream) {
                Extract::Frame(frame) => frames.push(frame),
                Extract::Incomplete | Extract::Garbage => break,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(frames.len(), packets.len());
        assert_eq!(frames[1].body, FrameBody::Ping);
    }

    #[test]
    fn test_crc_tamper_is_rejected_and_dropped() {
        let mut packet = make_ping();
        packet[9] ^= 0x01; // flip one CRC byte

        let mut stream = BytesMut::from(&packet[..]);
        stream.extend_from_slice(&make_ping());

        assert_eq!(extract_next_frame(&mut stream), Extract::BadCrc);
        // The tampered frame was dropped by its declared length, so the next
        // one parses without re-scanning it.
        assert!(matches!(extract_next_frame(&mut stream), Extract::Frame(_)));
        assert!(stream.is_empty());
    }

    #[test]
    fn test_payload_tamper_is_a_crc_error() {
        let mut packet = make_status(1, STATUS_OK);
        *packet.last_mut().unwrap() ^= 0x80;
        assert_eq!(extract_one(&packet), Extract::BadCrc);
    }

    #[test]
    fn test_length_mismatch_is_malformed() {
        // A status frame claiming a socks_close payload size. Re-seal so the
        // CRC is valid and only the shape check can fire.
        let mut packet = new_packet(Some(77), OP_STATUS, 8);
        packet[HEADER_SIZE] = STATUS_OK;
        let packet = seal_packet(packet);

        let mut stream = BytesMut::from(&packet[..]);
        stream.extend_from_slice(&make_ping());

        assert_eq!(extract_next_frame(&mut stream), Extract::Malformed);
        assert!(matches!(extract_next_frame(&mut stream), Extract::Frame(_)));
    }

    #[test]
    fn test_socks_requires_inner_payload() {
        // socks frame with the session id but zero inner bytes
        let mut packet = new_packet(Some(5), OP_SOCKS, 8);
        packet[HEADER_SIZE..].copy_from_slice(&7u64.to_le_bytes());
        assert_eq!(extract_one(&seal_packet(packet)), Extract::Malformed);
    }

    #[test]
    fn test_frame_at_cap_is_accepted() {
        let packet = make_socks(1, &vec![0xa5u8; MAX_PAYLOAD_SIZE - 8]);
        assert_eq!(packet.len(), MAX_FRAME_SIZE);
        assert!(matches!(extract_one(&packet), Extract::Frame(_)));
    }

    #[test]
    fn test_frame_over_cap_drops_only_magic() {
        let mut header = vec![0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&MAGIC);
        header[4..8].copy_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_le_bytes());

        let mut stream = BytesMut::from(&header[..]);
        assert_eq!(extract_next_frame(&mut stream), Extract::TooBig);
        // Only the magic was dropped; the scanner resumes right after it.
        assert_eq!(stream.len(), HEADER_SIZE - MAGIC.len());
    }

    #[test]
    fn test_unknown_opcode_passes_the_codec() {
        let mut packet = new_packet(Some(123), 99, 3);
        packet[HEADER_SIZE..].copy_from_slice(b"abc");
        let frame = expect_frame(&seal_packet(packet));
        assert_eq!(frame.uid, 123);
        assert_eq!(frame.body, FrameBody::Unknown(99));
    }

    #[test]
    fn test_reencoding_decoded_fields_matches_crc() {
        let packet = make_socks(11, b"payload bytes");
        let frame = expect_frame(&packet);
        let (socks_id, data) = match frame.body {
            FrameBody::Socks { socks_id, data } => (socks_id, data),
            other => panic!("unexpected body {:?}", other),
        };

        let mut reencoded = make_socks(socks_id, &data);
        // make_socks draws a fresh uid; pin it to the original and re-seal.
        reencoded[12..16].copy_from_slice(&frame.uid.to_le_bytes());
        let reencoded = seal_packet(reencoded);
        assert_eq!(reencoded, packet);
    }

    #[test]
    fn test_generated_ids_are_nonzero() {
        for _ in 0..64 {
            assert_ne!(generate_uid(), 0);
            assert_ne!(generate_client_id(), INVALID_CLIENT_ID);
        }
    }
}
