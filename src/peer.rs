//! One protocol peer: framing state machine, handshake, and keepalive.
//!
//! A [`Peer`] owns one connection end to end: the socket, the byte codec, the
//! packet descriptor table, the incremental parse state, and the
//! content-stream table (see [`crate::content`]). It is driven from outside
//! by readiness events: [`Peer::drain_recv`] on readability,
//! [`Peer::send_step`] once per polling round, [`Peer::flush`] on
//! writability.
//!
//! Framing is a pull-based incremental parser: a single byte dribbling in
//! over many readiness events never blocks progress and never re-parses
//! already-consumed bytes.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::{AsRawFd, RawFd};

use chrono::Utc;
use tracing::{debug, warn};

use crate::codec::ByteCodec;
use crate::content::{self, ContentStream};
use crate::error::{Error, Result};
use crate::packet::{
    FixedHandler, PacketDescriptor, PacketId, PacketTable, VarHandler, ID_CONTENT_CHUNK,
    ID_CONTENT_OPEN, ID_CONTENT_STATUS, ID_HANDSHAKE_REQUEST, ID_HANDSHAKE_RESPONSE, ID_PING,
    ID_PONG, ID_VAR_LENGTH, MAGIC, MAX_PACKET_SIZE, PROTOCOL_MAJOR, PROTOCOL_MINOR,
    USER_PACKET_START,
};
use crate::socket::{RecvStatus, SendStatus, Socket};

/// Capability interface for peer lifecycle and protocol events.
///
/// The engine only ever holds a `&mut E`; implement what you need, the
/// defaults do nothing (and accept all content offers).
pub trait PeerEvents: Sized {
    /// The handshake completed successfully (client side).
    fn on_ready(&mut self, _peer: &mut Peer<Self>) {}
    /// A ping arrived; a pong has already been queued.
    fn on_ping(&mut self, _peer: &mut Peer<Self>, _peer_time: i64, _now: i64) {}
    /// A pong arrived carrying the timestamp of the ping it answers.
    fn on_pong(&mut self, _peer: &mut Peer<Self>, _peer_time: i64, _now: i64) {}
    /// A remote wants to open a content stream toward us. Return `false` to
    /// refuse it.
    fn on_content_offer(&mut self, _peer: &mut Peer<Self>, _content_type: u8, _size: u64) -> bool {
        true
    }
    /// An inbound content stream completed and its digest checked out. The
    /// backing store is rewound to the start.
    fn on_content_received(&mut self, _peer: &mut Peer<Self>, _content: ContentStream) {}
    /// An outbound content stream was fully transmitted.
    fn on_content_sent(&mut self, _peer: &mut Peer<Self>, _content: ContentStream) {}
    /// A new connection was accepted (server side).
    fn on_peer_connected(&mut self, _peer: &mut Peer<Self>) {}
    /// A connection is being torn down. Fired before resources are released.
    fn on_peer_disconnected(&mut self, _peer: &mut Peer<Self>) {}
}

/// Incremental packet parse state. `size` fields are only meaningful in the
/// body states; dispatched bytes are never parsed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    AwaitingId,
    AwaitingVarLength,
    AwaitingVarId { size: u16 },
    AwaitingFixedBody { id: PacketId, size: u16 },
    AwaitingVarBody { id: PacketId, size: u16 },
}

/// Result of one parser step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStep {
    /// The state machine advanced; call again.
    Progress,
    /// The bytes needed for the next step have not arrived yet.
    Idle,
}

/// One connection endpoint with its framing state and content-stream table.
pub struct Peer<E: PeerEvents> {
    pub(crate) socket: Socket,
    pub(crate) codec: ByteCodec,
    state: ParseState,
    table: PacketTable<E>,
    pub(crate) streams: HashMap<u16, ContentStream>,
    pub(crate) pending_send: HashSet<u16>,
    pub(crate) next_stream_id: u16,
    alive: bool,
    pub(crate) handshaken: bool,
    pollout_armed: bool,
}

impl<E: PeerEvents> Peer<E> {
    pub(crate) fn new(socket: Socket, table: PacketTable<E>) -> Self {
        Self {
            socket,
            codec: ByteCodec::new(),
            state: ParseState::AwaitingId,
            table,
            streams: HashMap::new(),
            pending_send: HashSet::new(),
            next_stream_id: 1,
            alive: true,
            handshaken: false,
            pollout_armed: false,
        }
    }

    /// Register an application fixed-size packet on this peer.
    pub fn register_fixed(&mut self, id: PacketId, size: u16, handler: FixedHandler<E>) -> Result<()> {
        if id < USER_PACKET_START {
            return Err(Error::ReservedPacketId(id));
        }
        self.table.register_fixed(id, size, handler)
    }

    /// Register an application variable-length packet on this peer.
    pub fn register_variable(&mut self, id: PacketId, handler: VarHandler<E>) -> Result<()> {
        if id < USER_PACKET_START {
            return Err(Error::ReservedPacketId(id));
        }
        self.table.register_variable(id, handler)
    }

    /// Access the peer's byte codec, e.g. to decode a packet body inside a
    /// handler or queue a reply.
    pub fn codec_mut(&mut self) -> &mut ByteCodec {
        &mut self.codec
    }

    pub fn codec(&self) -> &ByteCodec {
        &self.codec
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Whether the handshake has completed on this connection.
    pub fn is_ready(&self) -> bool {
        self.handshaken
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub(crate) fn pollout_armed(&self) -> bool {
        self.pollout_armed
    }

    pub(crate) fn set_pollout_armed(&mut self, armed: bool) {
        self.pollout_armed = armed;
    }

    /// Install a wire filter on the underlying socket.
    pub fn set_wire_filter(&mut self, filter: Box<dyn crate::socket::WireFilter>) {
        self.socket.set_filter(filter);
    }

    /// Tear the connection down: shutdown, mark dead, discard in-flight
    /// content streams. Idempotent.
    pub fn kill(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;
        self.socket.shutdown();
        self.streams.clear();
        self.pending_send.clear();
    }

    /// Top the inbound buffer up toward `needed` bytes with one non-blocking
    /// receive. Returns true once `needed` bytes are buffered.
    fn fill_inbound(&mut self, needed: usize) -> Result<bool> {
        let have = self.codec.inbound_len();
        if have >= needed {
            return Ok(true);
        }
        match self.socket.receive_into(&mut self.codec, needed - have)? {
            RecvStatus::Received(_) | RecvStatus::WouldBlock => {
                Ok(self.codec.inbound_len() >= needed)
            }
            RecvStatus::Closed => Err(Error::ConnectionClosed),
        }
    }

    /// Advance the framing state machine by one step.
    ///
    /// [`RecvStep::Idle`] means the bytes for the next step have not arrived;
    /// try again on the next readiness event. Errors are connection-fatal:
    /// the remote closed, the socket failed, a declared length exceeded the
    /// packet ceiling, or a handler failed.
    pub fn recv_step(&mut self, events: &mut E) -> Result<RecvStep> {
        if !self.alive {
            return Err(Error::PeerDead);
        }

        match self.state {
            ParseState::AwaitingId => {
                if !self.fill_inbound(1)? {
                    return Ok(RecvStep::Idle);
                }
                let id = self.codec.read_u8()?;
                if id == ID_VAR_LENGTH {
                    self.state = ParseState::AwaitingVarLength;
                    return Ok(RecvStep::Progress);
                }
                match self.table.get(id) {
                    Some(PacketDescriptor::Fixed { size, .. }) => {
                        self.state = ParseState::AwaitingFixedBody { id, size: *size };
                    }
                    Some(PacketDescriptor::Variable { .. }) => {
                        // variable packets must arrive under the length marker
                        debug!(id, "discarding bare variable packet id");
                    }
                    None => {
                        debug!(id, "discarding unknown packet id");
                    }
                }
                Ok(RecvStep::Progress)
            }
            ParseState::AwaitingVarLength => {
                if !self.fill_inbound(2)? {
                    return Ok(RecvStep::Idle);
                }
                let size = self.codec.read_u16()?;
                if size as usize > MAX_PACKET_SIZE {
                    warn!(size, "declared packet size exceeds ceiling");
                    return Err(Error::OversizedPacket(size as usize));
                }
                self.state = ParseState::AwaitingVarId { size };
                Ok(RecvStep::Progress)
            }
            ParseState::AwaitingVarId { size } => {
                if !self.fill_inbound(1)? {
                    return Ok(RecvStep::Idle);
                }
                let id = self.codec.read_u8()?;
                self.state = ParseState::AwaitingVarBody { id, size };
                Ok(RecvStep::Progress)
            }
            ParseState::AwaitingFixedBody { id, size } => self.finish_body(events, id, size, false),
            ParseState::AwaitingVarBody { id, size } => self.finish_body(events, id, size, true),
        }
    }

    /// Receive the remainder of a packet body and dispatch it.
    fn finish_body(
        &mut self,
        events: &mut E,
        id: PacketId,
        size: u16,
        variable: bool,
    ) -> Result<RecvStep> {
        if !self.fill_inbound(size as usize)? {
            return Ok(RecvStep::Idle);
        }

        let dispatch_result = self.dispatch(events, id, size, variable);

        // regardless of what the handler did, this packet's bytes are spent
        self.codec.clear_inbound();
        self.state = ParseState::AwaitingId;
        dispatch_result?;
        Ok(RecvStep::Progress)
    }

    fn dispatch(&mut self, events: &mut E, id: PacketId, size: u16, variable: bool) -> Result<()> {
        // until the handshake completes, only the handshake and keepalive
        // packets may be dispatched
        if !self.handshaken && !matches!(id, ID_HANDSHAKE_REQUEST | ID_HANDSHAKE_RESPONSE | ID_PING | ID_PONG)
        {
            debug!(id, "discarding packet before handshake");
            return Ok(());
        }

        match self.table.get(id).copied() {
            Some(PacketDescriptor::Fixed { handler, .. }) if !variable => handler(self, events),
            Some(PacketDescriptor::Variable { handler }) if variable => {
                handler(self, events, size)
            }
            _ => {
                debug!(id, variable, "discarding packet with no matching handler");
                Ok(())
            }
        }
    }

    /// Drain the socket: step the parser until the next packet fragment has
    /// not arrived yet. Required under the edge-triggered backend, harmless
    /// under the level-triggered one.
    pub fn drain_recv(&mut self, events: &mut E) -> Result<()> {
        loop {
            match self.recv_step(events)? {
                RecvStep::Progress => continue,
                RecvStep::Idle => return Ok(()),
            }
        }
    }

    /// One send round: emit at most one chunk per pending content stream,
    /// then flush the outbound buffer.
    ///
    /// [`SendStatus::NeedsPollOut`] asks the owner to arm write interest; a
    /// later full drain disarms it. Queued bytes are never dropped.
    pub fn send_step(&mut self, events: &mut E) -> Result<SendStatus> {
        if !self.alive {
            return Err(Error::PeerDead);
        }
        // while waiting out backpressure, generate nothing new; the queued
        // bytes are retried through flush() on the writable event
        if self.pollout_armed {
            return Ok(SendStatus::NeedsPollOut);
        }
        self.service_streams(events)?;
        self.flush()
    }

    /// Flush queued outbound bytes without generating new ones.
    pub fn flush(&mut self) -> Result<SendStatus> {
        if !self.alive {
            return Err(Error::PeerDead);
        }
        let queued = self.codec.outbound_len();
        if queued == 0 {
            return Ok(SendStatus::Flushed);
        }
        self.socket.send_from(&mut self.codec, queued)
    }

    /// Start a variable-length packet: writes the marker, a length
    /// placeholder, and the real packet ID. Returns the placeholder offset to
    /// hand back to [`Peer::end_variable`] once the body is written.
    pub fn begin_variable(&mut self, id: PacketId) -> usize {
        self.codec.write_u8(ID_VAR_LENGTH);
        let mark = self.codec.outbound_len();
        self.codec.write_u16(0);
        self.codec.write_u8(id);
        mark
    }

    /// Backfill the length of a variable packet started at `mark`.
    pub fn end_variable(&mut self, mark: usize) -> Result<()> {
        let body_start = mark + 2 + 1; // placeholder + real id
        let body = self
            .codec
            .outbound_len()
            .checked_sub(body_start)
            .ok_or(Error::PatchOutOfBounds)?;
        if body > MAX_PACKET_SIZE {
            return Err(Error::OversizedPacket(body));
        }
        self.codec.patch_u16(mark, body as u16)
    }

    /// Queue the handshake request: magic token, protocol version, and our
    /// byte order.
    pub(crate) fn queue_handshake(&mut self) {
        self.codec.write_u8(ID_HANDSHAKE_REQUEST);
        self.codec.write_bytes(MAGIC);
        self.codec.write_u8(PROTOCOL_MAJOR);
        self.codec.write_u8(PROTOCOL_MINOR);
        self.codec.write_u8(cfg!(target_endian = "big") as u8);
    }

    /// Queue a keepalive ping carrying `now` (seconds since epoch). Emission
    /// cadence is the caller's business; the peer never pings on its own.
    pub fn queue_ping(&mut self, now: i64) {
        self.codec.write_u8(ID_PING);
        self.codec.write_i64(now);
    }
}

/// Handshake request handler (listening side).
///
/// Always replies with the magic echoed plus an accept/reject byte. The
/// remote's endianness flag decides whether this connection's integer codec
/// flips byte order from here on.
fn handle_handshake_request<E: PeerEvents>(peer: &mut Peer<E>, _events: &mut E) -> Result<()> {
    let magic = peer.codec.read_bytes(MAGIC.len())?;
    let major = peer.codec.read_u8()?;
    let minor = peer.codec.read_u8()?;
    let big_endian = peer.codec.read_u8()?;

    let local_big = cfg!(target_endian = "big");
    peer.codec.set_flip_endian((big_endian != 0) != local_big);

    let accept = magic.as_ref() == MAGIC && major == PROTOCOL_MAJOR;
    debug!(major, minor, big_endian, accept, "handshake request");

    peer.codec.write_u8(ID_HANDSHAKE_RESPONSE);
    peer.codec.write_bytes(MAGIC);
    peer.codec.write_u8(accept as u8);

    if accept {
        peer.handshaken = true;
    } else {
        warn!(major, "rejected handshake");
    }
    Ok(())
}

/// Handshake response handler (initiating side). Fires `on_ready` on accept;
/// a rejection is connection-fatal for the initiator.
fn handle_handshake_response<E: PeerEvents>(peer: &mut Peer<E>, events: &mut E) -> Result<()> {
    let magic = peer.codec.read_bytes(MAGIC.len())?;
    let accept = peer.codec.read_u8()?;

    if accept == 0 || magic.as_ref() != MAGIC {
        return Err(Error::HandshakeRejected);
    }

    peer.handshaken = true;
    events.on_ready(peer);
    Ok(())
}

/// Answer a ping with a pong echoing the sender's timestamp.
fn handle_ping<E: PeerEvents>(peer: &mut Peer<E>, events: &mut E) -> Result<()> {
    let peer_time = peer.codec.read_i64()?;
    let now = Utc::now().timestamp();

    peer.codec.write_u8(ID_PONG);
    peer.codec.write_i64(peer_time);

    events.on_ping(peer, peer_time, now);
    Ok(())
}

/// A pong is observational only; it is never replied to.
fn handle_pong<E: PeerEvents>(peer: &mut Peer<E>, events: &mut E) -> Result<()> {
    let peer_time = peer.codec.read_i64()?;
    let now = Utc::now().timestamp();
    events.on_pong(peer, peer_time, now);
    Ok(())
}

/// Build the packet table with every built-in protocol packet registered.
pub(crate) fn default_table<E: PeerEvents>() -> PacketTable<E> {
    let mut table = PacketTable::new();
    let builtin: &[(PacketId, u16, FixedHandler<E>)] = &[
        (
            ID_HANDSHAKE_REQUEST,
            (MAGIC.len() + 3) as u16,
            handle_handshake_request::<E>,
        ),
        (
            ID_HANDSHAKE_RESPONSE,
            (MAGIC.len() + 1) as u16,
            handle_handshake_response::<E>,
        ),
        (ID_PING, 8, handle_ping::<E>),
        (ID_PONG, 8, handle_pong::<E>),
        (ID_CONTENT_OPEN, content::OPEN_BODY_SIZE, content::handle_open::<E>),
        (ID_CONTENT_STATUS, content::STATUS_BODY_SIZE, content::handle_status::<E>),
    ];
    for &(id, size, handler) in builtin {
        // reserved-low registrations cannot fail
        let _ = table.register_fixed(id, size, handler);
    }
    let _ = table.register_variable(ID_CONTENT_CHUNK, content::handle_chunk::<E>);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    #[derive(Default)]
    struct TestEvents {
        ready: usize,
        pings: Vec<i64>,
        pongs: Vec<i64>,
        decoded: Vec<(u16, u32)>,
        var_bodies: Vec<Vec<u8>>,
    }

    impl PeerEvents for TestEvents {
        fn on_ready(&mut self, _peer: &mut Peer<Self>) {
            self.ready += 1;
        }
        fn on_ping(&mut self, _peer: &mut Peer<Self>, peer_time: i64, _now: i64) {
            self.pings.push(peer_time);
        }
        fn on_pong(&mut self, _peer: &mut Peer<Self>, peer_time: i64, _now: i64) {
            self.pongs.push(peer_time);
        }
    }

    const TEST_FIXED: PacketId = USER_PACKET_START;
    const TEST_VAR: PacketId = USER_PACKET_START + 1;

    fn decode_fixed(peer: &mut Peer<TestEvents>, events: &mut TestEvents) -> Result<()> {
        let a = peer.codec_mut().read_u16()?;
        let b = peer.codec_mut().read_u32()?;
        events.decoded.push((a, b));
        Ok(())
    }

    fn decode_var(peer: &mut Peer<TestEvents>, events: &mut TestEvents, size: u16) -> Result<()> {
        let body = peer.codec_mut().read_bytes(size as usize)?;
        events.var_bodies.push(body.to_vec());
        Ok(())
    }

    fn failing(_peer: &mut Peer<TestEvents>, _events: &mut TestEvents) -> Result<()> {
        Err(Error::NotEnoughData)
    }

    /// A peer wired over loopback, plus the raw driving stream.
    fn peer_pair(handshaken: bool) -> (Peer<TestEvents>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = Socket::connect("127.0.0.1", addr.port()).unwrap();
        let (driver, _) = listener.accept().unwrap();
        driver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let mut table = default_table();
        table.register_fixed(TEST_FIXED, 6, decode_fixed).unwrap();
        table.register_variable(TEST_VAR, decode_var).unwrap();
        let mut peer = Peer::new(socket, table);
        peer.handshaken = handshaken;
        (peer, driver)
    }

    fn drive(peer: &mut Peer<TestEvents>, events: &mut TestEvents) {
        // give loopback delivery a moment, then drain
        for _ in 0..100 {
            peer.drain_recv(events).unwrap();
            if peer.codec.inbound_len() == 0 && peer.state == ParseState::AwaitingId {
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }

    #[test]
    fn test_fixed_packet_one_byte_at_a_time() {
        let (mut peer, mut driver) = peer_pair(true);
        let mut events = TestEvents::default();

        let mut wire = vec![TEST_FIXED];
        wire.extend_from_slice(&0xABCDu16.to_ne_bytes());
        wire.extend_from_slice(&0xDEADBEEFu32.to_ne_bytes());

        for byte in wire {
            driver.write_all(&[byte]).unwrap();
            driver.flush().unwrap();
            // drain whatever has arrived so far
            for _ in 0..20 {
                peer.drain_recv(&mut events).unwrap();
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        assert_eq!(events.decoded, vec![(0xABCD, 0xDEADBEEF)]);
    }

    #[test]
    fn test_variable_packet_round_trip() {
        let (mut peer, mut driver) = peer_pair(true);
        let mut events = TestEvents::default();

        let body = b"variable payload";
        let mut wire = vec![ID_VAR_LENGTH];
        wire.extend_from_slice(&(body.len() as u16).to_ne_bytes());
        wire.push(TEST_VAR);
        wire.extend_from_slice(body);
        driver.write_all(&wire).unwrap();

        drive(&mut peer, &mut events);
        assert_eq!(events.var_bodies, vec![body.to_vec()]);
    }

    #[test]
    fn test_oversized_declared_length_is_fatal() {
        let (mut peer, mut driver) = peer_pair(true);
        let mut events = TestEvents::default();

        let mut wire = vec![ID_VAR_LENGTH];
        wire.extend_from_slice(&((MAX_PACKET_SIZE as u16) + 1).to_ne_bytes());
        driver.write_all(&wire).unwrap();

        let err = loop {
            match peer.recv_step(&mut events) {
                Ok(_) => std::thread::sleep(Duration::from_millis(2)),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::OversizedPacket(_)));
        assert!(events.decoded.is_empty());
    }

    #[test]
    fn test_unknown_id_is_discarded_not_fatal() {
        let (mut peer, mut driver) = peer_pair(true);
        let mut events = TestEvents::default();

        let mut wire = vec![200u8, TEST_FIXED];
        wire.extend_from_slice(&7u16.to_ne_bytes());
        wire.extend_from_slice(&9u32.to_ne_bytes());
        driver.write_all(&wire).unwrap();

        drive(&mut peer, &mut events);
        // the unknown byte was skipped and the following packet dispatched
        assert_eq!(events.decoded, vec![(7, 9)]);
    }

    #[test]
    fn test_user_packets_gated_until_handshake() {
        let (mut peer, mut driver) = peer_pair(false);
        let mut events = TestEvents::default();

        let mut wire = vec![TEST_FIXED];
        wire.extend_from_slice(&1u16.to_ne_bytes());
        wire.extend_from_slice(&2u32.to_ne_bytes());
        driver.write_all(&wire).unwrap();

        drive(&mut peer, &mut events);
        assert!(events.decoded.is_empty());
        assert!(peer.is_alive());
    }

    #[test]
    fn test_handler_error_is_connection_fatal() {
        let (mut peer, mut driver) = peer_pair(true);
        peer.table.register_fixed(TEST_FIXED, 6, failing).unwrap();
        let mut events = TestEvents::default();

        let mut wire = vec![TEST_FIXED];
        wire.extend_from_slice(&[0u8; 6]);
        driver.write_all(&wire).unwrap();

        let err = loop {
            match peer.recv_step(&mut events) {
                Ok(_) => std::thread::sleep(Duration::from_millis(2)),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::NotEnoughData));
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (mut peer, mut driver) = peer_pair(true);
        let mut events = TestEvents::default();

        let mut wire = vec![ID_PING];
        wire.extend_from_slice(&1234567i64.to_ne_bytes());
        driver.write_all(&wire).unwrap();

        drive(&mut peer, &mut events);
        assert_eq!(events.pings, vec![1234567]);

        // the queued pong flushes on the next send step
        assert_eq!(peer.send_step(&mut events).unwrap(), SendStatus::Flushed);
        let mut reply = [0u8; 9];
        use std::io::Read as _;
        driver.read_exact(&mut reply).unwrap();
        assert_eq!(reply[0], ID_PONG);
        assert_eq!(i64::from_ne_bytes(reply[1..9].try_into().unwrap()), 1234567);
    }

    #[test]
    fn test_handshake_request_accepted() {
        let (mut peer, mut driver) = peer_pair(false);
        let mut events = TestEvents::default();

        let mut wire = vec![ID_HANDSHAKE_REQUEST];
        wire.extend_from_slice(MAGIC);
        wire.push(PROTOCOL_MAJOR);
        wire.push(PROTOCOL_MINOR);
        wire.push(cfg!(target_endian = "big") as u8);
        driver.write_all(&wire).unwrap();

        drive(&mut peer, &mut events);
        assert!(peer.is_ready());
        assert!(!peer.codec.flip_endian());

        peer.flush().unwrap();
        let mut reply = [0u8; 6];
        use std::io::Read as _;
        driver.read_exact(&mut reply).unwrap();
        assert_eq!(reply[0], ID_HANDSHAKE_RESPONSE);
        assert_eq!(&reply[1..5], MAGIC);
        assert_eq!(reply[5], 1);
    }

    #[test]
    fn test_handshake_version_mismatch_rejected() {
        let (mut peer, mut driver) = peer_pair(false);
        let mut events = TestEvents::default();

        let mut wire = vec![ID_HANDSHAKE_REQUEST];
        wire.extend_from_slice(MAGIC);
        wire.push(PROTOCOL_MAJOR + 1);
        wire.push(PROTOCOL_MINOR);
        wire.push(0);
        driver.write_all(&wire).unwrap();

        drive(&mut peer, &mut events);
        assert!(!peer.is_ready());

        peer.flush().unwrap();
        let mut reply = [0u8; 6];
        use std::io::Read as _;
        driver.read_exact(&mut reply).unwrap();
        assert_eq!(reply[5], 0);
    }

    #[test]
    fn test_handshake_sets_flip_endian_for_foreign_order() {
        let (mut peer, mut driver) = peer_pair(false);
        let mut events = TestEvents::default();

        let mut wire = vec![ID_HANDSHAKE_REQUEST];
        wire.extend_from_slice(MAGIC);
        wire.push(PROTOCOL_MAJOR);
        wire.push(PROTOCOL_MINOR);
        // claim the opposite of our local byte order
        wire.push(!cfg!(target_endian = "big") as u8);
        driver.write_all(&wire).unwrap();

        drive(&mut peer, &mut events);
        assert!(peer.codec.flip_endian());
    }

    #[test]
    fn test_handshake_response_fires_ready_once() {
        let (mut peer, mut driver) = peer_pair(false);
        let mut events = TestEvents::default();

        let mut wire = vec![ID_HANDSHAKE_RESPONSE];
        wire.extend_from_slice(MAGIC);
        wire.push(1);
        driver.write_all(&wire).unwrap();

        drive(&mut peer, &mut events);
        assert_eq!(events.ready, 1);
        assert!(peer.is_ready());
    }

    #[test]
    fn test_handshake_rejection_is_fatal_for_initiator() {
        let (mut peer, mut driver) = peer_pair(false);
        let mut events = TestEvents::default();

        let mut wire = vec![ID_HANDSHAKE_RESPONSE];
        wire.extend_from_slice(MAGIC);
        wire.push(0);
        driver.write_all(&wire).unwrap();

        let err = loop {
            match peer.recv_step(&mut events) {
                Ok(_) => std::thread::sleep(Duration::from_millis(2)),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::HandshakeRejected));
        assert_eq!(events.ready, 0);
    }

    #[test]
    fn test_begin_end_variable_patches_length() {
        let (mut peer, _driver) = peer_pair(true);

        let mark = peer.begin_variable(TEST_VAR);
        peer.codec_mut().write_bytes(b"abcdef");
        peer.end_variable(mark).unwrap();

        let wire = peer.codec.outbound_bytes().to_vec();
        assert_eq!(wire[0], ID_VAR_LENGTH);
        assert_eq!(u16::from_ne_bytes(wire[1..3].try_into().unwrap()), 6);
        assert_eq!(wire[3], TEST_VAR);
        assert_eq!(&wire[4..], b"abcdef");
    }

    #[test]
    fn test_backpressure_preserves_queue_and_order() {
        let (mut peer, mut driver) = peer_pair(true);
        let mut events = TestEvents::default();

        peer.codec_mut().write_bytes(b"first");
        peer.socket.force_send_block = true;
        assert_eq!(
            peer.send_step(&mut events).unwrap(),
            SendStatus::NeedsPollOut
        );
        assert_eq!(peer.codec.outbound_len(), 5);

        peer.codec_mut().write_bytes(b" second");
        peer.socket.force_send_block = false;
        assert_eq!(peer.send_step(&mut events).unwrap(), SendStatus::Flushed);

        let mut buf = [0u8; 12];
        use std::io::Read as _;
        driver.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"first second");
    }
}
