//! Initiating side of the protocol engine.
//!
//! A [`Client`] wraps one outbound [`Peer`] and its own multiplexer. The
//! handshake request is queued and flushed during [`Client::connect`], before
//! the poll loop ever runs; the connection is usable for application packets
//! once `on_ready` fires.

use std::os::unix::io::AsRawFd;

use tracing::debug;

use crate::content::BackingStore;
use crate::error::{Error, Result};
use crate::packet::{FixedHandler, PacketId, VarHandler};
use crate::peer::{default_table, Peer, PeerEvents};
use crate::poller::{Backend, Poller};
use crate::socket::{SendStatus, Socket};

const CLIENT_TOKEN: usize = 0;
const CLIENT_EVENT_CAPACITY: usize = 16;

/// One outbound connection with its own poll loop.
pub struct Client<E: PeerEvents> {
    peer: Peer<E>,
    poller: Poller,
    events: E,
}

impl<E: PeerEvents> Client<E> {
    /// Connect to `host:port` using the edge-triggered backend.
    pub fn connect(host: &str, port: u16, events: E) -> Result<Self> {
        Self::connect_with(host, port, Backend::default(), events)
    }

    /// Connect with an explicit multiplexer backend.
    pub fn connect_with(host: &str, port: u16, backend: Backend, events: E) -> Result<Self> {
        let socket = Socket::connect(host, port)?;
        let mut poller = Poller::new(backend, CLIENT_EVENT_CAPACITY)?;
        poller.add(socket.as_raw_fd(), CLIENT_TOKEN)?;

        let mut client = Self {
            peer: Peer::new(socket, default_table()),
            poller,
            events,
        };

        // the handshake goes out before the poll loop ever runs
        client.peer.queue_handshake();
        match client.peer.flush()? {
            SendStatus::Flushed => {}
            SendStatus::NeedsPollOut => client.arm_pollout(true)?,
        }

        debug!(host, port, "connected, handshake queued");
        Ok(client)
    }

    /// Register a fixed-size application packet.
    pub fn register_fixed(&mut self, id: PacketId, size: u16, handler: FixedHandler<E>) -> Result<()> {
        self.peer.register_fixed(id, size, handler)
    }

    /// Register a variable-length application packet.
    pub fn register_variable(&mut self, id: PacketId, handler: VarHandler<E>) -> Result<()> {
        self.peer.register_variable(id, handler)
    }

    /// One engine round for this connection. Returns `Ok(false)` on a quiet
    /// timeout. Connection failures tear the peer down and propagate.
    pub fn poll(&mut self, timeout_ms: i32) -> Result<bool> {
        if !self.peer.is_alive() {
            return Err(Error::PeerDead);
        }

        match self.peer.send_step(&mut self.events) {
            Ok(SendStatus::Flushed) => self.arm_pollout(false)?,
            Ok(SendStatus::NeedsPollOut) => self.arm_pollout(true)?,
            Err(e) => {
                self.teardown();
                return Err(e);
            }
        }

        let events = self.poller.poll(timeout_ms)?;
        if events.is_empty() {
            return Ok(false);
        }

        for event in events {
            if !event.readable && !event.writable {
                self.teardown();
                return Err(Error::ConnectionClosed);
            }
            if event.readable {
                if let Err(e) = self.peer.drain_recv(&mut self.events) {
                    self.teardown();
                    return Err(e);
                }
            }
            if event.writable {
                match self.peer.flush() {
                    Ok(SendStatus::Flushed) => self.arm_pollout(false)?,
                    Ok(SendStatus::NeedsPollOut) => {}
                    Err(e) => {
                        self.teardown();
                        return Err(e);
                    }
                }
            }
        }

        Ok(true)
    }

    /// Offer a content source to the remote peer.
    pub fn request_send(&mut self, source: Box<dyn BackingStore>, content_type: u8) -> Result<u16> {
        self.peer.request_send(source, content_type)
    }

    /// Queue a keepalive ping carrying `now`.
    pub fn queue_ping(&mut self, now: i64) {
        self.peer.queue_ping(now);
    }

    pub fn is_alive(&self) -> bool {
        self.peer.is_alive()
    }

    /// Whether the handshake has been accepted.
    pub fn is_ready(&self) -> bool {
        self.peer.is_ready()
    }

    pub fn peer_mut(&mut self) -> &mut Peer<E> {
        &mut self.peer
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    fn arm_pollout(&mut self, want: bool) -> Result<()> {
        if self.peer.pollout_armed() == want {
            return Ok(());
        }
        self.poller
            .set_write_interest(self.peer.raw_fd(), CLIENT_TOKEN, want)?;
        self.peer.set_pollout_armed(want);
        Ok(())
    }

    fn teardown(&mut self) {
        self.poller.remove(self.peer.raw_fd(), CLIENT_TOKEN);
        self.peer.kill();
    }
}
