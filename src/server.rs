//! Accepting side of the protocol engine.
//!
//! A [`Server`] owns the listening socket, the readiness multiplexer, and a
//! slab of connected peers. One call to [`Server::poll_peers`] is one engine
//! round: every live peer gets a send step (flushing queued packets and
//! content-stream chunks), then the multiplexer is polled once and each
//! returned event is handled: accepting new connections, draining readable
//! peers, retrying writes on newly writable ones. Everything runs on the
//! caller's thread; there is no locking anywhere on this path.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use chrono::Utc;
use slab::Slab;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::content::BackingStore;
use crate::error::{Error, Result};
use crate::packet::{FixedHandler, PacketId, PacketTable, VarHandler, USER_PACKET_START};
use crate::peer::{default_table, Peer, PeerEvents};
use crate::poller::Poller;
use crate::socket::{SendStatus, Socket};

/// Multiplexer token reserved for the listening socket.
const LISTENER_TOKEN: usize = usize::MAX;

/// Key identifying a connected peer within a server.
pub type PeerKey = usize;

/// Accepts connections into [`Peer`]s and drives their lifecycle.
pub struct Server<E: PeerEvents> {
    listener: Socket,
    poller: Poller,
    peers: Slab<Peer<E>>,
    table: PacketTable<E>,
    events: E,
    max_peers: usize,
}

impl<E: PeerEvents> Server<E> {
    /// Bind a server on `addr` with default configuration.
    ///
    /// Listener setup failures are unconditionally fatal; a server that
    /// cannot bind has no valid degraded mode.
    pub fn bind(addr: &str, events: E) -> Result<Self> {
        let config = ServerConfig {
            listen: addr.to_string(),
            ..ServerConfig::default()
        };
        Self::from_config(&config, events)
    }

    /// Bind a server from a [`ServerConfig`].
    pub fn from_config(config: &ServerConfig, events: E) -> Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", config.listen, e)))?;
        let listener = Socket::bind(addr)?;
        let mut poller = Poller::new(config.backend, config.event_capacity)?;
        poller.add(listener.as_raw_fd(), LISTENER_TOKEN)?;

        debug!(listen = %config.listen, backend = ?config.backend, "server listening");
        Ok(Self {
            listener,
            poller,
            peers: Slab::with_capacity(config.max_peers),
            table: default_table(),
            events,
            max_peers: config.max_peers,
        })
    }

    /// Register a fixed-size application packet. Applies to peers accepted
    /// from now on.
    pub fn register_fixed(&mut self, id: PacketId, size: u16, handler: FixedHandler<E>) -> Result<()> {
        if id < USER_PACKET_START {
            return Err(Error::ReservedPacketId(id));
        }
        self.table.register_fixed(id, size, handler)
    }

    /// Register a variable-length application packet.
    pub fn register_variable(&mut self, id: PacketId, handler: VarHandler<E>) -> Result<()> {
        if id < USER_PACKET_START {
            return Err(Error::ReservedPacketId(id));
        }
        self.table.register_variable(id, handler)
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// One engine round. Returns `Ok(false)` when the timeout elapsed with
    /// no events; errors are multiplexer failures and fatal.
    pub fn poll_peers(&mut self, timeout_ms: i32) -> Result<bool> {
        // send pass first: this is what creates outbound bytes, not just
        // flushes them
        let keys: Vec<PeerKey> = self.peers.iter().map(|(k, _)| k).collect();
        for key in keys {
            let outcome = match self.peers.get_mut(key) {
                Some(peer) => peer.send_step(&mut self.events),
                None => continue,
            };
            match outcome {
                Ok(SendStatus::Flushed) => self.set_pollout(key, false),
                Ok(SendStatus::NeedsPollOut) => self.set_pollout(key, true),
                Err(e) => {
                    debug!(peer = key, error = %e, "send step failed");
                    self.disconnect(key);
                }
            }
        }

        let events = self.poller.poll(timeout_ms)?;
        if events.is_empty() {
            return Ok(false);
        }

        for event in events {
            if event.token == LISTENER_TOKEN {
                self.accept_pending();
                continue;
            }

            let key = event.token;
            if !self.peers.contains(key) {
                continue;
            }

            // an event with no ready direction is an error/hangup condition
            if !event.readable && !event.writable {
                self.disconnect(key);
                continue;
            }

            if event.readable {
                let outcome = match self.peers.get_mut(key) {
                    Some(peer) => peer.drain_recv(&mut self.events),
                    None => continue,
                };
                if let Err(e) = outcome {
                    debug!(peer = key, error = %e, "receive failed");
                    self.disconnect(key);
                    continue;
                }
            }

            if event.writable && self.peers.contains(key) {
                let outcome = match self.peers.get_mut(key) {
                    Some(peer) => peer.flush(),
                    None => continue,
                };
                match outcome {
                    Ok(SendStatus::Flushed) => self.set_pollout(key, false),
                    Ok(SendStatus::NeedsPollOut) => {}
                    Err(e) => {
                        debug!(peer = key, error = %e, "flush failed");
                        self.disconnect(key);
                    }
                }
            }
        }

        Ok(true)
    }

    /// Queue a keepalive ping on every live peer. Nothing is sent here; the
    /// next round's send pass flushes them.
    pub fn ping_peers(&mut self) {
        let now = Utc::now().timestamp();
        for (_, peer) in self.peers.iter_mut() {
            peer.queue_ping(now);
        }
    }

    /// Offer a content source to one peer.
    pub fn request_send_to(
        &mut self,
        key: PeerKey,
        source: Box<dyn BackingStore>,
        content_type: u8,
    ) -> Result<u16> {
        self.peers
            .get_mut(key)
            .ok_or(Error::PeerDead)?
            .request_send(source, content_type)
    }

    pub fn peer_mut(&mut self, key: PeerKey) -> Option<&mut Peer<E>> {
        self.peers.get_mut(key)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_keys(&self) -> Vec<PeerKey> {
        self.peers.iter().map(|(k, _)| k).collect()
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    /// Accept every pending connection on the listener.
    ///
    /// Draining to would-block matters under the edge-triggered backend: a
    /// burst of connections may produce a single readiness event. Individual
    /// accept failures are non-fatal and simply stop the drain.
    fn accept_pending(&mut self) {
        loop {
            let socket = match Socket::accept_from(&self.listener) {
                Ok(Some(socket)) => socket,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "accept failed");
                    break;
                }
            };

            if self.peers.len() >= self.max_peers {
                warn!("peer limit reached, rejecting connection");
                continue;
            }

            let peer = Peer::new(socket, self.table.clone());
            let key = self.peers.insert(peer);
            let fd = self.peers[key].raw_fd();
            if let Err(e) = self.poller.add(fd, key) {
                warn!(peer = key, error = %e, "failed to register accepted socket");
                self.peers.remove(key);
                continue;
            }

            debug!(peer = key, "accepted connection");
            if let Some(peer) = self.peers.get_mut(key) {
                self.events.on_peer_connected(peer);
            }
        }
    }

    /// Toggle write-readiness interest for one peer, skipping the syscall
    /// when the interest already matches.
    fn set_pollout(&mut self, key: PeerKey, want: bool) {
        let Some(peer) = self.peers.get_mut(key) else {
            return;
        };
        if peer.pollout_armed() == want {
            return;
        }
        let fd = peer.raw_fd();
        if let Err(e) = self.poller.set_write_interest(fd, key, want) {
            warn!(peer = key, error = %e, "failed to toggle write interest");
            return;
        }
        if let Some(peer) = self.peers.get_mut(key) {
            peer.set_pollout_armed(want);
        }
    }

    /// Tear one peer down: lifecycle event, multiplexer deregistration, slab
    /// removal, resource release. In-flight content streams are discarded.
    fn disconnect(&mut self, key: PeerKey) {
        if let Some(mut peer) = self.peers.try_remove(key) {
            self.events.on_peer_disconnected(&mut peer);
            self.poller.remove(peer.raw_fd(), key);
            peer.kill();
            debug!(peer = key, "connection closed");
        }
    }
}
