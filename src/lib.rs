//! packetloom: a connection-oriented binary protocol engine for TCP peers.
//!
//! The engine frames discrete packets over a byte stream, dispatches them to
//! typed handlers, and layers two sub-protocols on top: chunked,
//! hash-verified bulk transfers ("content streams") and ping/pong keepalive.
//! Everything runs single-threaded over non-blocking sockets multiplexed
//! through one readiness primitive.
//!
//! Layering, leaves first:
//! - [`codec`]: endian-aware in-memory byte buffers, no I/O
//! - [`socket`]: non-blocking send/receive with a small result taxonomy
//! - [`poller`]: readiness multiplexing (edge-triggered mio, poll(2) fallback)
//! - [`peer`] + [`content`]: packet framing, handshake, keepalive, streams
//! - [`server`] / [`client`]: connection lifecycle drivers
//!
//! ```no_run
//! use packetloom::{Client, PeerEvents, Server};
//!
//! #[derive(Default)]
//! struct App;
//! impl PeerEvents for App {}
//!
//! # fn main() -> packetloom::Result<()> {
//! let mut server = Server::bind("127.0.0.1:23337", App)?;
//! let mut client = Client::connect("127.0.0.1", 23337, App)?;
//! loop {
//!     server.poll_peers(10)?;
//!     client.poll(10)?;
//!     if client.is_ready() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod content;
pub mod error;
pub mod packet;
pub mod peer;
pub mod poller;
pub mod server;
pub mod socket;

pub use client::Client;
pub use codec::ByteCodec;
pub use config::ServerConfig;
pub use content::{BackingStore, ContentStream, Direction, StreamStatus, MAX_CONTENT_SIZE};
pub use error::{Error, Result};
pub use packet::{PacketId, PacketTable, MAX_PACKET_SIZE, USER_PACKET_START};
pub use peer::{Peer, PeerEvents, RecvStep};
pub use poller::{Backend, PollEvent, Poller};
pub use server::{PeerKey, Server};
pub use socket::{RecvStatus, SendStatus, Socket, WireFilter};
