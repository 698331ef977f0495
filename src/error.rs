//! Crate-wide error types.
//!
//! Transient conditions (would-block, no-data-yet) are deliberately *not*
//! errors; they are reported through [`RecvStatus`](crate::socket::RecvStatus)
//! and [`SendStatus`](crate::socket::SendStatus). Everything in this enum is
//! either connection-fatal or fatal at construction time.

use std::io;
use thiserror::Error;

/// Errors surfaced by the protocol engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Fatal OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The remote end closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A buffer read was attempted with fewer bytes buffered than requested.
    #[error("not enough buffered data")]
    NotEnoughData,

    /// A patch range fell outside the bytes already queued.
    #[error("patch range out of bounds")]
    PatchOutOfBounds,

    /// A declared packet body length exceeded the in-memory ceiling.
    #[error("declared packet size {0} exceeds the maximum packet size")]
    OversizedPacket(usize),

    /// No resolved address accepted a connection.
    #[error("could not connect to {host}:{port}")]
    Connect { host: String, port: u16 },

    /// The remote peer rejected our handshake.
    #[error("handshake rejected by remote peer")]
    HandshakeRejected,

    /// Attempted to register a handler on a reserved packet ID.
    #[error("packet id {0} is reserved for protocol use")]
    ReservedPacketId(u8),

    /// Operation attempted on a dead connection.
    #[error("peer is not alive")]
    PeerDead,

    /// A content source exceeds the transferable ceiling.
    #[error("content of {0} bytes exceeds the maximum stream size")]
    ContentTooLarge(u64),

    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Type alias for Results using the crate error.
pub type Result<T> = std::result::Result<T, Error>;
