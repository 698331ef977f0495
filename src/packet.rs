//! Packet identifiers and the per-peer descriptor table.
//!
//! Every packet starts with a one-byte ID. Fixed packets carry exactly the
//! body length registered for their ID; variable packets arrive under the
//! [`ID_VAR_LENGTH`] marker with a two-byte length prefix followed by the real
//! ID. The low IDs are reserved for the built-in protocol; applications
//! register their own starting at [`USER_PACKET_START`].

use crate::error::{Error, Result};
use crate::peer::{Peer, PeerEvents};

pub type PacketId = u8;

/// Invalid packet ID. Slot 0 of the descriptor table is never registered.
pub const ID_NONE: PacketId = 0;
/// Marker ID: a two-byte body length and the real packet ID follow.
pub const ID_VAR_LENGTH: PacketId = 1;
pub const ID_HANDSHAKE_REQUEST: PacketId = 2;
pub const ID_HANDSHAKE_RESPONSE: PacketId = 3;
pub const ID_PING: PacketId = 4;
pub const ID_PONG: PacketId = 5;
pub const ID_CONTENT_OPEN: PacketId = 6;
pub const ID_CONTENT_STATUS: PacketId = 7;
pub const ID_CONTENT_CHUNK: PacketId = 8;
/// First ID available for application-registered packets.
pub const USER_PACKET_START: PacketId = 16;

/// In-memory packet body ceiling. Declared variable lengths above this are a
/// fatal framing violation.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Magic token exchanged during the handshake.
pub const MAGIC: &[u8] = b"LOOM";
/// Protocol version. A major mismatch rejects the handshake.
pub const PROTOCOL_MAJOR: u8 = 0;
/// Bugfix/cosmetic version; carried in the handshake but not compared.
pub const PROTOCOL_MINOR: u8 = 1;

/// Handler for a packet whose body length is known from its ID.
pub type FixedHandler<E> = fn(&mut Peer<E>, &mut E) -> Result<()>;
/// Handler for a variable packet; receives the declared body length.
pub type VarHandler<E> = fn(&mut Peer<E>, &mut E, u16) -> Result<()>;

/// One registered packet shape.
pub enum PacketDescriptor<E: PeerEvents> {
    Fixed { size: u16, handler: FixedHandler<E> },
    Variable { handler: VarHandler<E> },
}

impl<E: PeerEvents> Clone for PacketDescriptor<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: PeerEvents> Copy for PacketDescriptor<E> {}

/// 256-slot packet descriptor table, one owned per peer.
pub struct PacketTable<E: PeerEvents> {
    slots: [Option<PacketDescriptor<E>>; 256],
}

impl<E: PeerEvents> PacketTable<E> {
    pub fn new() -> Self {
        Self { slots: [None; 256] }
    }

    /// Register a fixed-size packet.
    pub fn register_fixed(&mut self, id: PacketId, size: u16, handler: FixedHandler<E>) -> Result<()> {
        if id == ID_NONE || id == ID_VAR_LENGTH {
            return Err(Error::ReservedPacketId(id));
        }
        if size as usize > MAX_PACKET_SIZE {
            return Err(Error::OversizedPacket(size as usize));
        }
        self.slots[id as usize] = Some(PacketDescriptor::Fixed { size, handler });
        Ok(())
    }

    /// Register a variable-length packet.
    pub fn register_variable(&mut self, id: PacketId, handler: VarHandler<E>) -> Result<()> {
        if id == ID_NONE || id == ID_VAR_LENGTH {
            return Err(Error::ReservedPacketId(id));
        }
        self.slots[id as usize] = Some(PacketDescriptor::Variable { handler });
        Ok(())
    }

    pub fn get(&self, id: PacketId) -> Option<&PacketDescriptor<E>> {
        self.slots[id as usize].as_ref()
    }
}

impl<E: PeerEvents> Clone for PacketTable<E> {
    fn clone(&self) -> Self {
        Self { slots: self.slots }
    }
}

impl<E: PeerEvents> Default for PacketTable<E> {
    fn default() -> Self {
        Self::new()
    }
}
