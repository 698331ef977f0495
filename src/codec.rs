//! In-memory byte buffers with an endian-aware integer codec.
//!
//! A [`ByteCodec`] holds two ordered byte sequences: `inbound` (received from
//! the wire, not yet consumed) and `outbound` (queued for the wire, not yet
//! sent). Consumers only ever remove from the front of `inbound`; producers
//! only append to the end of `outbound`. [`ByteCodec::patch_bytes`] overwrites
//! bytes already queued, which is how placeholder length fields written early
//! in a packet get backfilled once the body size is known.
//!
//! When `flip_endian` is set, fixed-width integers are byte-reversed on both
//! encode and decode. Raw byte copies are never flipped. The flag is set once,
//! by the handshake, when the remote's declared byte order differs from ours.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

const CODEC_RESERVED: usize = 64;

/// Paired read/write byte buffers. Pure in-memory; performs no I/O.
#[derive(Debug, Default)]
pub struct ByteCodec {
    inbound: BytesMut,
    outbound: BytesMut,
    flip_endian: bool,
}

macro_rules! fixed_int_codec {
    ($write:ident, $read:ident, $patch:ident, $ty:ty) => {
        pub fn $write(&mut self, v: $ty) {
            let mut raw = v.to_ne_bytes();
            if self.flip_endian {
                raw.reverse();
            }
            self.outbound.extend_from_slice(&raw);
        }

        pub fn $read(&mut self) -> Result<$ty> {
            const N: usize = std::mem::size_of::<$ty>();
            if self.inbound.len() < N {
                return Err(Error::NotEnoughData);
            }
            let mut raw = [0u8; N];
            raw.copy_from_slice(&self.inbound.split_to(N));
            if self.flip_endian {
                raw.reverse();
            }
            Ok(<$ty>::from_ne_bytes(raw))
        }

        pub fn $patch(&mut self, offset: usize, v: $ty) -> Result<()> {
            let mut raw = v.to_ne_bytes();
            if self.flip_endian {
                raw.reverse();
            }
            self.patch_bytes(offset, &raw)
        }
    };
}

impl ByteCodec {
    pub fn new() -> Self {
        Self {
            inbound: BytesMut::with_capacity(CODEC_RESERVED),
            outbound: BytesMut::with_capacity(CODEC_RESERVED),
            flip_endian: false,
        }
    }

    /// Append bytes to the outbound queue.
    pub fn write_bytes(&mut self, buf: &[u8]) {
        self.outbound.extend_from_slice(buf);
    }

    /// Remove and return the first `n` bytes of the inbound buffer.
    ///
    /// Fails without consuming anything if fewer than `n` bytes are buffered.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        if self.inbound.len() < n {
            return Err(Error::NotEnoughData);
        }
        Ok(self.inbound.split_to(n).freeze())
    }

    /// Overwrite bytes already queued in `outbound` at `offset`.
    ///
    /// The buffer length is unchanged; the range must already exist.
    pub fn patch_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or(Error::PatchOutOfBounds)?;
        if end > self.outbound.len() {
            return Err(Error::PatchOutOfBounds);
        }
        self.outbound[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fixed_int_codec!(write_u8, read_u8, patch_u8, u8);
    fixed_int_codec!(write_u16, read_u16, patch_u16, u16);
    fixed_int_codec!(write_u32, read_u32, patch_u32, u32);
    fixed_int_codec!(write_u64, read_u64, patch_u64, u64);
    fixed_int_codec!(write_i64, read_i64, patch_i64, i64);

    /// Append received wire bytes to the inbound buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Byte-reverse integers on encode/decode when the remote's byte order
    /// differs from ours. Raw byte copies are unaffected.
    pub fn set_flip_endian(&mut self, flip: bool) {
        self.flip_endian = flip;
    }

    pub fn flip_endian(&self) -> bool {
        self.flip_endian
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// The queued-but-unsent bytes, front first.
    pub fn outbound_bytes(&self) -> &[u8] {
        &self.outbound
    }

    pub(crate) fn outbound_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.outbound
    }

    /// Drop the first `n` outbound bytes (they were sent).
    pub(crate) fn consume_outbound(&mut self, n: usize) {
        let n = n.min(self.outbound.len());
        let _ = self.outbound.split_to(n);
    }

    /// Clear the inbound buffer, keeping its allocation.
    pub fn clear_inbound(&mut self) {
        self.inbound.clear();
    }

    /// Clear the outbound buffer, keeping its allocation.
    pub fn clear_outbound(&mut self) {
        self.outbound.clear();
    }
}
