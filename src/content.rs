//! Chunked, hash-verified bulk transfers layered over ordinary packets.
//!
//! A content stream moves an arbitrary byte source to the remote peer in
//! [`MAX_PACKET_SIZE`]-bounded chunks, multiplexed with every other packet on
//! the connection. The opening request carries the total size and a SHA-256
//! digest; the receiver verifies the digest once all bytes have landed.
//! Stream IDs are peer-local, so collisions and stale IDs are protocol
//! events handled with status codes, never connection failures.
//!
//! Fairness: each [`Peer::send_step`](crate::peer::Peer::send_step) emits at
//! most one chunk per incomplete stream, so a large transfer cannot starve
//! other streams or ordinary packets.

use std::io::{Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::packet::{ID_CONTENT_CHUNK, ID_CONTENT_OPEN, ID_CONTENT_STATUS, MAX_PACKET_SIZE};
use crate::peer::{Peer, PeerEvents};

/// Ceiling on a single content stream's total size, enforced when an open
/// request arrives. Much larger than the packet ceiling.
pub const MAX_CONTENT_SIZE: u64 = 1 << 30;

/// SHA-256 digest width.
pub const DIGEST_LEN: usize = 32;

/// Open-request body: u32 size + u16 id + u8 type + digest.
pub(crate) const OPEN_BODY_SIZE: u16 = (4 + 2 + 1 + DIGEST_LEN) as u16;
/// Status body: u16 id + u8 code.
pub(crate) const STATUS_BODY_SIZE: u16 = 3;

/// Payload bytes per chunk, after the stream id.
pub(crate) const CHUNK_CAPACITY: usize = MAX_PACKET_SIZE - 2;

/// Seekable, readable and writable byte sink backing an in-flight stream.
pub trait BackingStore: Read + Write + Seek {}
impl<T: Read + Write + Seek> BackingStore for T {}

/// Which way a stream moves, from this peer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Stream status codes carried in [`ID_CONTENT_STATUS`] packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamStatus {
    /// Receiver is ready; sender may start chunking.
    Ready = 1,
    /// Tear the stream down on the receiving side of this status.
    Close = 2,
    /// The requested ID is already in use; re-open under a new one.
    ExhaustedId = 3,
    /// No stream with that ID exists here.
    InvalidId = 4,
    /// The completed transfer did not match its declared digest.
    FailedHash = 5,
    /// The declared size exceeds the receiver's ceiling.
    TooBig = 6,
}

impl StreamStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(StreamStatus::Ready),
            2 => Some(StreamStatus::Close),
            3 => Some(StreamStatus::ExhaustedId),
            4 => Some(StreamStatus::InvalidId),
            5 => Some(StreamStatus::FailedHash),
            6 => Some(StreamStatus::TooBig),
            _ => None,
        }
    }
}

/// One in-flight bulk transfer. Owned exclusively by the peer that created
/// or accepted it; destroyed on completion, close, hash failure, or
/// rejection.
pub struct ContentStream {
    id: u16,
    digest: [u8; DIGEST_LEN],
    size: u64,
    processed: u64,
    content_type: u8,
    direction: Direction,
    store: Box<dyn BackingStore>,
}

impl ContentStream {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn content_type(&self) -> u8 {
        self.content_type
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The backing store. Rewound to the start when handed to
    /// `on_content_received`.
    pub fn store_mut(&mut self) -> &mut dyn BackingStore {
        self.store.as_mut()
    }

    pub fn into_store(self) -> Box<dyn BackingStore> {
        self.store
    }
}

/// Rewind `store` and compute its length and SHA-256 digest.
pub(crate) fn hash_store(store: &mut dyn BackingStore) -> std::io::Result<(u64, [u8; DIGEST_LEN])> {
    store.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = store.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hasher.finalize().into()))
}

impl<E: PeerEvents> Peer<E> {
    /// Offer `source` to the remote peer as a content stream.
    ///
    /// Computes the size and digest over the whole source, allocates a
    /// locally-unique stream ID, and queues the open request. Chunking does
    /// not start until the remote replies `Ready`. Returns the allocated ID.
    pub fn request_send(&mut self, mut source: Box<dyn BackingStore>, content_type: u8) -> Result<u16> {
        let (size, digest) = hash_store(source.as_mut())?;
        if size > MAX_CONTENT_SIZE {
            return Err(Error::ContentTooLarge(size));
        }

        let id = self.alloc_stream_id();
        debug!(id, size, content_type, "requesting content send");

        self.codec.write_u8(ID_CONTENT_OPEN);
        self.codec.write_u32(size as u32);
        self.codec.write_u16(id);
        self.codec.write_u8(content_type);
        self.codec.write_bytes(&digest);

        self.streams.insert(
            id,
            ContentStream {
                id,
                digest,
                size,
                processed: 0,
                content_type,
                direction: Direction::Outbound,
                store: source,
            },
        );
        Ok(id)
    }

    /// Allocate the next stream ID not currently in use.
    ///
    /// IDs come from a wrapping counter; the zero ID is skipped. Exhaustion
    /// (every ID live at once) is not handled.
    pub(crate) fn alloc_stream_id(&mut self) -> u16 {
        loop {
            let id = self.next_stream_id;
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            if id != 0 && !self.streams.contains_key(&id) {
                return id;
            }
        }
    }

    fn send_status(&mut self, id: u16, status: StreamStatus) {
        self.codec.write_u8(ID_CONTENT_STATUS);
        self.codec.write_u16(id);
        self.codec.write_u8(status as u8);
    }

    /// Queue a fresh open request for an already-registered outbound stream.
    fn reissue_open(&mut self, id: u16) {
        let (size, content_type, digest) = match self.streams.get(&id) {
            Some(s) => (s.size, s.content_type, s.digest),
            None => return,
        };
        self.codec.write_u8(ID_CONTENT_OPEN);
        self.codec.write_u32(size as u32);
        self.codec.write_u16(id);
        self.codec.write_u8(content_type);
        self.codec.write_bytes(&digest);
    }

    /// Emit at most one chunk for every pending outbound stream that is
    /// still short of its size. Called once per send step.
    pub(crate) fn service_streams(&mut self, events: &mut E) -> Result<()> {
        if self.pending_send.is_empty() {
            return Ok(());
        }

        let ids: Vec<u16> = self.pending_send.iter().copied().collect();
        for id in ids {
            let want = match self.streams.get(&id) {
                Some(s) if s.processed < s.size => {
                    (s.size - s.processed).min(CHUNK_CAPACITY as u64) as usize
                }
                _ => {
                    self.pending_send.remove(&id);
                    continue;
                }
            };

            let mut chunk = vec![0u8; want];
            let read_ok = {
                // a short read is a local I/O failure; the entry is dropped
                // silently rather than reported to the remote
                let stream = match self.streams.get_mut(&id) {
                    Some(s) => s,
                    None => continue,
                };
                stream.store.read_exact(&mut chunk).is_ok()
            };
            if !read_ok {
                debug!(id, "dropping stream on short read");
                self.streams.remove(&id);
                self.pending_send.remove(&id);
                continue;
            }

            let mark = self.begin_variable(ID_CONTENT_CHUNK);
            self.codec.write_u16(id);
            self.codec.write_bytes(&chunk);
            self.end_variable(mark)?;

            let complete = {
                let stream = match self.streams.get_mut(&id) {
                    Some(s) => s,
                    None => continue,
                };
                stream.processed += want as u64;
                stream.processed >= stream.size
            };
            if complete {
                self.pending_send.remove(&id);
                if let Some(stream) = self.streams.remove(&id) {
                    debug!(id, size = stream.size, "content fully sent");
                    events.on_content_sent(self, stream);
                }
            }
        }
        Ok(())
    }
}

/// What to do after the borrow-heavy part of chunk receipt.
enum ChunkOutcome {
    Incomplete,
    Unknown,
    WriteFailed,
    Complete,
}

/// Open-request handler: validate, allocate a temp-file backing store, and
/// answer with a status.
pub(crate) fn handle_open<E: PeerEvents>(peer: &mut Peer<E>, events: &mut E) -> Result<()> {
    let size = peer.codec_mut().read_u32()? as u64;
    let id = peer.codec_mut().read_u16()?;
    let content_type = peer.codec_mut().read_u8()?;
    let digest_bytes = peer.codec_mut().read_bytes(DIGEST_LEN)?;

    if size > MAX_CONTENT_SIZE {
        warn!(id, size, "rejecting oversized content stream");
        peer.send_status(id, StreamStatus::TooBig);
        return Ok(());
    }
    if peer.streams.contains_key(&id) {
        debug!(id, "stream id already in use");
        peer.send_status(id, StreamStatus::ExhaustedId);
        return Ok(());
    }
    if !events.on_content_offer(peer, content_type, size) {
        debug!(id, content_type, "content offer refused");
        peer.send_status(id, StreamStatus::Close);
        return Ok(());
    }

    let store = match tempfile::tempfile() {
        Ok(f) => f,
        Err(e) => {
            warn!(id, error = %e, "failed to allocate backing store");
            peer.send_status(id, StreamStatus::Close);
            return Ok(());
        }
    };

    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&digest_bytes);
    peer.streams.insert(
        id,
        ContentStream {
            id,
            digest,
            size,
            processed: 0,
            content_type,
            direction: Direction::Inbound,
            store: Box::new(store),
        },
    );
    debug!(id, size, content_type, "content stream accepted");
    peer.send_status(id, StreamStatus::Ready);
    Ok(())
}

/// Status handler: drives the sender/receiver stream state machine.
pub(crate) fn handle_status<E: PeerEvents>(peer: &mut Peer<E>, _events: &mut E) -> Result<()> {
    let id = peer.codec_mut().read_u16()?;
    let code = peer.codec_mut().read_u8()?;

    match StreamStatus::from_u8(code) {
        Some(StreamStatus::Ready) => {
            let rewound = match peer.streams.get_mut(&id) {
                Some(s) if s.direction == Direction::Outbound => {
                    s.store.seek(SeekFrom::Start(0)).is_ok()
                }
                _ => {
                    debug!(id, "ready status for unknown stream");
                    return Ok(());
                }
            };
            if rewound {
                peer.pending_send.insert(id);
            } else {
                peer.streams.remove(&id);
            }
        }
        Some(StreamStatus::Close) => {
            debug!(id, "stream closed by remote");
            peer.streams.remove(&id);
            peer.pending_send.remove(&id);
        }
        Some(StreamStatus::ExhaustedId) => {
            if let Some(mut stream) = peer.streams.remove(&id) {
                let new_id = peer.alloc_stream_id();
                debug!(old = id, new = new_id, "renegotiating stream id");
                stream.id = new_id;
                peer.streams.insert(new_id, stream);
                peer.reissue_open(new_id);
            }
        }
        Some(StreamStatus::InvalidId) => {
            peer.streams.remove(&id);
            peer.pending_send.remove(&id);
        }
        Some(StreamStatus::FailedHash) => {
            // full restart from offset zero under the same id
            warn!(id, "remote reported hash mismatch, restarting transfer");
            let rewound = match peer.streams.get_mut(&id) {
                Some(s) => {
                    s.processed = 0;
                    s.store.seek(SeekFrom::Start(0)).is_ok()
                }
                None => return Ok(()),
            };
            peer.pending_send.remove(&id);
            if rewound {
                peer.reissue_open(id);
            } else {
                peer.streams.remove(&id);
            }
        }
        Some(StreamStatus::TooBig) => {
            warn!(id, "remote rejected stream as too big");
            peer.streams.remove(&id);
        }
        None => {
            debug!(id, code, "ignoring unrecognized stream status");
        }
    }
    Ok(())
}

/// Chunk handler: append to the backing store and verify the digest once the
/// declared size is reached.
pub(crate) fn handle_chunk<E: PeerEvents>(peer: &mut Peer<E>, events: &mut E, size: u16) -> Result<()> {
    let body_len = (size as usize).checked_sub(2).ok_or(Error::NotEnoughData)?;
    let id = peer.codec_mut().read_u16()?;
    let data = peer.codec_mut().read_bytes(body_len)?;

    let outcome = match peer.streams.get_mut(&id) {
        Some(stream) if stream.direction == Direction::Inbound => {
            if stream.store.write_all(&data).is_err() {
                ChunkOutcome::WriteFailed
            } else {
                stream.processed += data.len() as u64;
                if stream.processed >= stream.size {
                    ChunkOutcome::Complete
                } else {
                    ChunkOutcome::Incomplete
                }
            }
        }
        _ => ChunkOutcome::Unknown,
    };

    match outcome {
        ChunkOutcome::Incomplete => {}
        ChunkOutcome::Unknown => {
            debug!(id, "chunk for unknown stream");
            peer.send_status(id, StreamStatus::InvalidId);
        }
        ChunkOutcome::WriteFailed => {
            warn!(id, "backing store write failed");
            peer.streams.remove(&id);
            peer.send_status(id, StreamStatus::Close);
        }
        ChunkOutcome::Complete => {
            let verified = {
                let stream = match peer.streams.get_mut(&id) {
                    Some(s) => s,
                    None => return Ok(()),
                };
                match hash_store(stream.store.as_mut()) {
                    Ok((_, actual)) => actual == stream.digest,
                    Err(_) => false,
                }
            };
            if !verified {
                warn!(id, "content digest mismatch");
                peer.streams.remove(&id);
                peer.send_status(id, StreamStatus::FailedHash);
                return Ok(());
            }
            if let Some(mut stream) = peer.streams.remove(&id) {
                if stream.store.seek(SeekFrom::Start(0)).is_err() {
                    peer.send_status(id, StreamStatus::Close);
                    return Ok(());
                }
                debug!(id, size = stream.size, "content fully received");
                events.on_content_received(peer, stream);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_hash_store_matches_sha256() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut cursor = Cursor::new(data.to_vec());
        let (size, digest) = hash_store(&mut cursor).unwrap();

        assert_eq!(size, data.len() as u64);
        let expected: [u8; DIGEST_LEN] = Sha256::digest(data).into();
        assert_eq!(digest, expected);
    }

    #[test]
    fn test_hash_store_rewinds_first() {
        let mut cursor = Cursor::new(b"abcdef".to_vec());
        cursor.seek(SeekFrom::Start(3)).unwrap();
        let (size, _) = hash_store(&mut cursor).unwrap();
        assert_eq!(size, 6);
    }

    #[test]
    fn test_status_codes_round_trip() {
        for code in [1u8, 2, 3, 4, 5, 6] {
            let status = StreamStatus::from_u8(code).unwrap();
            assert_eq!(status as u8, code);
        }
        assert!(StreamStatus::from_u8(0).is_none());
        assert!(StreamStatus::from_u8(7).is_none());
        assert!(StreamStatus::from_u8(255).is_none());
    }

    #[test]
    fn test_chunk_capacity_fits_packet_ceiling() {
        assert_eq!(CHUNK_CAPACITY + 2, MAX_PACKET_SIZE);
    }
}
