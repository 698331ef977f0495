//! Non-blocking TCP socket layer.
//!
//! A [`Socket`] owns one OS socket handle and moves bytes between the kernel
//! and a [`ByteCodec`]'s buffers. Partial transfers and transient would-block
//! conditions are part of the normal result taxonomy ([`RecvStatus`],
//! [`SendStatus`]); only real OS failures surface as errors.
//!
//! All sockets are set non-blocking immediately after creation or acceptance.
//! Failure to do so tears the socket down and is fatal.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};

use socket2::{Domain, Protocol, Type};
use tracing::{debug, warn};

use crate::codec::ByteCodec;
use crate::error::{Error, Result};
use crate::packet::MAX_PACKET_SIZE;

/// Process-wide socket-subsystem refcount. Incremented on every socket
/// construction and decremented on drop; the platform init/teardown hooks run
/// on the 0->1 and 1->0 transitions. Intentionally process-wide, not
/// per-connection. On POSIX there is nothing to initialize beyond the count
/// itself.
static SUBSYS_REFS: AtomicUsize = AtomicUsize::new(0);

fn subsys_acquire() {
    if SUBSYS_REFS.fetch_add(1, Ordering::SeqCst) == 0 {
        debug!("socket subsystem initialized");
    }
}

fn subsys_release() {
    if SUBSYS_REFS.fetch_sub(1, Ordering::SeqCst) == 1 {
        debug!("socket subsystem torn down");
    }
}

/// Outcome of one non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// `n > 0` bytes were appended to the codec's inbound buffer.
    Received(usize),
    /// No data currently available; try again on the next readiness event.
    WouldBlock,
    /// The remote closed the connection gracefully.
    Closed,
}

/// Outcome of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Everything requested left the socket.
    Flushed,
    /// The kernel send buffer is full. Queued bytes are preserved; request
    /// write-readiness and retry once it is signaled.
    NeedsPollOut,
}

/// Hook for observing or transforming wire bytes.
///
/// `outbound` runs exactly once over queued bytes before their first
/// transmission attempt; `inbound` runs over received bytes before any
/// consumer sees them. An extension seam (e.g. byte obfuscation), not a
/// security boundary.
pub trait WireFilter {
    fn outbound(&mut self, _bytes: &mut [u8]) {}
    fn inbound(&mut self, _bytes: &mut [u8]) {}
}

/// One non-blocking TCP socket (connected, listening, or accepted).
pub struct Socket {
    inner: socket2::Socket,
    filter: Option<Box<dyn WireFilter>>,
    /// Outbound bytes already run through the filter and still queued.
    filtered_mark: usize,
    open: bool,
    #[cfg(test)]
    pub(crate) force_send_block: bool,
}

impl Socket {
    fn wrap(inner: socket2::Socket) -> Self {
        subsys_acquire();
        Self {
            inner,
            filter: None,
            filtered_mark: 0,
            open: true,
            #[cfg(test)]
            force_send_block: false,
        }
    }

    /// Finish setup of a freshly created or accepted socket.
    ///
    /// The socket must become non-blocking; if that fails it is torn down and
    /// the configuration error is fatal.
    fn finish(inner: socket2::Socket) -> Result<Self> {
        if let Err(e) = inner.set_nonblocking(true) {
            warn!(error = %e, "failed to set socket non-blocking");
            let _ = inner.shutdown(Shutdown::Both);
            return Err(Error::Io(e));
        }
        Ok(Self::wrap(inner))
    }

    /// Connect to `host:port`, trying each resolved candidate address in
    /// order and taking the first that completes a connection.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let addrs = (host, port).to_socket_addrs().map_err(|e| {
            debug!(host, port, error = %e, "address resolution failed");
            Error::Connect {
                host: host.to_string(),
                port,
            }
        })?;

        for addr in addrs {
            let sock = match socket2::Socket::new(
                Domain::for_address(addr),
                Type::STREAM,
                Some(Protocol::TCP),
            ) {
                Ok(s) => s,
                Err(_) => continue,
            };
            if sock.connect(&addr.into()).is_ok() {
                return Self::finish(sock);
            }
        }

        Err(Error::Connect {
            host: host.to_string(),
            port,
        })
    }

    /// Create a passive listening socket bound to `addr`.
    ///
    /// Any failure here is fatal; a listener that cannot bind has no valid
    /// degraded mode.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let sock = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        sock.bind(&addr.into())?;
        sock.listen(1024)?;
        Self::finish(sock)
    }

    /// Complete a one-shot accept on `listener`.
    ///
    /// Returns `Ok(None)` when no connection is pending.
    pub fn accept_from(listener: &Socket) -> Result<Option<Self>> {
        match listener.inner.accept() {
            Ok((sock, _addr)) => Ok(Some(Self::finish(sock)?)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Perform one non-blocking receive of up to `max` bytes, appending
    /// whatever actually arrived to `codec`'s inbound buffer.
    pub fn receive_into(&mut self, codec: &mut ByteCodec, max: usize) -> Result<RecvStatus> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let want = max.min(MAX_PACKET_SIZE);
        if want == 0 {
            return Ok(RecvStatus::Received(0));
        }

        match self.inner.read(&mut buf[..want]) {
            Ok(0) => Ok(RecvStatus::Closed),
            Ok(n) => {
                let bytes = &mut buf[..n];
                if let Some(filter) = self.filter.as_mut() {
                    filter.inbound(bytes);
                }
                codec.feed(bytes);
                Ok(RecvStatus::Received(n))
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(RecvStatus::WouldBlock)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Send up to `n` bytes from the front of `codec`'s outbound buffer,
    /// consuming them as they go out.
    ///
    /// Returns [`SendStatus::Flushed`] only once all `n` bytes left. On a full
    /// kernel buffer the unsent remainder stays queued, in order, and
    /// [`SendStatus::NeedsPollOut`] tells the caller to wait for writability.
    pub fn send_from(&mut self, codec: &mut ByteCodec, n: usize) -> Result<SendStatus> {
        let mut remaining = n.min(codec.outbound_len());

        // run newly queued bytes through the filter exactly once
        if let Some(filter) = self.filter.as_mut() {
            let queued = codec.outbound_bytes_mut();
            if queued.len() > self.filtered_mark {
                filter.outbound(&mut queued[self.filtered_mark..]);
            }
            self.filtered_mark = queued.len();
        }

        #[cfg(test)]
        if self.force_send_block {
            return Ok(SendStatus::NeedsPollOut);
        }

        while remaining > 0 {
            match self.inner.write(&codec.outbound_bytes()[..remaining]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(sent) => {
                    codec.consume_outbound(sent);
                    self.filtered_mark = self.filtered_mark.saturating_sub(sent);
                    remaining -= sent;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SendStatus::NeedsPollOut);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e)
                    if e.kind() == io::ErrorKind::ConnectionReset
                        || e.kind() == io::ErrorKind::BrokenPipe =>
                {
                    return Err(Error::ConnectionClosed);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Ok(SendStatus::Flushed)
    }

    /// Install a wire observer/transformer.
    pub fn set_filter(&mut self, filter: Box<dyn WireFilter>) {
        self.filter = Some(filter);
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::Other, "non-IP local address")))
    }

    /// Orderly shutdown. Idempotent; the descriptor itself closes on drop.
    pub fn shutdown(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = self.inner.shutdown(Shutdown::Both);
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.shutdown();
        subsys_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpStream;
    use std::time::Duration;

    /// A listener plus a connected (socket, driver) pair over loopback.
    fn pair() -> (Socket, Socket, TcpStream) {
        let listener = Socket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let driver = TcpStream::connect(addr).unwrap();
        driver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let accepted = loop {
            if let Some(s) = Socket::accept_from(&listener).unwrap() {
                break s;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        (listener, accepted, driver)
    }

    #[test]
    fn test_receive_would_block_then_data() {
        let (_listener, mut sock, mut driver) = pair();
        let mut codec = ByteCodec::new();

        // nothing written yet
        assert_eq!(
            sock.receive_into(&mut codec, 16).unwrap(),
            RecvStatus::WouldBlock
        );

        driver.write_all(b"ping").unwrap();
        let got = loop {
            match sock.receive_into(&mut codec, 16).unwrap() {
                RecvStatus::Received(n) => break n,
                RecvStatus::WouldBlock => std::thread::sleep(Duration::from_millis(5)),
                RecvStatus::Closed => panic!("unexpected close"),
            }
        };
        assert_eq!(got, 4);
        assert_eq!(&codec.read_bytes(4).unwrap()[..], b"ping");
    }

    #[test]
    fn test_receive_detects_close() {
        let (_listener, mut sock, driver) = pair();
        drop(driver);
        let mut codec = ByteCodec::new();
        let status = loop {
            match sock.receive_into(&mut codec, 16).unwrap() {
                RecvStatus::WouldBlock => std::thread::sleep(Duration::from_millis(5)),
                other => break other,
            }
        };
        assert_eq!(status, RecvStatus::Closed);
    }

    #[test]
    fn test_send_flushes_all() {
        let (_listener, mut sock, mut driver) = pair();
        let mut codec = ByteCodec::new();
        codec.write_bytes(b"hello driver");

        let n = codec.outbound_len();
        assert_eq!(sock.send_from(&mut codec, n).unwrap(), SendStatus::Flushed);
        assert_eq!(codec.outbound_len(), 0);

        let mut buf = [0u8; 12];
        driver.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello driver");
    }

    #[test]
    fn test_wire_filter_transforms_outbound_once() {
        struct Xor;
        impl WireFilter for Xor {
            fn outbound(&mut self, bytes: &mut [u8]) {
                for b in bytes {
                    *b ^= 0x34;
                }
            }
            fn inbound(&mut self, bytes: &mut [u8]) {
                for b in bytes {
                    *b ^= 0x34;
                }
            }
        }

        let (_listener, mut sock, mut driver) = pair();
        sock.set_filter(Box::new(Xor));

        let mut codec = ByteCodec::new();
        codec.write_bytes(b"secret");
        let n = codec.outbound_len();
        sock.send_from(&mut codec, n).unwrap();

        // the driver sees obfuscated bytes, not the plaintext
        let mut raw = [0u8; 6];
        driver.read_exact(&mut raw).unwrap();
        assert_ne!(&raw, b"secret");
        let decoded: Vec<u8> = raw.iter().map(|b| b ^ 0x34).collect();
        assert_eq!(&decoded, b"secret");

        // and inbound bytes are transformed back before the codec sees them
        driver.write_all(&raw).unwrap();
        loop {
            match sock.receive_into(&mut codec, 16).unwrap() {
                RecvStatus::Received(_) => break,
                _ => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        assert_eq!(&codec.read_bytes(6).unwrap()[..], b"secret");
    }

    #[test]
    fn test_forced_backpressure_preserves_bytes() {
        let (_listener, mut sock, mut driver) = pair();
        let mut codec = ByteCodec::new();
        codec.write_bytes(b"queued bytes");

        sock.force_send_block = true;
        let n = codec.outbound_len();
        assert_eq!(
            sock.send_from(&mut codec, n).unwrap(),
            SendStatus::NeedsPollOut
        );
        assert_eq!(codec.outbound_len(), 12);

        // once writable again, exactly the queued bytes flush in order
        sock.force_send_block = false;
        assert_eq!(sock.send_from(&mut codec, n).unwrap(), SendStatus::Flushed);
        let mut buf = [0u8; 12];
        driver.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"queued bytes");
    }
}
