//! Readiness multiplexing over a set of non-blocking sockets.
//!
//! Two behaviorally equivalent backends sit behind the [`Poller`] facade:
//!
//! - [`edge`]: edge-triggered, built on `mio` (epoll on Linux, kqueue on the
//!   BSDs). The socket's token rides in the kernel event record, so no
//!   lookup is needed when an event comes back.
//! - [`scan`]: level-triggered portable fallback over `poll(2)`, re-scanning
//!   a descriptor list on every call.
//!
//! Sockets are registered with read interest only; write interest is toggled
//! dynamically and exclusively for backpressure (a full kernel send buffer),
//! never left armed while nothing is queued.

mod edge;
mod scan;

use std::os::unix::io::RawFd;

use serde::Deserialize;

pub use edge::EdgePoller;
pub use scan::ScanPoller;

use crate::error::Result;

/// Backend selection, e.g. from a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Edge-triggered mio backend.
    #[default]
    Edge,
    /// Level-triggered poll(2) fallback.
    Scan,
}

/// One readiness notification. At least one direction is set, except for
/// error/hangup conditions, which arrive with both flags false and are
/// treated as a disconnect by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

/// Facade over the two multiplexer backends.
pub enum Poller {
    Edge(EdgePoller),
    Scan(ScanPoller),
}

impl Poller {
    pub fn new(backend: Backend, event_capacity: usize) -> Result<Self> {
        match backend {
            Backend::Edge => Ok(Poller::Edge(EdgePoller::new(event_capacity)?)),
            Backend::Scan => Ok(Poller::Scan(ScanPoller::new())),
        }
    }

    /// Register a socket with read interest.
    pub fn add(&mut self, fd: RawFd, token: usize) -> Result<()> {
        match self {
            Poller::Edge(p) => p.add(fd, token),
            Poller::Scan(p) => p.add(fd, token),
        }
    }

    /// Deregister a socket. Failures are logged, not fatal; the socket may
    /// already be gone.
    pub fn remove(&mut self, fd: RawFd, token: usize) {
        match self {
            Poller::Edge(p) => p.remove(fd, token),
            Poller::Scan(p) => p.remove(fd),
        }
    }

    /// Toggle write-readiness interest. Read interest is always retained.
    pub fn set_write_interest(&mut self, fd: RawFd, token: usize, enabled: bool) -> Result<()> {
        match self {
            Poller::Edge(p) => p.set_write_interest(fd, token, enabled),
            Poller::Scan(p) => p.set_write_interest(fd, enabled),
        }
    }

    /// Block up to `timeout_ms` (negative blocks indefinitely) and return one
    /// event per socket with something to report. Empty on timeout.
    pub fn poll(&mut self, timeout_ms: i32) -> Result<Vec<PollEvent>> {
        match self {
            Poller::Edge(p) => p.poll(timeout_ms),
            Poller::Scan(p) => p.poll(timeout_ms),
        }
    }
}
