//! Edge-triggered backend built on `mio`.
//!
//! The token is attached directly to the kernel event record, so readiness
//! events come back with the socket's identity and no separate lookup.
//! Edge-triggered delivery means a readiness notification must be drained to
//! would-block by the consumer; the peer layer does exactly that.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Token};
use tracing::warn;

use crate::error::Result;

use super::PollEvent;

pub struct EdgePoller {
    poll: mio::Poll,
    events: Events,
}

impl EdgePoller {
    pub fn new(event_capacity: usize) -> Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: Events::with_capacity(event_capacity.max(1)),
        })
    }

    pub fn add(&mut self, fd: RawFd, token: usize) -> Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(token), Interest::READABLE)?;
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd, token: usize) {
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            // the socket may already be closed; nothing to do about it
            warn!(token, error = %e, "failed to deregister socket");
        }
    }

    pub fn set_write_interest(&mut self, fd: RawFd, token: usize, enabled: bool) -> Result<()> {
        let interest = if enabled {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(token), interest)?;
        Ok(())
    }

    pub fn poll(&mut self, timeout_ms: i32) -> Result<Vec<PollEvent>> {
        let timeout = if timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(timeout_ms as u64))
        };

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(e.into());
        }

        let mut out = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            out.push(PollEvent {
                token: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
            });
        }
        Ok(out)
    }
}
