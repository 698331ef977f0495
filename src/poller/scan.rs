//! Level-triggered fallback backend over `poll(2)`.
//!
//! Keeps a flat descriptor list (plus a parallel token list) and re-scans it
//! on every call. Slower than the edge backend for large socket sets, but
//! portable to any POSIX platform.

use std::io;
use std::os::unix::io::RawFd;

use tracing::warn;

use crate::error::Result;

use super::PollEvent;

pub struct ScanPoller {
    fds: Vec<libc::pollfd>,
    tokens: Vec<usize>,
}

impl ScanPoller {
    pub fn new() -> Self {
        Self {
            fds: Vec::new(),
            tokens: Vec::new(),
        }
    }

    pub fn add(&mut self, fd: RawFd, token: usize) -> Result<()> {
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        self.tokens.push(token);
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd) {
        match self.fds.iter().position(|p| p.fd == fd) {
            Some(idx) => {
                self.fds.swap_remove(idx);
                self.tokens.swap_remove(idx);
            }
            None => warn!(fd, "removal of unknown socket"),
        }
    }

    pub fn set_write_interest(&mut self, fd: RawFd, enabled: bool) -> Result<()> {
        if let Some(p) = self.fds.iter_mut().find(|p| p.fd == fd) {
            p.events = if enabled {
                libc::POLLIN | libc::POLLOUT
            } else {
                libc::POLLIN
            };
        }
        Ok(())
    }

    pub fn poll(&mut self, timeout_ms: i32) -> Result<Vec<PollEvent>> {
        let n = unsafe {
            // the pollfd list is owned and sized by this call alone
            libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms)
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err.into());
        }

        let mut out = Vec::with_capacity(n as usize);
        let mut remaining = n;
        for (pfd, &token) in self.fds.iter().zip(&self.tokens) {
            if remaining == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            // POLLHUP/POLLERR surface as an event with neither flag set,
            // which the owner treats as a disconnect
            out.push(PollEvent {
                token,
                readable: pfd.revents & libc::POLLIN != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
            });
        }
        Ok(out)
    }
}

impl Default for ScanPoller {
    fn default() -> Self {
        Self::new()
    }
}
