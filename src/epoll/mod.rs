//! Level-triggered epoll reactor used by the resolver socket.

mod receiver;
mod server;

pub use receiver::{Advance, FixedLengthReceiver, ReceiverState, StageHandler};
pub use server::{EpollServer, ServerConfig, ServerHandle};

use bitflags::bitflags;
use smallvec::SmallVec;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub const MAX_EPOLL_EVENTS: usize = 32;
pub const MAX_LISTEN_NUM: i32 = 1024;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(5000);

pub type ReadyList = SmallVec<[RawFd; MAX_EPOLL_EVENTS]>;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interest: u32 {
        const READABLE = libc::EPOLLIN as u32;
        const WRITABLE = libc::EPOLLOUT as u32;
        const PEER_HANGUP = libc::EPOLLRDHUP as u32;
    }
}

/// Thin owner of an epoll instance keyed by descriptor number.
#[derive(Debug)]
pub struct Epoller {
    fd: OwnedFd,
}

impl Epoller {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: epoll_create1 returned a fresh descriptor we now own.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Registering a descriptor that is already present fails with `EEXIST`.
    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        let ret = unsafe {
            libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits for up to `max_events` ready descriptors. `None` blocks indefinitely;
    /// an empty list means the timeout elapsed.
    pub fn wait(&self, max_events: usize, timeout: Option<Duration>) -> io::Result<ReadyList> {
        let capacity = max_events.clamp(1, MAX_EPOLL_EVENTS);
        let mut events: SmallVec<[libc::epoll_event; MAX_EPOLL_EVENTS]> =
            SmallVec::from_elem(libc::epoll_event { events: 0, u64: 0 }, capacity);
        let timeout_ms = timeout
            .map(|value| value.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);
        let count = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.as_mut_ptr(),
                capacity as i32,
                timeout_ms,
            )
        };
        if count < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(events
            .iter()
            .take(count as usize)
            .map(|event| {
                let data = event.u64;
                data as RawFd
            })
            .collect())
    }
}

#[cfg(test)]
mod tests;
