//! Blocking-style helpers over non-blocking local sockets.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::logger::{self, BreadcrumbFlags};

pub(crate) const MAX_FCNTL_RETRY: usize = 30;
pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 1000;
pub const MAX_POLL_RETRY: usize = 3;

/// Sets `O_NONBLOCK` on `fd`, retrying interrupted `fcntl` calls a bounded
/// number of times.
pub fn make_non_block(fd: RawFd) -> io::Result<()> {
    let flags = retry_fcntl(|| unsafe { libc::fcntl(fd, libc::F_GETFL, 0) })?;
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    retry_fcntl(|| unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

fn retry_fcntl(mut call: impl FnMut() -> libc::c_int) -> io::Result<libc::c_int> {
    let mut last = io::Error::from(io::ErrorKind::Interrupted);
    for _ in 0..MAX_FCNTL_RETRY {
        let ret = call();
        if ret >= 0 {
            return Ok(ret);
        }
        last = io::Error::last_os_error();
        if last.kind() != io::ErrorKind::Interrupted {
            return Err(last);
        }
    }
    Err(last)
}

#[derive(Clone, Copy)]
enum Direction {
    Send,
    Recv,
}

impl Direction {
    fn events(self) -> libc::c_short {
        match self {
            Direction::Send => libc::POLLOUT,
            Direction::Recv => libc::POLLIN,
        }
    }
}

/// Waits until `fd` is ready in `direction`. `Ok(false)` means the poll timed out.
fn wait_ready(fd: RawFd, direction: Direction, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: direction.events(),
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret > 0 {
            return Ok(true);
        }
        if ret == 0 {
            return Ok(false);
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

fn transfer(fd: RawFd, direction: Direction, buf: *mut u8, len: usize) -> isize {
    unsafe {
        match direction {
            Direction::Send => libc::send(fd, buf as *const libc::c_void, len, libc::MSG_NOSIGNAL),
            Direction::Recv => libc::recv(fd, buf as *mut libc::c_void, len, 0),
        }
    }
}

fn poll_transfer(fd: RawFd, direction: Direction, buf: *mut u8, len: usize) -> io::Result<()> {
    let mut done = 0usize;
    let mut retries = 0usize;
    while done < len {
        if !wait_ready(fd, direction, DEFAULT_POLL_TIMEOUT_MS)? {
            retries += 1;
            if retries >= MAX_POLL_RETRY {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "poll timed out"));
            }
            continue;
        }
        // Safety: `buf` is valid for `len` bytes for the whole call.
        let ret = transfer(fd, direction, unsafe { buf.add(done) }, len - done);
        if ret > 0 {
            done += ret as usize;
            continue;
        }
        if ret == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed during transfer",
            ));
        }
        let error = io::Error::last_os_error();
        match error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                retries += 1;
                if retries >= MAX_POLL_RETRY {
                    return Err(error);
                }
            }
            _ => return Err(error),
        }
    }
    Ok(())
}

/// Sends all of `data`, polling for writability between partial writes.
pub fn poll_send(fd: RawFd, data: &[u8]) -> io::Result<()> {
    let result = poll_transfer(fd, Direction::Send, data.as_ptr() as *mut u8, data.len());
    if let Err(error) = &result {
        logger::breadcrumb(
            BreadcrumbFlags::EPOLL,
            format!("poll_send fd={fd} len={} failed: {error}", data.len()),
        );
    }
    result
}

/// Fills all of `buf`, polling for readability between partial reads.
pub fn poll_recv(fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
    let len = buf.len();
    let result = poll_transfer(fd, Direction::Recv, buf.as_mut_ptr(), len);
    if let Err(error) = &result {
        logger::breadcrumb(
            BreadcrumbFlags::EPOLL,
            format!("poll_recv fd={fd} len={len} failed: {error}"),
        );
    }
    result
}

/// Connects a non-blocking stream socket to `path`, waiting at most `timeout`
/// for the connection to complete.
pub fn connect_non_block(path: &Path, timeout: Duration) -> io::Result<UnixStream> {
    let bytes = path.as_os_str().as_bytes();
    let mut address: libc::sockaddr_un = unsafe { mem::zeroed() };
    if bytes.len() >= address.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path too long",
        ));
    }
    address.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (slot, byte) in address.sun_path.iter_mut().zip(bytes) {
        *slot = *byte as libc::c_char;
    }

    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: `raw` is a fresh descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    make_non_block(fd.as_raw_fd())?;

    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &address as *const libc::sockaddr_un as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let error = io::Error::last_os_error();
        match error.raw_os_error() {
            Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => {}
            _ => return Err(error),
        }
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        if !wait_ready(fd.as_raw_fd(), Direction::Send, timeout_ms)? {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        }
        let mut so_error: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if so_error != 0 {
            return Err(io::Error::from_raw_os_error(so_error));
        }
    }
    Ok(UnixStream::from(fd))
}

#[cfg(test)]
mod tests;
