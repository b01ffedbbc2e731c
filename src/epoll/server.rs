use super::{
    Epoller, FixedLengthReceiver, Interest, ReceiverState, StageHandler, DEFAULT_IDLE_TIMEOUT,
    MAX_EPOLL_EVENTS, MAX_LISTEN_NUM,
};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::socket::make_non_block;
use rustc_hash::FxHashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    pub max_events: usize,
    /// Wait bound while connections are open; a wait that elapses with no
    /// activity closes every open connection.
    pub idle_timeout: Duration,
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_events: MAX_EPOLL_EVENTS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            backlog: MAX_LISTEN_NUM,
        }
    }
}

/// Stops a running [`EpollServer`] from another thread.
#[derive(Debug)]
pub struct ServerHandle {
    waker: UnixStream,
    running: Arc<AtomicBool>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Err(error) = (&self.waker).write(&[1]) {
            if error.kind() != io::ErrorKind::WouldBlock {
                logger::warn(format!("epoll server wake failed: {error}"));
            }
        }
    }
}

/// Single-threaded accept/dispatch loop. Each connection owns one
/// [`FixedLengthReceiver`] keyed by its descriptor.
pub struct EpollServer<H: StageHandler> {
    listener: UnixListener,
    epoller: Epoller,
    receivers: FxHashMap<RawFd, FixedLengthReceiver<H::Stage>>,
    handler: H,
    config: ServerConfig,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
    running: Arc<AtomicBool>,
}

impl<H: StageHandler> EpollServer<H> {
    /// Binds a fresh listening socket at `path`, replacing a stale socket file.
    pub fn bind(path: &Path, handler: H, config: ServerConfig) -> io::Result<Self> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(error),
        }
        let listener = UnixListener::bind(path)?;
        // A second listen() on a bound socket only adjusts the backlog.
        if unsafe { libc::listen(listener.as_raw_fd(), config.backlog) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Self::from_listener(listener, handler, config)
    }

    pub fn from_listener(listener: UnixListener, handler: H, config: ServerConfig) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let epoller = Epoller::new()?;
        epoller.register(listener.as_raw_fd(), Interest::READABLE)?;

        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        epoller.register(wake_rx.as_raw_fd(), Interest::READABLE)?;

        Ok(Self {
            listener,
            epoller,
            receivers: FxHashMap::default(),
            handler,
            config,
            wake_rx,
            wake_tx,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn handle(&self) -> io::Result<ServerHandle> {
        Ok(ServerHandle {
            waker: self.wake_tx.try_clone()?,
            running: Arc::clone(&self.running),
        })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    /// Installs `stage` on `stream`, replacing any receiver already registered
    /// for the same descriptor.
    pub fn add_receiver(&mut self, stream: UnixStream, stage: H::Stage, needed: usize) -> io::Result<()> {
        let fd = stream.as_raw_fd();
        if self.receivers.remove(&fd).is_some() {
            let _ = self.epoller.unregister(fd);
        }
        self.epoller.register(fd, Interest::READABLE)?;
        self.receivers
            .insert(fd, FixedLengthReceiver::new(stream, stage, needed));
        Ok(())
    }

    /// Runs until [`ServerHandle::shutdown`] is called.
    pub fn run(&mut self) {
        logger::breadcrumb(BreadcrumbFlags::EPOLL, "epoll server loop started");
        while self.running.load(Ordering::Acquire) {
            self.poll_once();
        }
        self.close_all();
        logger::breadcrumb(BreadcrumbFlags::EPOLL, "epoll server loop stopped");
    }

    /// One wait-and-dispatch round.
    pub fn poll_once(&mut self) {
        let timeout = (!self.receivers.is_empty()).then_some(self.config.idle_timeout);
        let ready = match self.epoller.wait(self.config.max_events, timeout) {
            Ok(ready) => ready,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => return,
            Err(error) => {
                logger::rate_limited_error(
                    ErrorCategory::SocketError,
                    format!("epoll_wait failed: {error}"),
                );
                return;
            }
        };

        if ready.is_empty() {
            if !self.receivers.is_empty() {
                logger::breadcrumb(
                    BreadcrumbFlags::EPOLL,
                    format!("idle timeout, closing {} connections", self.receivers.len()),
                );
            }
            self.close_all();
            return;
        }

        for fd in ready {
            self.dispatch(fd);
        }
    }

    fn dispatch(&mut self, fd: RawFd) {
        if fd == self.listener.as_raw_fd() {
            self.accept_pending();
            return;
        }
        if fd == self.wake_rx.as_raw_fd() {
            self.drain_wake();
            return;
        }

        let Some(receiver) = self.receivers.get_mut(&fd) else {
            let _ = self.epoller.unregister(fd);
            return;
        };
        match receiver.run_once(&self.handler) {
            ReceiverState::Continue => {}
            ReceiverState::DataEnough | ReceiverState::OnError => self.close_receiver(fd),
        }
    }

    fn accept_pending(&mut self) {
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    logger::rate_limited_error(
                        ErrorCategory::SocketError,
                        format!("accept failed: {error}"),
                    );
                    return;
                }
            };
            if let Err(error) = make_non_block(stream.as_raw_fd()) {
                logger::rate_limited_error(
                    ErrorCategory::SocketError,
                    format!("make_non_block fd={} failed: {error}", stream.as_raw_fd()),
                );
                continue;
            }
            let (stage, needed) = self.handler.first_stage();
            if let Err(error) = self.add_receiver(stream, stage, needed) {
                logger::rate_limited_error(
                    ErrorCategory::SocketError,
                    format!("registering client failed: {error}"),
                );
            }
        }
    }

    fn drain_wake(&mut self) {
        let mut buf = [0u8; 64];
        while let Ok(count) = (&self.wake_rx).read(&mut buf) {
            if count == 0 {
                break;
            }
        }
    }

    fn close_receiver(&mut self, fd: RawFd) {
        let _ = self.epoller.unregister(fd);
        self.receivers.remove(&fd);
    }

    fn close_all(&mut self) {
        for (fd, _) in self.receivers.drain() {
            let _ = self.epoller.unregister(fd);
        }
    }
}
