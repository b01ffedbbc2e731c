//! The dnsproxyd local socket: accepts client connections and walks each one
//! through the request protocol on a dedicated epoll thread.

mod protocol;

pub use protocol::{CacheOp, Caller, DnsResolvProtocol, ProtocolError, Stage, Step};

use crate::epoll::{EpollServer, ServerConfig, ServerHandle};
use crate::logger::{self, BreadcrumbFlags};
use crate::wire::DNS_SOCKET_PATH;
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub socket_path: PathBuf,
    pub server: ServerConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DNS_SOCKET_PATH),
            server: ServerConfig::default(),
        }
    }
}

pub struct DnsResolvListen {
    config: ListenerConfig,
    protocol: DnsResolvProtocol,
}

impl DnsResolvListen {
    pub fn new(config: ListenerConfig, protocol: DnsResolvProtocol) -> Self {
        Self { config, protocol }
    }

    /// Binds the socket on the calling thread so bind failures surface here,
    /// then serves connections on a background thread until stopped.
    pub fn start_listen(self) -> anyhow::Result<ListenerHandle> {
        let path = self.config.socket_path.clone();
        let mut server = EpollServer::bind(&path, self.protocol, self.config.server)
            .with_context(|| format!("binding dns socket {}", path.display()))?;
        let control = server.handle().context("creating listener wake channel")?;

        let thread = thread::Builder::new()
            .name("dns-resolv-listen".into())
            .spawn(move || {
                logger::breadcrumb(BreadcrumbFlags::LISTENER, "listener loop started");
                server.run();
                logger::breadcrumb(BreadcrumbFlags::LISTENER, "listener loop finished");
            })
            .context("spawning listener thread")?;

        logger::info(format!("dns listener serving {}", path.display()));
        Ok(ListenerHandle {
            control,
            thread: Some(thread),
            path,
        })
    }
}

/// Owns the listener thread. Dropping it stops the loop and removes the socket file.
pub struct ListenerHandle {
    control: ServerHandle,
    thread: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl ListenerHandle {
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| !thread.is_finished())
            .unwrap_or(false)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.control.shutdown();
        if thread.join().is_err() {
            logger::error("listener thread panicked");
        }
        if let Err(error) = fs::remove_file(&self.path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                logger::warn(format!("removing {} failed: {error}", self.path.display()));
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
