//! Services the listener consumes from the rest of the system.

use crate::cache::DnsParamCache;
use std::env;
use std::io;
use std::os::fd::RawFd;

/// Operator backup resolver appended to `GET_CONFIG` replies.
pub const PUBLIC_DNS_PROPERTY: &str = "persist.sys.netsysnative_dns_servers_backup";

/// Tags a socket so its traffic is routed on a given network.
pub trait FwmarkBinder: Send + Sync {
    fn bind_socket(&self, fd: RawFd, net_id: u32) -> io::Result<()>;
}

/// Applies `SO_MARK = net_id` in this process's descriptor table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoMarkBinder;

impl FwmarkBinder for SoMarkBinder {
    fn bind_socket(&self, fd: RawFd, net_id: u32) -> io::Result<()> {
        let mark: libc::c_uint = net_id;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MARK,
                &mark as *const libc::c_uint as *const libc::c_void,
                std::mem::size_of::<libc::c_uint>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

pub trait DefaultNetworkSource: Send + Sync {
    fn default_network(&self) -> i32;
}

impl DefaultNetworkSource for DnsParamCache {
    fn default_network(&self) -> i32 {
        i32::from(DnsParamCache::default_network(self))
    }
}

pub trait PropertySource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads system properties from the environment: `persist.sys.foo_bar`
/// becomes `PERSIST_SYS_FOO_BAR`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvProperties;

impl EnvProperties {
    pub fn variable_name(key: &str) -> String {
        key.chars()
            .map(|c| if c == '.' { '_' } else { c.to_ascii_uppercase() })
            .collect()
    }
}

impl PropertySource for EnvProperties {
    fn get(&self, key: &str) -> Option<String> {
        env::var(Self::variable_name(key))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn property_names_map_to_env_vars() {
        assert_eq!(
            EnvProperties::variable_name(PUBLIC_DNS_PROPERTY),
            "PERSIST_SYS_NETSYSNATIVE_DNS_SERVERS_BACKUP"
        );
    }

    #[test]
    fn unset_property_is_none() {
        assert_eq!(EnvProperties.get("dnsd.test.never.set"), None);
    }

    #[test]
    fn binding_invalid_descriptor_fails() {
        assert!(SoMarkBinder.bind_socket(-1, 100).is_err());
    }

    #[test]
    fn binding_reports_os_error_without_privilege_or_succeeds() {
        let (left, _right) = UnixStream::pair().unwrap();
        if let Err(error) = SoMarkBinder.bind_socket(left.as_raw_fd(), 100) {
            assert!(error.raw_os_error().is_some());
        }
    }

    #[test]
    fn cache_serves_default_network() {
        let cache = DnsParamCache::manual(Default::default());
        cache.set_default_network(42);
        assert_eq!(DefaultNetworkSource::default_network(&cache), 42);
    }
}
