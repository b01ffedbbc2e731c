use super::lru::LruCache;
use crate::delayed::DelayedTask;
use crate::wire::{AddrInfo, MAX_RESULTS, MAX_SERVER_NUM};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Timeout applied when a network is configured with zero.
pub const RES_TIMEOUT: u16 = 4000;
pub const RES_DEFAULT_RETRY: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedAddrInfo {
    pub info: AddrInfo,
    /// Seconds left before the answer expires.
    pub ttl: u32,
}

pub type AddrCache = LruCache<CachedAddrInfo>;

/// Snapshot handed out to readers; the live config stays behind the cache lock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    pub net_id: u16,
    pub timeout_ms: u16,
    pub retry_count: u8,
    pub servers: Vec<String>,
    pub domains: Vec<String>,
}

#[derive(Debug)]
pub(super) struct DnsResolvConfig {
    pub(super) net_id: u16,
    pub(super) revision_id: u32,
    pub(super) timeout_ms: u16,
    pub(super) retry_count: u8,
    pub(super) servers: Vec<String>,
    pub(super) domains: Vec<String>,
    pub(super) ipv6_enabled: bool,
    pub(super) ipv4_enabled: bool,
    pub(super) clat_ipv4_enabled: bool,
    pub(super) user_defined_server: bool,
    pub(super) cache: Arc<AddrCache>,
}

impl DnsResolvConfig {
    pub(super) fn new(net_id: u16, cache_capacity: usize) -> Self {
        Self {
            net_id,
            revision_id: 0,
            timeout_ms: 0,
            retry_count: 0,
            servers: Vec::new(),
            domains: Vec::new(),
            ipv6_enabled: false,
            ipv4_enabled: false,
            clat_ipv4_enabled: false,
            user_defined_server: false,
            cache: Arc::new(LruCache::new(cache_capacity, MAX_RESULTS)),
        }
    }

    /// Stores the new parameters. Returns true when the server list changed.
    pub(super) fn apply(
        &mut self,
        timeout_ms: u16,
        retry_count: u8,
        servers: &[String],
        domains: &[String],
    ) -> bool {
        let servers: Vec<String> = servers
            .iter()
            .take(MAX_SERVER_NUM - 1)
            .cloned()
            .collect();
        let changed = servers != self.servers;
        if changed {
            self.revision_id = self.revision_id.wrapping_add(1);
        }
        self.servers = servers;
        self.domains = domains.to_vec();
        self.timeout_ms = if timeout_ms == 0 { RES_TIMEOUT } else { timeout_ms };
        self.retry_count = if retry_count == 0 {
            RES_DEFAULT_RETRY
        } else {
            retry_count
        };
        changed
    }

    pub(super) fn snapshot(&self) -> ResolverConfig {
        ResolverConfig {
            net_id: self.net_id,
            timeout_ms: self.timeout_ms,
            retry_count: self.retry_count,
            servers: self.servers.clone(),
            domains: self.domains.clone(),
        }
    }
}

/// Expires the answers of one host on one network.
///
/// `remaining_time` records the delay it reports; the following `execute`
/// takes that much off every answer and drops those that ran out.
#[derive(Debug)]
pub struct CacheExpiry {
    net_id: u16,
    host: String,
    cache: Weak<AddrCache>,
    scheduled: AtomicU32,
}

impl CacheExpiry {
    pub(super) fn new(net_id: u16, host: &str, cache: &Arc<AddrCache>) -> Self {
        Self {
            net_id,
            host: host.to_string(),
            cache: Arc::downgrade(cache),
            scheduled: AtomicU32::new(0),
        }
    }
}

impl DelayedTask for CacheExpiry {
    type Key = (u16, String);

    fn key(&self) -> (u16, String) {
        (self.net_id, self.host.clone())
    }

    fn execute(&self) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let elapsed = self.scheduled.load(Ordering::Acquire);
        cache.update(&self.host, |answers| {
            answers.retain(|answer| answer.ttl > elapsed);
            for answer in answers.iter_mut() {
                answer.ttl -= elapsed;
            }
        });
    }

    fn remaining_time(&self) -> u32 {
        let Some(cache) = self.cache.upgrade() else {
            return 0;
        };
        let min_ttl = cache
            .get(&self.host)
            .iter()
            .map(|answer| answer.ttl)
            .min()
            .unwrap_or(0);
        self.scheduled.store(min_ttl, Ordering::Release);
        min_ttl
    }
}
