//! Per-network resolver parameters, VPN UID routing and the answer cache.

mod config;
mod lru;

pub use config::{CacheExpiry, CachedAddrInfo, ResolverConfig, RES_DEFAULT_RETRY, RES_TIMEOUT};
pub use lru::LruCache;

use crate::delayed::{
    DelayedQueue, DelayedTask, TickerHandle, DEFAULT_DEFERRED_SLOTS, DEFAULT_TICK,
    DEFAULT_WINDOW_SLOTS,
};
use crate::logger::{self, BreadcrumbFlags};
use crate::wire::{AddrInfo, MAX_DNS_CACHE_SIZE};
use config::DnsResolvConfig;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt::Write as _;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CACHE_TTL_SECS: u32 = 60;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error("network {0} not found")]
    NotFound(u16),
    #[error("network {0} already exists")]
    AlreadyExists(u16),
    #[error("invalid argument")]
    InvalidArgument,
}

impl CacheError {
    /// Negative errno reported over the wire and the C ABI.
    pub fn status(self) -> i32 {
        match self {
            CacheError::NotFound(_) => -libc::ENOENT,
            CacheError::AlreadyExists(_) => -libc::EEXIST,
            CacheError::InvalidArgument => -libc::EINVAL,
        }
    }
}

/// Inclusive UID interval routed to the VPN network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UidRange {
    pub begin: u32,
    pub end: u32,
}

impl UidRange {
    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.begin <= uid && uid <= self.end
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CacheOptions {
    /// Host names kept per network.
    pub capacity: usize,
    /// TTL given to answers stored without one.
    pub default_ttl: u32,
    pub window_slots: usize,
    pub deferred_slots: usize,
    pub tick: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: MAX_DNS_CACHE_SIZE,
            default_ttl: DEFAULT_CACHE_TTL_SECS,
            window_slots: DEFAULT_WINDOW_SLOTS,
            deferred_slots: DEFAULT_DEFERRED_SLOTS,
            tick: DEFAULT_TICK,
        }
    }
}

#[derive(Default)]
struct Networks {
    configs: FxHashMap<u16, DnsResolvConfig>,
    default_net_id: u16,
}

impl Networks {
    fn resolve(&self, net_id: u16) -> u16 {
        if net_id == 0 {
            self.default_net_id
        } else {
            net_id
        }
    }

    fn get(&self, net_id: u16) -> Result<&DnsResolvConfig, CacheError> {
        let net_id = self.resolve(net_id);
        self.configs.get(&net_id).ok_or(CacheError::NotFound(net_id))
    }

    fn get_mut(&mut self, net_id: u16) -> Result<&mut DnsResolvConfig, CacheError> {
        let net_id = self.resolve(net_id);
        self.configs
            .get_mut(&net_id)
            .ok_or(CacheError::NotFound(net_id))
    }

    fn clear_all_caches(&self) {
        for config in self.configs.values() {
            config.cache.clear();
        }
    }
}

#[derive(Default)]
struct VpnRouting {
    net_id: u16,
    ranges: Vec<UidRange>,
}

/// Resolver state for every network known to the daemon.
///
/// Network configs, VPN ranges, each answer cache and the TTL queue have
/// separate locks, and no method holds two of them at once.
pub struct DnsParamCache {
    networks: Mutex<Networks>,
    vpn: Mutex<VpnRouting>,
    queue: Arc<DelayedQueue<CacheExpiry>>,
    ticker: Mutex<Option<TickerHandle>>,
    options: CacheOptions,
}

static GLOBAL: Lazy<Arc<DnsParamCache>> = Lazy::new(|| {
    let options = CacheOptions::default();
    match DnsParamCache::new(options) {
        Ok(cache) => Arc::new(cache),
        Err(error) => {
            logger::error(format!(
                "ttl queue thread failed to start, cache answers will not expire: {error}"
            ));
            Arc::new(DnsParamCache::manual(options))
        }
    }
});

impl DnsParamCache {
    /// Builds a cache whose TTL queue is driven by its own thread.
    pub fn new(options: CacheOptions) -> io::Result<Self> {
        let cache = Self::manual(options);
        let handle = cache.queue.spawn_ticker(options.tick)?;
        *cache.ticker.lock() = Some(handle);
        Ok(cache)
    }

    /// Builds a cache whose TTL queue only advances through [`DnsParamCache::tick`].
    pub fn manual(options: CacheOptions) -> Self {
        Self {
            networks: Mutex::new(Networks::default()),
            vpn: Mutex::new(VpnRouting::default()),
            queue: Arc::new(DelayedQueue::new(
                options.window_slots,
                options.deferred_slots,
            )),
            ticker: Mutex::new(None),
            options,
        }
    }

    /// Process-wide instance, started on first use.
    pub fn global() -> Arc<DnsParamCache> {
        Arc::clone(&GLOBAL)
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn create_cache_for_net(&self, net_id: u16) -> Result<(), CacheError> {
        let mut networks = self.networks.lock();
        if networks.configs.contains_key(&net_id) {
            return Err(CacheError::AlreadyExists(net_id));
        }
        networks
            .configs
            .insert(net_id, DnsResolvConfig::new(net_id, self.options.capacity));
        logger::breadcrumb(BreadcrumbFlags::CACHE, format!("created network {net_id}"));
        Ok(())
    }

    pub fn destroy_network_cache(&self, net_id: u16) -> Result<(), CacheError> {
        let mut networks = self.networks.lock();
        if networks.configs.remove(&net_id).is_none() {
            return Err(CacheError::NotFound(net_id));
        }
        if networks.default_net_id == net_id {
            networks.default_net_id = 0;
        }
        networks.clear_all_caches();
        logger::breadcrumb(BreadcrumbFlags::CACHE, format!("destroyed network {net_id}"));
        Ok(())
    }

    /// Servers beyond `MAX_SERVER_NUM - 1` are dropped. Zero timeout or retry
    /// fall back to [`RES_TIMEOUT`] and [`RES_DEFAULT_RETRY`]. Every network's
    /// answer cache is flushed.
    pub fn set_resolver_config(
        &self,
        net_id: u16,
        timeout_ms: u16,
        retry_count: u8,
        servers: &[String],
        domains: &[String],
    ) -> Result<(), CacheError> {
        let mut networks = self.networks.lock();
        let config = networks.get_mut(net_id)?;
        let changed = config.apply(timeout_ms, retry_count, servers, domains);
        let revision = config.revision_id;
        networks.clear_all_caches();
        logger::breadcrumb(
            BreadcrumbFlags::CACHE,
            format!(
                "net {net_id} resolver config set ({} servers, changed={changed}, rev={revision})",
                servers.len()
            ),
        );
        Ok(())
    }

    pub fn resolver_config(&self, net_id: u16) -> Result<ResolverConfig, CacheError> {
        self.networks.lock().get(net_id).map(DnsResolvConfig::snapshot)
    }

    /// Same as [`DnsParamCache::resolver_config`] but routes `uid` to the VPN
    /// network when one of its ranges covers it. A VPN network without a cache
    /// falls back to `net_id`.
    pub fn resolver_config_for_uid(
        &self,
        net_id: u16,
        uid: u32,
    ) -> Result<ResolverConfig, CacheError> {
        if let Some(vpn_net) = self.vpn_net_for(uid) {
            if let Ok(config) = self.resolver_config(vpn_net) {
                return Ok(config);
            }
        }
        self.resolver_config(net_id)
    }

    pub fn set_default_network(&self, net_id: u16) {
        self.networks.lock().default_net_id = net_id;
        logger::breadcrumb(BreadcrumbFlags::CACHE, format!("default network {net_id}"));
    }

    pub fn default_network(&self) -> u16 {
        self.networks.lock().default_net_id
    }

    pub fn enable_ipv6(&self, net_id: u16) -> Result<(), CacheError> {
        self.networks.lock().get_mut(net_id)?.ipv6_enabled = true;
        Ok(())
    }

    /// Unknown networks report false.
    pub fn is_ipv6_enabled(&self, net_id: u16) -> bool {
        self.networks
            .lock()
            .get(net_id)
            .map(|config| config.ipv6_enabled)
            .unwrap_or(false)
    }

    pub fn enable_ipv4(&self, net_id: u16) -> Result<(), CacheError> {
        self.networks.lock().get_mut(net_id)?.ipv4_enabled = true;
        Ok(())
    }

    pub fn is_ipv4_enabled(&self, net_id: u16) -> bool {
        self.networks
            .lock()
            .get(net_id)
            .map(|config| config.ipv4_enabled)
            .unwrap_or(false)
    }

    pub fn set_clat_dns_enable_ipv4(&self, net_id: u16, enabled: bool) -> Result<(), CacheError> {
        self.networks.lock().get_mut(net_id)?.clat_ipv4_enabled = enabled;
        Ok(())
    }

    pub fn is_clat_ipv4_enabled(&self, net_id: u16) -> bool {
        self.networks
            .lock()
            .get(net_id)
            .map(|config| config.clat_ipv4_enabled)
            .unwrap_or(false)
    }

    pub fn set_user_defined_server_flag(&self, net_id: u16, flag: bool) -> Result<(), CacheError> {
        self.networks.lock().get_mut(net_id)?.user_defined_server = flag;
        Ok(())
    }

    pub fn user_defined_server_flag(&self, net_id: u16) -> Result<bool, CacheError> {
        self.networks
            .lock()
            .get(net_id)
            .map(|config| config.user_defined_server)
    }

    pub fn user_defined_server_flag_for_uid(
        &self,
        net_id: u16,
        uid: u32,
    ) -> Result<bool, CacheError> {
        if let Some(vpn_net) = self.vpn_net_for(uid) {
            if let Ok(flag) = self.user_defined_server_flag(vpn_net) {
                return Ok(flag);
            }
        }
        self.user_defined_server_flag(net_id)
    }

    /// Stores `info` under `host` with the configured default TTL.
    pub fn set_dns_cache(&self, net_id: u16, host: &str, info: AddrInfo) -> Result<(), CacheError> {
        self.set_dns_cache_with_ttl(
            net_id,
            host,
            CachedAddrInfo {
                info,
                ttl: self.options.default_ttl,
            },
        )
    }

    pub fn set_dns_cache_with_ttl(
        &self,
        net_id: u16,
        host: &str,
        answer: CachedAddrInfo,
    ) -> Result<(), CacheError> {
        if host.is_empty() {
            return Err(CacheError::InvalidArgument);
        }
        self.answer_cache(net_id)?.put(host, answer);
        Ok(())
    }

    /// Cached answers for `host`, empty when nothing is cached or the network
    /// is unknown.
    pub fn dns_cache(&self, net_id: u16, host: &str) -> Vec<AddrInfo> {
        match self.answer_cache(net_id) {
            Ok(cache) => cache.get(host).into_iter().map(|answer| answer.info).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Schedules expiry of `host`'s answers after their smallest TTL, replacing
    /// any expiry already pending for it.
    pub fn set_cache_delayed(&self, net_id: u16, host: &str) -> Result<(), CacheError> {
        let cache = self.answer_cache(net_id)?;
        let net_id = self.networks.lock().resolve(net_id);
        let task = Arc::new(CacheExpiry::new(net_id, host, &cache));
        let delay = task.remaining_time();
        if delay > 0 {
            self.queue.put(task, delay);
        }
        Ok(())
    }

    /// Advances the TTL queue by one tick.
    pub fn tick(&self) -> usize {
        self.queue.tick()
    }

    pub fn pending_expiries(&self) -> usize {
        self.queue.len()
    }

    pub fn add_uid_range(&self, net_id: u16, ranges: &[UidRange]) {
        let mut vpn = self.vpn.lock();
        vpn.net_id = net_id;
        vpn.ranges.extend_from_slice(ranges);
        vpn.ranges.sort_unstable();
        vpn.ranges.dedup();
        logger::breadcrumb(
            BreadcrumbFlags::CACHE,
            format!("vpn net {net_id} now covers {} uid ranges", vpn.ranges.len()),
        );
    }

    /// Removes `ranges`; the VPN network is forgotten once no range is left.
    pub fn del_uid_range(&self, net_id: u16, ranges: &[UidRange]) {
        let mut vpn = self.vpn.lock();
        vpn.ranges.retain(|range| !ranges.contains(range));
        if vpn.ranges.is_empty() {
            vpn.net_id = 0;
        }
        logger::breadcrumb(
            BreadcrumbFlags::CACHE,
            format!("vpn net {net_id} ranges removed, {} left", vpn.ranges.len()),
        );
    }

    pub fn is_vpn_open(&self) -> bool {
        !self.vpn.lock().ranges.is_empty()
    }

    fn vpn_net_for(&self, uid: u32) -> Option<u16> {
        let vpn = self.vpn.lock();
        if vpn.net_id == 0 {
            return None;
        }
        vpn.ranges
            .iter()
            .any(|range| range.contains(uid))
            .then_some(vpn.net_id)
    }

    fn answer_cache(&self, net_id: u16) -> Result<Arc<LruCache<CachedAddrInfo>>, CacheError> {
        self.networks
            .lock()
            .get(net_id)
            .map(|config| Arc::clone(&config.cache))
    }

    /// Human-readable state with server addresses partially masked.
    pub fn dump_info(&self) -> String {
        let (vpn_net, vpn_ranges) = {
            let vpn = self.vpn.lock();
            (vpn.net_id, vpn.ranges.len())
        };
        let networks = self.networks.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "DnsParamCache: default net {}, vpn net {} ({} uid ranges)",
            networks.default_net_id, vpn_net, vpn_ranges
        );
        let mut ids: Vec<u16> = networks.configs.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(config) = networks.configs.get(&id) else {
                continue;
            };
            let servers: Vec<String> = config.servers.iter().map(|s| anonymize(s)).collect();
            let _ = writeln!(
                out,
                "  net {} rev {} timeout {}ms retry {} ipv6 {} ipv4 {} cached hosts {}",
                config.net_id,
                config.revision_id,
                config.timeout_ms,
                config.retry_count,
                on_off(config.ipv6_enabled),
                on_off(config.ipv4_enabled),
                config.cache.len()
            );
            let _ = writeln!(out, "    servers: {}", servers.join(", "));
            let _ = writeln!(out, "    domains: {}", config.domains.join(", "));
        }
        out
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

/// Masks the host part of an address: last IPv4 octet, or everything past
/// the first two IPv6 groups.
pub fn anonymize(server: &str) -> String {
    match server.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.*")
        }
        Ok(IpAddr::V6(v6)) => {
            let segments = v6.segments();
            format!("{:x}:{:x}:*", segments[0], segments[1])
        }
        Err(_) => "*".to_string(),
    }
}
