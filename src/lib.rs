#![deny(unsafe_op_in_unsafe_fn)]

pub mod cache;
pub mod client;
pub mod delayed;
pub mod diag;
pub mod epoll;
pub mod ffi;
pub mod listener;
pub mod logger;
pub mod platform;
pub mod socket;
pub mod wire;

use crate::cache::{CacheError, CacheOptions, DnsParamCache, UidRange};
use crate::diag::{DnsQualityDiag, QualityEvent};
use crate::epoll::ServerConfig;
use crate::ffi::{DnsdConfig, DnsdLogSink, DnsdQualityEvent, DnsdResolverConfig, DnsdUidRange};
use crate::listener::{DnsResolvListen, DnsResolvProtocol, ListenerConfig, ListenerHandle};
use crate::logger::BreadcrumbFlags;
use crate::wire::DNS_SOCKET_PATH;
use anyhow::Context;
use parking_lot::Mutex;
use std::ffi::{CStr, OsStr};
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

const MIN_IDLE_TIMEOUT_MS: u32 = 100;
const MAX_IDLE_TIMEOUT_MS: u32 = 600_000;
const MAX_EVENTS_LIMIT: u32 = 1_024;
const MAX_BACKLOG: u32 = 4_096;
const MIN_TTL_TICK_MS: u32 = 10;
const MAX_TTL_TICK_MS: u32 = 60_000;
const MAX_WINDOW_SLOTS: u32 = 3_600;
const MAX_DEFERRED_SLOTS: u32 = 64;
const MAX_CACHE_CAPACITY: u32 = 1_024;
const MAX_DEFAULT_TTL_SECS: u32 = 86_400;

/// Opaque service handle owned by the connectivity manager.
pub struct DnsResolvService {
    cache: Arc<DnsParamCache>,
    diag: Arc<DnsQualityDiag>,
    server: ServerConfig,
    listener: Mutex<Option<ListenerHandle>>,
}

impl DnsResolvService {
    /// Builds a service with a dedicated cache and TTL thread.
    pub fn new(config: DnsdConfig) -> anyhow::Result<Self> {
        let (server, options) = normalize_config(&config);
        let cache = DnsParamCache::new(options).context("starting ttl queue thread")?;
        logger::breadcrumb(
            BreadcrumbFlags::FFI,
            format!(
                "DnsResolvService initialized (capacity={}, idle={}ms)",
                options.capacity,
                server.idle_timeout.as_millis()
            ),
        );
        Ok(Self::with_cache(Arc::new(cache), server))
    }

    pub fn with_cache(cache: Arc<DnsParamCache>, server: ServerConfig) -> Self {
        Self {
            cache,
            diag: Arc::new(DnsQualityDiag::new()),
            server,
            listener: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<DnsParamCache> {
        &self.cache
    }

    pub fn diag(&self) -> &Arc<DnsQualityDiag> {
        &self.diag
    }

    pub fn is_running(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(ListenerHandle::is_running)
    }

    pub fn start(&self, socket_path: &Path) -> anyhow::Result<()> {
        let mut slot = self.listener.lock();
        if let Some(previous) = slot.take() {
            if previous.is_running() {
                let path = previous.socket_path().display().to_string();
                *slot = Some(previous);
                anyhow::bail!("listener already running on {path}");
            }
            previous.stop();
        }
        let protocol =
            DnsResolvProtocol::new(Arc::clone(&self.cache)).with_reporter(self.diag.clone());
        let config = ListenerConfig {
            socket_path: socket_path.to_path_buf(),
            server: self.server,
        };
        *slot = Some(DnsResolvListen::new(config, protocol).start_listen()?);
        logger::breadcrumb(
            BreadcrumbFlags::FFI,
            format!("DnsResolvService listening on {}", socket_path.display()),
        );
        Ok(())
    }

    pub fn stop(&self) {
        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            handle.stop();
            logger::breadcrumb(BreadcrumbFlags::FFI, "DnsResolvService stopped");
        }
    }

    pub fn drain_reports(&self, max_events: usize) -> (Vec<QualityEvent>, u64) {
        self.diag.drain(max_events)
    }
}

impl Drop for DnsResolvService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn clamp(value: u32, min: u32, max: u32) -> u32 {
    value.max(min).min(max)
}

fn normalize_config(config: &DnsdConfig) -> (ServerConfig, CacheOptions) {
    let server = ServerConfig {
        max_events: clamp(config.max_epoll_events, 1, MAX_EVENTS_LIMIT) as usize,
        idle_timeout: Duration::from_millis(u64::from(clamp(
            config.idle_timeout_ms,
            MIN_IDLE_TIMEOUT_MS,
            MAX_IDLE_TIMEOUT_MS,
        ))),
        backlog: clamp(config.listen_backlog, 1, MAX_BACKLOG) as i32,
    };
    let options = CacheOptions {
        capacity: clamp(config.cache_capacity, 1, MAX_CACHE_CAPACITY) as usize,
        default_ttl: clamp(config.default_ttl_secs, 1, MAX_DEFAULT_TTL_SECS),
        window_slots: clamp(config.ttl_window_slots, 1, MAX_WINDOW_SLOTS) as usize,
        deferred_slots: clamp(config.ttl_deferred_slots, 1, MAX_DEFERRED_SLOTS) as usize,
        tick: Duration::from_millis(u64::from(clamp(
            config.ttl_tick_ms,
            MIN_TTL_TICK_MS,
            MAX_TTL_TICK_MS,
        ))),
    };
    (server, options)
}

fn status(result: Result<(), CacheError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(error) => {
            logger::breadcrumb(BreadcrumbFlags::FFI, format!("feed call failed: {error}"));
            error.status()
        }
    }
}

/// Reads `count` C strings. `None` when the array or any entry is unusable.
unsafe fn string_list(items: *const *const c_char, count: usize) -> Option<Vec<String>> {
    if count == 0 {
        return Some(Vec::new());
    }
    if items.is_null() {
        return None;
    }
    // Safety: caller guarantees `items` points to `count` pointers.
    let items = unsafe { slice::from_raw_parts(items, count) };
    items
        .iter()
        .map(|item| {
            if item.is_null() {
                return None;
            }
            unsafe { CStr::from_ptr(*item) }
                .to_str()
                .ok()
                .map(str::to_owned)
        })
        .collect()
}

unsafe fn uid_ranges(ranges: *const DnsdUidRange, count: usize) -> Option<Vec<UidRange>> {
    if ranges.is_null() || count == 0 {
        return None;
    }
    // Safety: caller guarantees `ranges` points to `count` entries.
    let ranges = unsafe { slice::from_raw_parts(ranges, count) };
    Some(
        ranges
            .iter()
            .map(|range| UidRange::new(range.begin, range.end))
            .collect(),
    )
}

#[no_mangle]
pub unsafe extern "C" fn DnsdNewService(config: *const DnsdConfig) -> *mut DnsResolvService {
    let Some(config) = NonNull::new(config as *mut DnsdConfig) else {
        let service =
            DnsResolvService::with_cache(DnsParamCache::global(), ServerConfig::default());
        return Box::into_raw(Box::new(service));
    };
    match DnsResolvService::new(unsafe { *config.as_ptr() }) {
        Ok(service) => Box::into_raw(Box::new(service)),
        Err(error) => {
            crate::logger::error(format!("DnsdNewService failed: {error:?}"));
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn DnsdFreeService(service: *mut DnsResolvService) {
    if let Some(service) = NonNull::new(service) {
        unsafe {
            drop(Box::from_raw(service.as_ptr()));
        }
    }
}

/// Serves the dnsproxyd socket at `socket_path`, or the default path when null.
#[no_mangle]
pub unsafe extern "C" fn DnsdServiceStart(
    service: *mut DnsResolvService,
    socket_path: *const c_char,
) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    let path = if socket_path.is_null() {
        Path::new(DNS_SOCKET_PATH)
    } else {
        Path::new(OsStr::from_bytes(
            unsafe { CStr::from_ptr(socket_path) }.to_bytes(),
        ))
    };
    if path.as_os_str().is_empty() {
        return -libc::EINVAL;
    }
    let service = unsafe { service.as_ref() };
    if service.is_running() {
        return -libc::EALREADY;
    }
    match service.start(path) {
        Ok(()) => 0,
        Err(error) => {
            crate::logger::error(format!("DnsdServiceStart error: {error:?}"));
            -libc::EIO
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn DnsdServiceStop(service: *mut DnsResolvService) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    unsafe { service.as_ref() }.stop();
    0
}

#[no_mangle]
pub unsafe extern "C" fn DnsdCreateCacheForNet(service: *mut DnsResolvService, net_id: u16) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    status(unsafe { service.as_ref() }.cache.create_cache_for_net(net_id))
}

#[no_mangle]
pub unsafe extern "C" fn DnsdDestroyNetworkCache(
    service: *mut DnsResolvService,
    net_id: u16,
) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    status(unsafe { service.as_ref() }.cache.destroy_network_cache(net_id))
}

#[no_mangle]
pub unsafe extern "C" fn DnsdSetResolverConfig(
    service: *mut DnsResolvService,
    net_id: u16,
    timeout_ms: u16,
    retry_count: u8,
    servers: *const *const c_char,
    server_count: usize,
    domains: *const *const c_char,
    domain_count: usize,
) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    let Some(servers) = (unsafe { string_list(servers, server_count) }) else {
        return -libc::EINVAL;
    };
    let Some(domains) = (unsafe { string_list(domains, domain_count) }) else {
        return -libc::EINVAL;
    };
    status(unsafe { service.as_ref() }.cache.set_resolver_config(
        net_id,
        timeout_ms,
        retry_count,
        &servers,
        &domains,
    ))
}

#[no_mangle]
pub unsafe extern "C" fn DnsdGetResolverConfig(
    service: *mut DnsResolvService,
    net_id: u16,
    out: *mut DnsdResolverConfig,
) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return -libc::EINVAL;
    };
    match unsafe { service.as_ref() }.cache.resolver_config(net_id) {
        Ok(config) => {
            out.populate(&config);
            0
        }
        Err(error) => {
            *out = DnsdResolverConfig::default();
            error.status()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn DnsdSetDefaultNetwork(service: *mut DnsResolvService, net_id: u16) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    unsafe { service.as_ref() }.cache.set_default_network(net_id);
    0
}

#[no_mangle]
pub unsafe extern "C" fn DnsdEnableIpv6(service: *mut DnsResolvService, net_id: u16) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    status(unsafe { service.as_ref() }.cache.enable_ipv6(net_id))
}

#[no_mangle]
pub unsafe extern "C" fn DnsdEnableIpv4(service: *mut DnsResolvService, net_id: u16) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    status(unsafe { service.as_ref() }.cache.enable_ipv4(net_id))
}

#[no_mangle]
pub unsafe extern "C" fn DnsdSetClatDnsEnableIpv4(
    service: *mut DnsResolvService,
    net_id: u16,
    enabled: bool,
) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    status(
        unsafe { service.as_ref() }
            .cache
            .set_clat_dns_enable_ipv4(net_id, enabled),
    )
}

#[no_mangle]
pub unsafe extern "C" fn DnsdSetUserDefinedServerFlag(
    service: *mut DnsResolvService,
    net_id: u16,
    flag: bool,
) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    status(
        unsafe { service.as_ref() }
            .cache
            .set_user_defined_server_flag(net_id, flag),
    )
}

#[no_mangle]
pub unsafe extern "C" fn DnsdAddUidRange(
    service: *mut DnsResolvService,
    net_id: u16,
    ranges: *const DnsdUidRange,
    count: usize,
) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    let Some(ranges) = (unsafe { uid_ranges(ranges, count) }) else {
        return -libc::EINVAL;
    };
    unsafe { service.as_ref() }.cache.add_uid_range(net_id, &ranges);
    0
}

#[no_mangle]
pub unsafe extern "C" fn DnsdDelUidRange(
    service: *mut DnsResolvService,
    net_id: u16,
    ranges: *const DnsdUidRange,
    count: usize,
) -> i32 {
    let Some(service) = NonNull::new(service) else {
        return -libc::EINVAL;
    };
    let Some(ranges) = (unsafe { uid_ranges(ranges, count) }) else {
        return -libc::EINVAL;
    };
    unsafe { service.as_ref() }.cache.del_uid_range(net_id, &ranges);
    0
}

#[no_mangle]
pub unsafe extern "C" fn DnsdSetLogSink(
    sink: *const DnsdLogSink,
    level: *const c_char,
    _error: *mut *mut std::ffi::c_void,
) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = if level.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(level) }.to_str().ok()
    };
    crate::logger::install_sink(sink_ref, level_str).is_ok()
}

#[no_mangle]
pub extern "C" fn DnsdSetBreadcrumbMask(mask: u32) {
    crate::logger::set_breadcrumb_mask(mask);
}

#[no_mangle]
pub unsafe extern "C" fn DnsdDrainReports(
    service: *mut DnsResolvService,
    out_events: *mut DnsdQualityEvent,
    max_events: usize,
    dropped_out: *mut u64,
) -> usize {
    let Some(service) = NonNull::new(service) else {
        return 0;
    };
    if out_events.is_null() || max_events == 0 {
        return 0;
    }
    let (events, dropped) = unsafe { service.as_ref() }.drain_reports(max_events);
    if let Some(ptr) = unsafe { dropped_out.as_mut() } {
        *ptr = dropped;
    }
    // Safety: caller guarantees `out_events` has room for `max_events` entries.
    let out_slice = unsafe { slice::from_raw_parts_mut(out_events, max_events) };
    for (slot, event) in out_slice.iter_mut().zip(&events) {
        *slot = DnsdQualityEvent::from(event);
    }
    events.len()
}

#[cfg(test)]
mod tests;
