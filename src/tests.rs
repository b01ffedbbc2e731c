use super::*;
use crate::client::NetsysClient;
use crate::diag::{DnsResultReport, QualityReporter};
use crate::ffi::DNSD_EVENT_RESULT;
use crate::wire::{AddrInfo, QueryParam};
use std::ffi::CString;
use std::ptr;

struct Service(*mut DnsResolvService);

impl Service {
    fn new() -> Self {
        let config = DnsdConfig::default();
        let raw = unsafe { DnsdNewService(&config) };
        assert!(!raw.is_null());
        Self(raw)
    }

    fn get(&self) -> &DnsResolvService {
        unsafe { &*self.0 }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        unsafe { DnsdFreeService(self.0) };
    }
}

fn set_servers(service: &Service, net_id: u16, servers: &[&str]) -> i32 {
    let owned: Vec<CString> = servers.iter().map(|s| CString::new(*s).unwrap()).collect();
    let pointers: Vec<*const c_char> = owned.iter().map(|s| s.as_ptr()).collect();
    unsafe {
        DnsdSetResolverConfig(
            service.0,
            net_id,
            2500,
            3,
            pointers.as_ptr(),
            pointers.len(),
            ptr::null(),
            0,
        )
    }
}

#[test]
fn normalize_clamps_out_of_range_values() {
    let config = DnsdConfig {
        idle_timeout_ms: 0,
        max_epoll_events: 0,
        listen_backlog: u32::MAX,
        ttl_tick_ms: 1,
        ttl_window_slots: 0,
        ttl_deferred_slots: 500,
        cache_capacity: 0,
        default_ttl_secs: u32::MAX,
    };
    let (server, options) = normalize_config(&config);
    assert_eq!(server.idle_timeout, Duration::from_millis(100));
    assert_eq!(server.max_events, 1);
    assert_eq!(server.backlog, 4_096);
    assert_eq!(options.tick, Duration::from_millis(10));
    assert_eq!(options.window_slots, 1);
    assert_eq!(options.deferred_slots, 64);
    assert_eq!(options.capacity, 1);
    assert_eq!(options.default_ttl, 86_400);

    let (server, options) = normalize_config(&DnsdConfig::default());
    assert_eq!(server.idle_timeout, Duration::from_millis(5_000));
    assert_eq!(server.max_events, 32);
    assert_eq!(options.capacity, 50);
    assert_eq!(options.tick, Duration::from_secs(1));
}

#[test]
fn feed_calls_report_errno_status() {
    let service = Service::new();
    assert_eq!(unsafe { DnsdCreateCacheForNet(service.0, 100) }, 0);
    assert_eq!(unsafe { DnsdCreateCacheForNet(service.0, 100) }, -libc::EEXIST);
    assert_eq!(unsafe { DnsdDestroyNetworkCache(service.0, 7) }, -libc::ENOENT);
    assert_eq!(unsafe { DnsdEnableIpv6(service.0, 7) }, -libc::ENOENT);
    assert_eq!(unsafe { DnsdEnableIpv6(service.0, 100) }, 0);
    assert_eq!(unsafe { DnsdEnableIpv4(service.0, 100) }, 0);
    assert_eq!(unsafe { DnsdSetClatDnsEnableIpv4(service.0, 100, true) }, 0);
    assert_eq!(unsafe { DnsdSetUserDefinedServerFlag(service.0, 100, true) }, 0);
    assert_eq!(unsafe { DnsdSetDefaultNetwork(service.0, 100) }, 0);

    let cache = service.get().cache();
    assert!(cache.is_ipv6_enabled(100));
    assert!(cache.is_clat_ipv4_enabled(100));
    assert_eq!(cache.user_defined_server_flag(100), Ok(true));
    assert_eq!(cache.default_network(), 100);
}

#[test]
fn null_arguments_are_rejected() {
    assert_eq!(unsafe { DnsdCreateCacheForNet(ptr::null_mut(), 1) }, -libc::EINVAL);
    assert_eq!(unsafe { DnsdServiceStop(ptr::null_mut()) }, -libc::EINVAL);
    assert_eq!(unsafe { DnsdServiceStart(ptr::null_mut(), ptr::null()) }, -libc::EINVAL);
    assert_eq!(
        unsafe { DnsdDrainReports(ptr::null_mut(), ptr::null_mut(), 4, ptr::null_mut()) },
        0
    );

    let service = Service::new();
    assert_eq!(unsafe { DnsdCreateCacheForNet(service.0, 1) }, 0);
    assert_eq!(
        unsafe { DnsdGetResolverConfig(service.0, 1, ptr::null_mut()) },
        -libc::EINVAL
    );
    assert_eq!(
        unsafe { DnsdSetResolverConfig(service.0, 1, 100, 2, ptr::null(), 2, ptr::null(), 0) },
        -libc::EINVAL
    );
    assert_eq!(
        unsafe { DnsdAddUidRange(service.0, 1, ptr::null(), 1) },
        -libc::EINVAL
    );
    unsafe { DnsdFreeService(ptr::null_mut()) };
}

#[test]
fn resolver_config_round_trips_through_abi() {
    let service = Service::new();
    assert_eq!(unsafe { DnsdCreateCacheForNet(service.0, 100) }, 0);
    assert_eq!(set_servers(&service, 100, &["8.8.8.8", "1.1.1.1"]), 0);
    assert_eq!(set_servers(&service, 101, &["8.8.8.8"]), -libc::ENOENT);

    let mut out = DnsdResolverConfig::default();
    assert_eq!(unsafe { DnsdGetResolverConfig(service.0, 100, &mut out) }, 0);
    assert_eq!(out.net_id, 100);
    assert_eq!(out.retry_count, 3);
    assert_eq!(out.timeout_ms, 2500);
    assert_eq!(out.server_count, 2);
    let first = unsafe { CStr::from_ptr(out.servers[0].as_ptr()) };
    assert_eq!(first.to_str().unwrap(), "8.8.8.8");

    assert_eq!(
        unsafe { DnsdGetResolverConfig(service.0, 55, &mut out) },
        -libc::ENOENT
    );
    assert_eq!(out.server_count, 0);
}

#[test]
fn uid_ranges_route_vpn_lookups() {
    let service = Service::new();
    for net_id in [100, 200] {
        assert_eq!(unsafe { DnsdCreateCacheForNet(service.0, net_id) }, 0);
    }
    assert_eq!(set_servers(&service, 100, &["8.8.8.8"]), 0);
    assert_eq!(set_servers(&service, 200, &["10.0.0.53"]), 0);

    let ranges = [DnsdUidRange {
        begin: 10_000,
        end: 10_999,
    }];
    assert_eq!(
        unsafe { DnsdAddUidRange(service.0, 200, ranges.as_ptr(), ranges.len()) },
        0
    );
    let cache = service.get().cache();
    assert!(cache.is_vpn_open());
    let routed = cache.resolver_config_for_uid(100, 10_500).unwrap();
    assert_eq!(routed.servers, vec!["10.0.0.53".to_string()]);
    let direct = cache.resolver_config_for_uid(100, 20_000).unwrap();
    assert_eq!(direct.servers, vec!["8.8.8.8".to_string()]);

    assert_eq!(
        unsafe { DnsdDelUidRange(service.0, 200, ranges.as_ptr(), ranges.len()) },
        0
    );
    assert!(!cache.is_vpn_open());
}

#[test]
fn start_serves_socket_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dnsproxyd");
    let c_path = CString::new(path.to_str().unwrap()).unwrap();
    let service = Service::new();
    assert_eq!(unsafe { DnsdCreateCacheForNet(service.0, 100) }, 0);
    assert_eq!(unsafe { DnsdEnableIpv6(service.0, 100) }, 0);

    assert_eq!(unsafe { DnsdServiceStart(service.0, c_path.as_ptr()) }, 0);
    assert!(service.get().is_running());
    assert_eq!(
        unsafe { DnsdServiceStart(service.0, c_path.as_ptr()) },
        -libc::EALREADY
    );

    let client = NetsysClient::new(path.clone());
    assert!(client.is_ipv6_enabled(100));
    assert!(!client.is_ipv4_enabled(100));

    assert_eq!(unsafe { DnsdServiceStop(service.0) }, 0);
    assert!(!service.get().is_running());
    assert!(!path.exists());

    assert_eq!(unsafe { DnsdServiceStart(service.0, c_path.as_ptr()) }, 0);
    assert!(client.is_ipv6_enabled(100));
}

#[test]
fn drain_reports_flattens_into_caller_array() {
    let service = Service::new();
    for (host, used) in [("a.test", 10), ("b.test", 20), ("c.test", 30)] {
        service.get().diag().report_dns_result(DnsResultReport {
            net_id: 100,
            uid: 10_001,
            pid: 77,
            used_time_ms: used,
            hostname: host.to_string(),
            query_ret: 0,
            param: QueryParam::default(),
            addrs: vec![AddrInfo::from_ip("192.0.2.1".parse().unwrap())],
        });
    }

    let mut out = [DnsdQualityEvent::default(); 2];
    let mut dropped = u64::MAX;
    let count = unsafe { DnsdDrainReports(service.0, out.as_mut_ptr(), out.len(), &mut dropped) };
    assert_eq!(count, 2);
    assert_eq!(dropped, 0);
    assert_eq!(out[0].kind, DNSD_EVENT_RESULT);
    assert_eq!(out[0].used_time_ms, 10);
    assert_eq!(out[1].used_time_ms, 20);
    assert_eq!(out[1].addr_count, 1);

    let count = unsafe { DnsdDrainReports(service.0, out.as_mut_ptr(), out.len(), ptr::null_mut()) };
    assert_eq!(count, 1);
    assert_eq!(out[0].used_time_ms, 30);
    assert_eq!(service.get().diag().pending(), 0);
}

#[test]
fn null_config_binds_process_cache() {
    let raw = unsafe { DnsdNewService(ptr::null()) };
    assert!(!raw.is_null());
    let service = unsafe { &*raw };
    assert!(Arc::ptr_eq(service.cache(), &DnsParamCache::global()));
    unsafe { DnsdFreeService(raw) };
}
