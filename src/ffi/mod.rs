use crate::cache::ResolverConfig;
use crate::diag::{QualityEvent, QualityEventKind};
use crate::wire::{MAX_HOST_NAME_LEN, MAX_SERVER_LENGTH, MAX_SERVER_NUM};
use std::ffi::{c_char, c_void};

pub const DNSD_MAX_SERVERS: usize = MAX_SERVER_NUM;
pub const DNSD_SERVER_LENGTH: usize = MAX_SERVER_LENGTH + 1;
pub const DNSD_HOST_LENGTH: usize = MAX_HOST_NAME_LEN + 1;

/// Mirror of the `DnsdConfig` struct defined in `include/dnsd.h`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DnsdConfig {
    /// Open connections are all closed after this long without activity.
    pub idle_timeout_ms: u32,
    pub max_epoll_events: u32,
    pub listen_backlog: u32,
    pub ttl_tick_ms: u32,
    pub ttl_window_slots: u32,
    pub ttl_deferred_slots: u32,
    /// Host names cached per network.
    pub cache_capacity: u32,
    /// TTL for answers stored through `SET_CACHE`.
    pub default_ttl_secs: u32,
}

impl Default for DnsdConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 5_000,
            max_epoll_events: 32,
            listen_backlog: 1_024,
            ttl_tick_ms: 1_000,
            ttl_window_slots: 60,
            ttl_deferred_slots: 4,
            cache_capacity: 50,
            default_ttl_secs: 60,
        }
    }
}

#[repr(C)]
pub struct DnsdLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DnsdUidRange {
    pub begin: u32,
    pub end: u32,
}

/// Resolver parameters copied out by `DnsdGetResolverConfig`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DnsdResolverConfig {
    pub net_id: u16,
    pub retry_count: u8,
    pub timeout_ms: u16,
    pub server_count: u32,
    pub servers: [[c_char; DNSD_SERVER_LENGTH]; DNSD_MAX_SERVERS],
}

impl Default for DnsdResolverConfig {
    fn default() -> Self {
        Self {
            net_id: 0,
            retry_count: 0,
            timeout_ms: 0,
            server_count: 0,
            servers: [[0; DNSD_SERVER_LENGTH]; DNSD_MAX_SERVERS],
        }
    }
}

impl DnsdResolverConfig {
    /// Overlong servers are skipped.
    pub fn populate(&mut self, config: &ResolverConfig) {
        *self = Self::default();
        self.net_id = config.net_id;
        self.retry_count = config.retry_count;
        self.timeout_ms = config.timeout_ms;
        let mut count = 0;
        for server in &config.servers {
            if count == DNSD_MAX_SERVERS {
                break;
            }
            if copy_c_string(&mut self.servers[count], server) {
                count += 1;
            }
        }
        self.server_count = count as u32;
    }
}

pub const DNSD_EVENT_RESULT: u8 = 0;
pub const DNSD_EVENT_QUERY_RESULT: u8 = 1;
pub const DNSD_EVENT_ABNORMAL: u8 = 2;

/// Flattened quality report handed out by `DnsdDrainReports`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DnsdQualityEvent {
    pub timestamp_ms: u64,
    pub kind: u8,
    pub addr_count: u8,
    pub net_id: u32,
    pub uid: u32,
    pub pid: u32,
    /// `queryRet` for results, `retCode` for query reports.
    pub ret_code: i32,
    pub fail_cause: u32,
    pub used_time_ms: u32,
    pub hostname: [c_char; DNSD_HOST_LENGTH],
}

impl Default for DnsdQualityEvent {
    fn default() -> Self {
        Self {
            timestamp_ms: 0,
            kind: 0,
            addr_count: 0,
            net_id: 0,
            uid: 0,
            pid: 0,
            ret_code: 0,
            fail_cause: 0,
            used_time_ms: 0,
            hostname: [0; DNSD_HOST_LENGTH],
        }
    }
}

impl From<&QualityEvent> for DnsdQualityEvent {
    fn from(event: &QualityEvent) -> Self {
        let mut out = Self {
            timestamp_ms: event.timestamp_ms,
            ..Self::default()
        };
        match &event.kind {
            QualityEventKind::Result(report) => {
                out.kind = DNSD_EVENT_RESULT;
                out.net_id = report.net_id;
                out.uid = report.uid;
                out.pid = report.pid;
                out.ret_code = report.query_ret;
                out.used_time_ms = report.used_time_ms;
                out.addr_count = report.addrs.len().min(u8::MAX as usize) as u8;
                copy_c_string_lossy(&mut out.hostname, &report.hostname);
            }
            QualityEventKind::QueryResult { query, addrs } => {
                out.kind = DNSD_EVENT_QUERY_RESULT;
                out.net_id = query.net_id;
                out.uid = query.uid;
                out.pid = query.pid;
                out.ret_code = query.process_info.ret_code;
                out.used_time_ms = query.process_info.first_query_end2app_duration;
                out.addr_count = addrs.len().min(u8::MAX as usize) as u8;
                copy_c_string_lossy(&mut out.hostname, &query.process_info.hostname);
            }
            QualityEventKind::Abnormal {
                fail_cause,
                query,
                addrs,
            } => {
                out.kind = DNSD_EVENT_ABNORMAL;
                out.fail_cause = *fail_cause;
                out.net_id = query.net_id;
                out.uid = query.uid;
                out.pid = query.pid;
                out.ret_code = query.process_info.ret_code;
                out.used_time_ms = query.process_info.first_query_end2app_duration;
                out.addr_count = addrs.len().min(u8::MAX as usize) as u8;
                copy_c_string_lossy(&mut out.hostname, &query.process_info.hostname);
            }
        }
        out
    }
}

/// Copies `value` with a trailing NUL. Returns false, leaving `dest` zeroed,
/// when it does not fit.
fn copy_c_string<const N: usize>(dest: &mut [c_char; N], value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() >= N || bytes.contains(&0) {
        return false;
    }
    for (slot, byte) in dest.iter_mut().zip(bytes) {
        *slot = *byte as c_char;
    }
    dest[bytes.len()] = 0;
    true
}

fn copy_c_string_lossy<const N: usize>(dest: &mut [c_char; N], value: &str) {
    let len = value.len().min(N - 1);
    for (slot, byte) in dest.iter_mut().zip(&value.as_bytes()[..len]) {
        *slot = *byte as c_char;
    }
    dest[len] = 0;
}
