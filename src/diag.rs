use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::logger::{self, BreadcrumbFlags};
use crate::wire::{AddrInfo, PostDnsQueryParam, QueryParam};

pub const MAX_RESULT_SIZE: usize = 32;

/// Outcome of one `getaddrinfo` call as reported by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsResultReport {
    pub net_id: u32,
    pub uid: u32,
    pub pid: u32,
    pub used_time_ms: u32,
    pub hostname: String,
    pub query_ret: i32,
    pub param: QueryParam,
    /// Empty when the query failed or returned nothing.
    pub addrs: Vec<AddrInfo>,
}

/// Receives resolution quality data collected from clients.
pub trait QualityReporter: Send + Sync {
    fn report_dns_result(&self, report: DnsResultReport);

    fn report_dns_query_result(&self, query: PostDnsQueryParam, addrs: Vec<AddrInfo>);

    fn report_dns_query_abnormal(&self, fail_cause: u32, query: PostDnsQueryParam, addrs: Vec<AddrInfo>);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QualityEventKind {
    Result(DnsResultReport),
    QueryResult {
        query: PostDnsQueryParam,
        addrs: Vec<AddrInfo>,
    },
    Abnormal {
        fail_cause: u32,
        query: PostDnsQueryParam,
        addrs: Vec<AddrInfo>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QualityEvent {
    pub timestamp_ms: u64,
    pub kind: QualityEventKind,
}

#[derive(Default)]
struct DiagInner {
    events: VecDeque<QualityEvent>,
    dropped: u64,
}

/// Bounded backlog of quality reports waiting for a consumer.
#[derive(Default)]
pub struct DnsQualityDiag {
    inner: Mutex<DiagInner>,
}

impl DnsQualityDiag {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DiagInner {
                events: VecDeque::with_capacity(MAX_RESULT_SIZE),
                dropped: 0,
            }),
        }
    }

    fn record(&self, kind: QualityEventKind) {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut guard = self.inner.lock();
        if guard.events.len() >= MAX_RESULT_SIZE {
            guard.events.pop_front();
            guard.dropped = guard.dropped.saturating_add(1);
            logger::breadcrumb(
                BreadcrumbFlags::DIAG,
                "quality backlog saturated, dropping oldest report",
            );
        }
        guard.events.push_back(QualityEvent { timestamp_ms, kind });
    }

    /// Removes up to `max_events` reports, oldest first, and returns them with
    /// the number dropped since the previous drain.
    pub fn drain(&self, max_events: usize) -> (Vec<QualityEvent>, u64) {
        let mut guard = self.inner.lock();
        let count = max_events.min(guard.events.len());
        let drained: Vec<QualityEvent> = guard.events.drain(..count).collect();
        let dropped = std::mem::take(&mut guard.dropped);
        (drained, dropped)
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().events.len()
    }
}

fn describe(addrs: &[AddrInfo]) -> String {
    addrs
        .iter()
        .filter_map(AddrInfo::ip)
        .map(|ip| crate::cache::anonymize(&ip.to_string()))
        .collect::<Vec<_>>()
        .join(",")
}

impl QualityReporter for DnsQualityDiag {
    fn report_dns_result(&self, report: DnsResultReport) {
        logger::breadcrumb(
            BreadcrumbFlags::DIAG,
            format!(
                "dns result net={} uid={} ret={} {}ms [{}]",
                report.net_id,
                report.uid,
                report.query_ret,
                report.used_time_ms,
                describe(&report.addrs)
            ),
        );
        self.record(QualityEventKind::Result(report));
    }

    fn report_dns_query_result(&self, query: PostDnsQueryParam, addrs: Vec<AddrInfo>) {
        logger::breadcrumb(
            BreadcrumbFlags::DIAG,
            format!(
                "query result net={} uid={} ret={} cache={} [{}]",
                query.net_id,
                query.uid,
                query.process_info.ret_code,
                query.process_info.is_from_cache,
                describe(&addrs)
            ),
        );
        self.record(QualityEventKind::QueryResult { query, addrs });
    }

    fn report_dns_query_abnormal(&self, fail_cause: u32, query: PostDnsQueryParam, addrs: Vec<AddrInfo>) {
        logger::breadcrumb(
            BreadcrumbFlags::DIAG,
            format!(
                "abnormal query uid={} pid={} cause={fail_cause}",
                query.uid, query.pid
            ),
        );
        self.record(QualityEventKind::Abnormal {
            fail_cause,
            query,
            addrs,
        });
    }
}
