use super::*;
use crate::cache::{CacheOptions, DnsParamCache};
use crate::diag::{DnsQualityDiag, QualityEventKind};
use crate::listener::{DnsResolvListen, DnsResolvProtocol, ListenerConfig, ListenerHandle};
use crate::platform::{FwmarkBinder, PropertySource};
use crate::wire::FamilyQueryInfo;
use std::sync::Arc;
use std::thread;

struct NoProperties;

impl PropertySource for NoProperties {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }
}

#[derive(Default)]
struct RecordingBinder {
    calls: std::sync::Mutex<Vec<(RawFd, u32)>>,
}

impl FwmarkBinder for RecordingBinder {
    fn bind_socket(&self, fd: RawFd, net_id: u32) -> io::Result<()> {
        self.calls.lock().unwrap().push((fd, net_id));
        Ok(())
    }
}

struct Daemon {
    _dir: tempfile::TempDir,
    _listener: ListenerHandle,
    cache: Arc<DnsParamCache>,
    diag: Arc<DnsQualityDiag>,
    binder: Arc<RecordingBinder>,
    client: NetsysClient,
}

fn daemon() -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dnsproxyd");
    let cache = Arc::new(DnsParamCache::manual(CacheOptions::default()));
    let diag = Arc::new(DnsQualityDiag::new());
    let binder = Arc::new(RecordingBinder::default());
    let protocol = DnsResolvProtocol::new(Arc::clone(&cache))
        .with_reporter(diag.clone())
        .with_binder(binder.clone())
        .with_properties(Arc::new(NoProperties));
    let config = ListenerConfig {
        socket_path: path.clone(),
        ..ListenerConfig::default()
    };
    let listener = DnsResolvListen::new(config, protocol).start_listen().unwrap();
    Daemon {
        _dir: dir,
        _listener: listener,
        cache,
        diag,
        binder,
        client: NetsysClient::new(path).with_identity(10_123, 4321),
    }
}

fn configure(cache: &DnsParamCache, net_id: u16, servers: &[&str]) {
    cache.create_cache_for_net(net_id).unwrap();
    let servers: Vec<String> = servers.iter().map(|s| s.to_string()).collect();
    cache.set_resolver_config(net_id, 3000, 2, &servers, &[]).unwrap();
}

/// Waits for the listener thread to finish with a one-way exchange.
fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done() {
        assert!(Instant::now() < deadline, "listener did not process the request");
        thread::sleep(Duration::from_millis(5));
    }
}

fn addr(ip: &str) -> AddrInfo {
    AddrInfo::from_ip(ip.parse().unwrap())
}

#[test]
fn cache_key_follows_available_parts() {
    let hints = AddrHints {
        family: libc::AF_INET,
        flags: 0,
        protocol: 6,
        socket_type: 1,
    };
    assert_eq!(cache_key("a.test", None, None), "a.test");
    assert_eq!(cache_key("a.test", Some("443"), None), "a.test 443");
    assert_eq!(cache_key("a.test", None, Some(&hints)), "a.test 2 0 6 1");
    assert_eq!(cache_key("a.test", Some("https"), Some(&hints)), "a.test https 2 0 6 1");
}

#[test]
fn resolv_conf_round_trip() {
    let d = daemon();
    configure(&d.cache, 100, &["8.8.8.8", "1.0.0.1"]);
    let config = d.client.get_resolv_conf(100).unwrap();
    assert_eq!(config.nameservers, vec!["8.8.8.8", "1.0.0.1"]);
    assert_eq!(config.timeout_ms, 3000);
    assert_eq!(config.retry_count, 2);

    let ext = d.client.get_resolv_conf_ext(100).unwrap();
    assert_eq!(ext.nameservers, config.nameservers);
}

#[test]
fn resolv_conf_errors_map_to_status() {
    let d = daemon();
    let err = d.client.get_resolv_conf(55).unwrap_err();
    assert!(matches!(err, ClientError::Status(_)));
    assert_eq!(err.status(), -libc::ENOENT);

    configure(&d.cache, 56, &[]);
    let err = d.client.get_resolv_conf(56).unwrap_err();
    assert!(matches!(err, ClientError::NoServers));
    assert_eq!(err.status(), -1);
}

#[test]
fn resolv_cache_round_trip_drops_unspecified_answers() {
    let d = daemon();
    configure(&d.cache, 100, &["8.8.8.8"]);
    let key = cache_key("www.example.test", Some("443"), None);
    let answers = vec![addr("0.0.0.0"), addr("192.0.2.8"), addr("2001:db8::8")];
    d.client.set_resolv_cache(100, &key, &answers).unwrap();

    wait_until(|| !d.cache.dns_cache(100, &key).is_empty());
    let cached = d.client.get_resolv_cache(100, &key).unwrap();
    assert_eq!(cached, answers[1..].to_vec());
    assert!(d.client.get_resolv_cache(100, "miss.test").unwrap().is_empty());
}

#[test]
fn invalid_keys_fail_before_connecting() {
    let client = NetsysClient::new("/nonexistent/dnsproxyd");
    let err = client.get_resolv_cache(1, "").unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)));
    let long = "h".repeat(MAX_HOST_NAME_LEN);
    let err = client.set_resolv_cache(1, &long, &[]).unwrap_err();
    assert_eq!(err.status(), -libc::EINVAL);
}

#[test]
fn latches_and_default_network() {
    let d = daemon();
    configure(&d.cache, 100, &["8.8.8.8"]);
    assert!(!d.client.is_ipv6_enabled(100));
    d.cache.enable_ipv6(100).unwrap();
    assert!(d.client.is_ipv6_enabled(100));
    d.cache.enable_ipv4(100).unwrap();
    assert!(d.client.is_ipv4_enabled(100));

    d.cache.set_default_network(100);
    assert_eq!(d.client.get_default_network(0).unwrap(), 100);
}

#[test]
fn missing_daemon_reads_as_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let client = NetsysClient::new(dir.path().join("absent"));
    assert!(!client.is_ipv6_enabled(100));
    let err = client.get_default_network(0).unwrap_err();
    assert_eq!(err.status(), -libc::ENOENT);
}

#[test]
fn dns_result_reaches_diagnostics() {
    let d = daemon();
    let param = QueryParam {
        query_type: 0,
        net_id: 100,
        mark: 0,
        flags: 0,
    };
    d.client
        .post_dns_result(100, "api.example.test", 42, 0, &[addr("192.0.2.5")], param)
        .unwrap();
    d.client
        .post_dns_result(100, "down.example.test", 900, -3, &[addr("192.0.2.6")], param)
        .unwrap();
    wait_until(|| d.diag.pending() == 2);

    let (events, dropped) = d.diag.drain(8);
    assert_eq!(dropped, 0);
    // Separate connections may be served in either order.
    let result_for = |host: &str| {
        events
            .iter()
            .find_map(|event| match &event.kind {
                QualityEventKind::Result(report) if report.hostname == host => Some(report.clone()),
                _ => None,
            })
            .unwrap()
    };
    let ok = result_for("api.example.test");
    assert_eq!((ok.uid, ok.pid, ok.net_id), (10_123, 4321, 100));
    assert_eq!(ok.used_time_ms, 42);
    assert_eq!(ok.addrs, vec![addr("192.0.2.5")]);
    let failed = result_for("down.example.test");
    assert_eq!(failed.query_ret, -3);
    assert!(failed.addrs.is_empty());
}

#[test]
fn bind_socket_reaches_binder() {
    let d = daemon();
    d.client.bind_socket(23, 105).unwrap();
    wait_until(|| !d.binder.calls.lock().unwrap().is_empty());
    assert_eq!(*d.binder.calls.lock().unwrap(), vec![(23, 105)]);
}

fn record(host: &str, addrs: Vec<AddrInfo>) -> QueryRecord {
    QueryRecord {
        process_info: DnsProcessInfo {
            hostname: host.to_string(),
            src_addr: "10.1.1.2".to_string(),
            ipv4_query_info: FamilyQueryInfo {
                server_addr: "8.8.8.8".to_string(),
                ..FamilyQueryInfo::default()
            },
            ..DnsProcessInfo::default()
        },
        addrs,
    }
}

#[test]
fn query_batch_and_abnormal_reach_diagnostics() {
    let d = daemon();
    let batch = vec![
        record("one.test", vec![addr("192.0.2.1"), addr("192.0.2.2")]),
        record("two.test", Vec::new()),
    ];
    d.client.post_dns_query_results(&batch).unwrap();
    d.client
        .post_dns_abnormal(FailCause::ReturnLoopbackAddr, &record("lo.test", vec![addr("127.0.0.1")]))
        .unwrap();
    wait_until(|| d.diag.pending() == 3);

    let (events, _) = d.diag.drain(8);
    let hosts: Vec<(String, usize)> = events
        .iter()
        .filter_map(|event| match &event.kind {
            QualityEventKind::QueryResult { query, addrs } => {
                Some((query.process_info.hostname.clone(), addrs.len()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(hosts, vec![("one.test".to_string(), 2), ("two.test".to_string(), 0)]);

    let abnormal = events
        .iter()
        .find_map(|event| match &event.kind {
            QualityEventKind::Abnormal {
                fail_cause,
                query,
                addrs,
            } => Some((*fail_cause, query.clone(), addrs.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(abnormal.0, FailCause::ReturnLoopbackAddr as u32);
    assert_eq!(abnormal.1.uid, 10_123);
    assert_eq!(abnormal.1.process_info.ipv4_query_info.server_addr, "8.8.8.8");
    assert_eq!(abnormal.2, vec![addr("127.0.0.1")]);
}

#[test]
fn fail_cause_priority() {
    let mut info = DnsProcessInfo {
        ret_code: -1,
        first_query_end_duration: 2000,
        ..DnsProcessInfo::default()
    };
    assert_eq!(FailCause::classify(&info, &[], |_| true), Some(FailCause::QueryFail));
    assert_eq!(
        FailCause::classify(&info, &[], |cause| cause != FailCause::QueryFail),
        Some(FailCause::FirstReturnSlow)
    );

    info = DnsProcessInfo::default();
    assert_eq!(FailCause::classify(&info, &[addr("192.0.2.1")], |_| true), None);
    assert_eq!(
        FailCause::classify(&info, &[addr("127.0.0.1")], |_| true),
        Some(FailCause::ReturnLoopbackAddr)
    );

    info.ipv4_query_info.is_no_answer = 1;
    info.ipv6_query_info.is_no_answer = 1;
    assert_eq!(FailCause::classify(&info, &[], |_| true), Some(FailCause::ReturnNoAnswer));
    info.is_from_cache = 1;
    assert_eq!(FailCause::classify(&info, &[], |_| true), None);
}

#[test]
fn gate_admits_each_cause_once_per_interval() {
    let gate = AbnormalReportGate::default();
    let info = DnsProcessInfo {
        ret_code: 2,
        first_query_end2app_duration: 800,
        ..DnsProcessInfo::default()
    };
    assert_eq!(gate.check(&info, &[]), Some(FailCause::QueryFail));
    assert_eq!(gate.check(&info, &[]), Some(FailCause::CallbackReturnSlow));
    assert_eq!(gate.check(&info, &[]), None);

    let eager = AbnormalReportGate::new(Duration::ZERO);
    assert_eq!(eager.check(&info, &[]), Some(FailCause::QueryFail));
    thread::sleep(Duration::from_millis(2));
    assert_eq!(eager.check(&info, &[]), Some(FailCause::QueryFail));
}
