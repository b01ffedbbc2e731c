use dnsresolv::ffi::{
    DnsdConfig, DnsdLogSink, DnsdQualityEvent, DNSD_EVENT_ABNORMAL, DNSD_EVENT_QUERY_RESULT,
};
use dnsresolv::wire::DNS_SOCKET_PATH;
use dnsresolv::{
    DnsdCreateCacheForNet, DnsdDrainReports, DnsdFreeService, DnsdNewService,
    DnsdServiceStart, DnsdSetBreadcrumbMask, DnsdSetDefaultNetwork, DnsdSetLogSink,
    DnsdSetResolverConfig,
};
use libc::{c_char, c_void};
use std::env;
use std::ffi::{CStr, CString};
use std::ptr;
use std::thread;
use std::time::Duration;

const REPORT_BATCH: usize = 32;
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    eprintln!(
        "[dnsd] starting (socket={}, idle={}ms)",
        settings.socket, settings.idle_timeout_ms
    );

    install_log_sink();
    DnsdSetBreadcrumbMask(u32::MAX);

    let config = DnsdConfig {
        idle_timeout_ms: settings.idle_timeout_ms,
        ..DnsdConfig::default()
    };
    let service = unsafe { DnsdNewService(&config) };
    if service.is_null() {
        anyhow::bail!("DnsdNewService returned null");
    }

    if let Err(error) = feed_network(service, &settings) {
        unsafe { DnsdFreeService(service) };
        return Err(error);
    }

    let socket = CString::new(settings.socket.as_str())?;
    let status = unsafe { DnsdServiceStart(service, socket.as_ptr()) };
    if status != 0 {
        unsafe { DnsdFreeService(service) };
        anyhow::bail!("DnsdServiceStart failed with status {status}");
    }

    println!("[dnsd] serving {}. Press Ctrl+C to terminate.", settings.socket);
    let mut events = [DnsdQualityEvent::default(); REPORT_BATCH];
    loop {
        thread::sleep(REPORT_INTERVAL);
        let mut dropped = 0u64;
        let count =
            unsafe { DnsdDrainReports(service, events.as_mut_ptr(), events.len(), &mut dropped) };
        for event in &events[..count] {
            print_report(event);
        }
        if dropped > 0 {
            println!("[dnsd][diag] {dropped} reports dropped");
        }
    }
}

fn feed_network(service: *mut dnsresolv::DnsResolvService, settings: &Settings) -> anyhow::Result<()> {
    let Some(net_id) = settings.net_id else {
        return Ok(());
    };
    let status = unsafe { DnsdCreateCacheForNet(service, net_id) };
    if status != 0 {
        anyhow::bail!("DnsdCreateCacheForNet({net_id}) failed with status {status}");
    }

    let servers = to_c_strings(&settings.servers)?;
    let domains = to_c_strings(&settings.domains)?;
    let server_ptrs: Vec<*const c_char> = servers.iter().map(|s| s.as_ptr()).collect();
    let domain_ptrs: Vec<*const c_char> = domains.iter().map(|s| s.as_ptr()).collect();
    let status = unsafe {
        DnsdSetResolverConfig(
            service,
            net_id,
            0,
            0,
            server_ptrs.as_ptr(),
            server_ptrs.len(),
            domain_ptrs.as_ptr(),
            domain_ptrs.len(),
        )
    };
    if status != 0 {
        anyhow::bail!("DnsdSetResolverConfig({net_id}) failed with status {status}");
    }
    unsafe { DnsdSetDefaultNetwork(service, net_id) };
    println!(
        "[dnsd] net {net_id} is default with {} servers",
        settings.servers.len()
    );
    Ok(())
}

fn to_c_strings(values: &[String]) -> anyhow::Result<Vec<CString>> {
    values
        .iter()
        .map(|value| CString::new(value.as_str()).map_err(anyhow::Error::from))
        .collect()
}

fn print_report(event: &DnsdQualityEvent) {
    let host = unsafe { CStr::from_ptr(event.hostname.as_ptr()) }.to_string_lossy();
    let kind = match event.kind {
        DNSD_EVENT_QUERY_RESULT => "query",
        DNSD_EVENT_ABNORMAL => "abnormal",
        _ => "result",
    };
    println!(
        "[dnsd][diag] {kind} net={} uid={} host={host} ret={} cause={} {}ms addrs={}",
        event.net_id,
        event.uid,
        event.ret_code,
        event.fail_cause,
        event.used_time_ms,
        event.addr_count
    );
}

#[derive(Debug)]
struct Settings {
    socket: String,
    idle_timeout_ms: u32,
    net_id: Option<u16>,
    servers: Vec<String>,
    domains: Vec<String>,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut settings = Self {
            socket: DNS_SOCKET_PATH.to_string(),
            idle_timeout_ms: DnsdConfig::default().idle_timeout_ms,
            net_id: None,
            servers: Vec::new(),
            domains: Vec::new(),
        };
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            let mut value = || {
                args.next()
                    .ok_or_else(|| anyhow::anyhow!("{arg} requires a value"))
            };
            match arg.as_str() {
                "--socket" => settings.socket = value()?,
                "--idle-timeout-ms" => {
                    settings.idle_timeout_ms = value()?
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid idle timeout"))?;
                }
                "--net" => {
                    settings.net_id = Some(
                        value()?
                            .parse()
                            .map_err(|_| anyhow::anyhow!("invalid net id"))?,
                    );
                }
                "--server" => settings.servers.push(value()?),
                "--domain" => settings.domains.push(value()?),
                _ => {
                    anyhow::bail!(
                        "unknown argument '{}'. Supported flags: --socket <path>, \
                         --idle-timeout-ms <ms>, --net <id>, --server <addr>, --domain <name>",
                        arg
                    );
                }
            }
        }
        if settings.net_id.is_none() && !settings.servers.is_empty() {
            anyhow::bail!("--server requires --net");
        }
        Ok(settings)
    }
}

fn install_log_sink() {
    unsafe extern "C" fn log_sink(
        level: *const c_char,
        message: *const c_char,
        _breadcrumbs: u32,
        _context: *mut c_void,
    ) {
        if message.is_null() {
            return;
        }
        let entry = unsafe { CStr::from_ptr(message) }.to_string_lossy();
        let level = if level.is_null() {
            "info".into()
        } else {
            unsafe { CStr::from_ptr(level) }.to_string_lossy()
        };
        println!("[dnsd][{level}] {entry}");
    }

    let sink = DnsdLogSink {
        log: Some(log_sink),
        context: ptr::null_mut(),
        enabled_breadcrumbs: u32::MAX,
    };
    let level = CString::new("debug").unwrap_or_default();
    unsafe {
        DnsdSetLogSink(&sink, level.as_ptr(), ptr::null_mut());
    }
}
