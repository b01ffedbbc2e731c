//! Caller side of the dnsproxyd socket. Every call opens a fresh connection,
//! performs one exchange with the polling helpers and closes it.

use crate::logger::{self, BreadcrumbFlags};
use crate::socket::{connect_non_block, poll_recv, poll_send};
use crate::wire::{
    AddrInfo, CommandType, DnsProcessInfo, PostParam, QueryParam, RequestInfo, ResolvConfig,
    WireError, WireWriter, ADDR_INFO_SIZE, DNS_PROCESS_INFO_SIZE, DNS_SOCKET_PATH,
    MAX_DNS_CACHE_SIZE, MAX_HOST_NAME_LEN, MAX_RESULTS, MAX_SERVER_NUM, MAX_SERVER_NUM_EXT,
    RESOLV_CONFIG_EXT_SIZE, RESOLV_CONFIG_SIZE,
};
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const FIRST_RETURN_SLOW_THRESHOLD_MS: u32 = 500;
pub const QUERY_CALLBACK_RETURN_SLOW_THRESHOLD_MS: u32 = 1500;
pub const FAIL_CAUSE_REPORT_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("daemon returned status {0}")]
    Status(i32),
    #[error("no nameserver configured")]
    NoServers,
}

impl ClientError {
    /// Negative status in the convention resolver callers expect.
    pub fn status(&self) -> i32 {
        match self {
            ClientError::InvalidArgument(_) => -libc::EINVAL,
            ClientError::Io(error) => -error.raw_os_error().unwrap_or(libc::EIO),
            ClientError::Wire(_) => -libc::EPROTO,
            ClientError::Status(status) => *status,
            ClientError::NoServers => -1,
        }
    }
}

/// The subset of `addrinfo` hints that distinguishes cache entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddrHints {
    pub family: i32,
    pub flags: i32,
    pub protocol: i32,
    pub socket_type: i32,
}

/// Cache key for a lookup: host, then service and hints when present.
pub fn cache_key(host: &str, service: Option<&str>, hints: Option<&AddrHints>) -> String {
    match (service, hints) {
        (Some(service), Some(h)) => format!(
            "{host} {service} {} {} {} {}",
            h.family, h.flags, h.protocol, h.socket_type
        ),
        (None, Some(h)) => format!(
            "{host} {} {} {} {}",
            h.family, h.flags, h.protocol, h.socket_type
        ),
        (Some(service), None) => format!("{host} {service}"),
        (None, None) => host.to_string(),
    }
}

/// One resolved query as reported in `POST_DNS_QUERY_RESULT` and
/// `POST_DNS_ABNORMAL_RESULT`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryRecord {
    pub process_info: DnsProcessInfo,
    pub addrs: Vec<AddrInfo>,
}

impl QueryRecord {
    fn kept(&self) -> &[AddrInfo] {
        &self.addrs[..self.addrs.len().min(MAX_RESULTS)]
    }

    fn wire_len(&self) -> usize {
        1 + DNS_PROCESS_INFO_SIZE + self.kept().len() * ADDR_INFO_SIZE
    }

    fn write(&self, writer: &mut WireWriter) -> Result<(), WireError> {
        let addrs = self.kept();
        writer.put_u8(addrs.len() as u8);
        writer.put_bytes(&self.process_info.encode()?);
        for addr in addrs {
            writer.put_bytes(addr.as_bytes());
        }
        Ok(())
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailCause {
    QueryFail = 1,
    FirstReturnSlow = 2,
    CallbackReturnSlow = 3,
    UseBackupDnsServer = 4,
    ReturnLoopbackAddr = 5,
    ReturnCname = 6,
    ReturnNoAnswer = 7,
    InterfaceNotDefault = 8,
}

const FAIL_CAUSE_COUNT: usize = 8;

impl FailCause {
    /// First cause, in priority order, that `info` and `addrs` exhibit and
    /// `allowed` admits.
    pub fn classify(
        info: &DnsProcessInfo,
        addrs: &[AddrInfo],
        mut allowed: impl FnMut(FailCause) -> bool,
    ) -> Option<FailCause> {
        let candidates = [
            (info.ret_code != 0, FailCause::QueryFail),
            (
                info.first_query_end_duration > QUERY_CALLBACK_RETURN_SLOW_THRESHOLD_MS,
                FailCause::FirstReturnSlow,
            ),
            (
                info.first_query_end2app_duration > FIRST_RETURN_SLOW_THRESHOLD_MS,
                FailCause::CallbackReturnSlow,
            ),
            (first_is_loopback(addrs), FailCause::ReturnLoopbackAddr),
            (all_cname(info), FailCause::ReturnCname),
            (all_no_answer(info), FailCause::ReturnNoAnswer),
        ];
        candidates
            .into_iter()
            .find(|(hit, cause)| *hit && allowed(*cause))
            .map(|(_, cause)| cause)
    }

    fn index(self) -> usize {
        self as usize - 1
    }
}

fn first_is_loopback(addrs: &[AddrInfo]) -> bool {
    matches!(
        addrs.first().and_then(AddrInfo::ip),
        Some(IpAddr::V4(ip)) if ip == Ipv4Addr::LOCALHOST || ip == Ipv4Addr::UNSPECIFIED
    )
}

fn all_cname(info: &DnsProcessInfo) -> bool {
    info.is_from_cache == 0 && info.ipv4_query_info.cname != 0 && info.ipv6_query_info.cname != 0
}

fn all_no_answer(info: &DnsProcessInfo) -> bool {
    info.is_from_cache == 0
        && info.ret_code == 0
        && info.ipv4_query_info.is_no_answer != 0
        && info.ipv6_query_info.is_no_answer != 0
}

/// Admits each fail cause at most once per interval.
pub struct AbnormalReportGate {
    interval: Duration,
    last: Mutex<[Option<Instant>; FAIL_CAUSE_COUNT]>,
}

impl Default for AbnormalReportGate {
    fn default() -> Self {
        Self::new(FAIL_CAUSE_REPORT_INTERVAL)
    }
}

impl AbnormalReportGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new([None; FAIL_CAUSE_COUNT]),
        }
    }

    /// Classifies the query and, when a cause is admitted, marks it reported.
    pub fn check(&self, info: &DnsProcessInfo, addrs: &[AddrInfo]) -> Option<FailCause> {
        let now = Instant::now();
        let mut last = self.last.lock();
        let cause = FailCause::classify(info, addrs, |cause| {
            last[cause.index()].map_or(true, |at| now.duration_since(at) > self.interval)
        })?;
        last[cause.index()] = Some(now);
        Some(cause)
    }
}

#[derive(Clone, Debug)]
pub struct NetsysClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
    uid: u32,
    pid: u32,
}

impl Default for NetsysClient {
    fn default() -> Self {
        Self::new(DNS_SOCKET_PATH)
    }
}

impl NetsysClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            uid: unsafe { libc::getuid() },
            pid: std::process::id(),
        }
    }

    /// Reports as `uid`/`pid` instead of the calling process.
    pub fn with_identity(mut self, uid: u32, pid: u32) -> Self {
        self.uid = uid;
        self.pid = pid;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn get_resolv_conf(&self, net_id: u16) -> Result<ResolvConfig, ClientError> {
        self.fetch_config(net_id, CommandType::GetConfig, MAX_SERVER_NUM, RESOLV_CONFIG_SIZE)
    }

    pub fn get_resolv_conf_ext(&self, net_id: u16) -> Result<ResolvConfig, ClientError> {
        self.fetch_config(
            net_id,
            CommandType::GetConfigExt,
            MAX_SERVER_NUM_EXT,
            RESOLV_CONFIG_EXT_SIZE,
        )
    }

    fn fetch_config(
        &self,
        net_id: u16,
        command: CommandType,
        slots: usize,
        size: usize,
    ) -> Result<ResolvConfig, ClientError> {
        let stream = self.open(command, u32::from(net_id))?;
        let mut reply = vec![0u8; size];
        poll_recv(stream.as_raw_fd(), &mut reply)?;
        let config = ResolvConfig::decode(&reply, slots)?;
        if config.error < 0 {
            return Err(ClientError::Status(config.error));
        }
        if config.nameservers.is_empty() {
            return Err(ClientError::NoServers);
        }
        Ok(config)
    }

    /// Cached answers for `key`. Unspecified IPv4 answers are dropped.
    pub fn get_resolv_cache(&self, net_id: u16, key: &str) -> Result<Vec<AddrInfo>, ClientError> {
        check_key(key)?;
        let stream = self.open(CommandType::GetCache, u32::from(net_id))?;
        send_key(&stream, key)?;

        let mut count = [0u8; 4];
        poll_recv(stream.as_raw_fd(), &mut count)?;
        let count = (u32::from_ne_bytes(count) as usize).min(MAX_RESULTS);
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut raw = vec![0u8; count * ADDR_INFO_SIZE];
        poll_recv(stream.as_raw_fd(), &mut raw)?;

        let mut answers = Vec::with_capacity(count);
        for chunk in raw.chunks_exact(ADDR_INFO_SIZE) {
            let answer = AddrInfo::from_bytes(chunk)?;
            match answer.ip() {
                Some(IpAddr::V4(ip)) if ip.is_unspecified() => {
                    logger::warn(format!("net {net_id} cache holds 0.0.0.0, dropped"));
                    continue;
                }
                Some(IpAddr::V4(ip)) if ip.is_loopback() => {
                    logger::warn(format!("net {net_id} cache holds a loopback answer"));
                }
                _ => {}
            }
            answers.push(answer);
        }
        Ok(answers)
    }

    /// Stores up to `MAX_RESULTS` answers under `key`.
    pub fn set_resolv_cache(
        &self,
        net_id: u16,
        key: &str,
        answers: &[AddrInfo],
    ) -> Result<(), ClientError> {
        check_key(key)?;
        let stream = self.open(CommandType::SetCache, u32::from(net_id))?;
        send_key(&stream, key)?;

        let answers = &answers[..answers.len().min(MAX_RESULTS)];
        let mut writer = WireWriter::with_capacity(4 + answers.len() * ADDR_INFO_SIZE);
        writer.put_u32(answers.len() as u32);
        for answer in answers {
            writer.put_bytes(answer.as_bytes());
        }
        poll_send(stream.as_raw_fd(), &writer.into_inner())?;
        Ok(())
    }

    /// Any failure reads as disabled.
    pub fn is_ipv6_enabled(&self, net_id: u16) -> bool {
        self.judge(CommandType::JudgeIpv6, net_id)
    }

    pub fn is_ipv4_enabled(&self, net_id: u16) -> bool {
        self.judge(CommandType::JudgeIpv4, net_id)
    }

    fn judge(&self, command: CommandType, net_id: u16) -> bool {
        match self.read_i32(command, net_id) {
            Ok(enabled) => enabled != 0,
            Err(error) => {
                logger::breadcrumb(BreadcrumbFlags::CLIENT, format!("{command:?} failed: {error}"));
                false
            }
        }
    }

    pub fn get_default_network(&self, net_id: u16) -> Result<i32, ClientError> {
        self.read_i32(CommandType::GetDefaultNetwork, net_id)
    }

    fn read_i32(&self, command: CommandType, net_id: u16) -> Result<i32, ClientError> {
        let stream = self.open(command, u32::from(net_id))?;
        let mut value = [0u8; 4];
        poll_recv(stream.as_raw_fd(), &mut value)?;
        Ok(i32::from_ne_bytes(value))
    }

    /// Reports one lookup. Answers are sent only for successful lookups.
    pub fn post_dns_result(
        &self,
        net_id: u16,
        host: &str,
        used_time_ms: u32,
        query_ret: i32,
        answers: &[AddrInfo],
        param: QueryParam,
    ) -> Result<(), ClientError> {
        check_key(host)?;
        let answers: &[AddrInfo] = if query_ret == 0 {
            &answers[..answers.len().min(MAX_RESULTS)]
        } else {
            &[]
        };
        let post = PostParam {
            used_time_ms,
            query_ret,
            ai_size: answers.len() as u32,
            param,
        };

        let stream = self.open(CommandType::PostDnsResult, u32::from(net_id))?;
        let mut writer = WireWriter::with_capacity(512 + answers.len() * ADDR_INFO_SIZE);
        writer.put_u32(self.uid);
        writer.put_u32(self.pid);
        put_key(&mut writer, host);
        writer.put_bytes(&post.encode());
        for answer in answers {
            writer.put_bytes(answer.as_bytes());
        }
        poll_send(stream.as_raw_fd(), &writer.into_inner())?;
        Ok(())
    }

    /// Asks the daemon to mark `fd` for `net_id`. The descriptor travels as a
    /// plain integer, so it must be meaningful in the daemon's process.
    pub fn bind_socket(&self, fd: RawFd, net_id: u32) -> Result<(), ClientError> {
        let stream = self.open(CommandType::BindSocket, net_id)?;
        poll_send(stream.as_raw_fd(), &fd.to_ne_bytes())?;
        Ok(())
    }

    /// Flushes a batch of query records; at most `MAX_DNS_CACHE_SIZE` are sent.
    pub fn post_dns_query_results(&self, records: &[QueryRecord]) -> Result<(), ClientError> {
        let records = &records[..records.len().min(MAX_DNS_CACHE_SIZE)];
        let payload: usize = records.iter().map(QueryRecord::wire_len).sum();

        let stream = self.open(CommandType::PostDnsQueryResult, 0)?;
        let mut writer = WireWriter::with_capacity(16 + payload);
        writer.put_u32(self.uid);
        writer.put_u32(self.pid);
        writer.put_u32(records.len() as u32);
        writer.put_u32(payload as u32);
        for record in records {
            record.write(&mut writer)?;
        }
        poll_send(stream.as_raw_fd(), &writer.into_inner())?;
        Ok(())
    }

    pub fn post_dns_abnormal(
        &self,
        fail_cause: FailCause,
        record: &QueryRecord,
    ) -> Result<(), ClientError> {
        let stream = self.open(CommandType::PostDnsAbnormalResult, 0)?;
        let mut writer = WireWriter::with_capacity(12 + record.wire_len());
        writer.put_u32(self.uid);
        writer.put_u32(self.pid);
        writer.put_u32(fail_cause as u32);
        record.write(&mut writer)?;
        poll_send(stream.as_raw_fd(), &writer.into_inner())?;
        Ok(())
    }

    fn open(&self, command: CommandType, net_id: u32) -> Result<UnixStream, ClientError> {
        let stream = connect_non_block(&self.socket_path, self.connect_timeout).map_err(|error| {
            logger::breadcrumb(
                BreadcrumbFlags::CLIENT,
                format!("connect {} failed: {error}", self.socket_path.display()),
            );
            error
        })?;
        let request = RequestInfo::new(self.uid, command, net_id);
        poll_send(stream.as_raw_fd(), &request.encode())?;
        Ok(stream)
    }
}

fn check_key(key: &str) -> Result<(), ClientError> {
    if key.is_empty() {
        return Err(ClientError::InvalidArgument("empty host"));
    }
    // The terminating NUL travels too.
    if key.len() + 1 > MAX_HOST_NAME_LEN {
        return Err(ClientError::InvalidArgument("host too long"));
    }
    Ok(())
}

fn put_key(writer: &mut WireWriter, key: &str) {
    writer.put_u32(key.len() as u32 + 1);
    writer.put_bytes(key.as_bytes());
    writer.put_u8(0);
}

fn send_key(stream: &UnixStream, key: &str) -> Result<(), ClientError> {
    let mut writer = WireWriter::with_capacity(4 + key.len() + 1);
    put_key(&mut writer, key);
    poll_send(stream.as_raw_fd(), &writer.into_inner())?;
    Ok(())
}

#[cfg(test)]
mod tests;
