use crate::cache::DnsParamCache;
use crate::diag::{DnsQualityDiag, DnsResultReport, QualityReporter};
use crate::epoll::{Advance, StageHandler};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::platform::{
    DefaultNetworkSource, EnvProperties, FwmarkBinder, PropertySource, SoMarkBinder,
};
use crate::socket::poll_send;
use crate::wire::{
    c_str_lossy, server_fits, AbnormalEnvelope, AddrInfo, CommandType, DnsProcessInfo,
    PostDnsQueryParam, PostParam, RequestInfo, ResolvConfig, WireError, WireReader,
    ADDR_INFO_SIZE, DNS_PROCESS_INFO_SIZE, DNS_QUERY_ABNORMAL_SIZE, DNS_QUERY_HEADER_SIZE,
    MAX_DNS_CACHE_SIZE, MAX_HOST_NAME_LEN, MAX_QUERY_RESULT_PAYLOAD, MAX_RESULTS,
    MAX_SERVER_NUM, MAX_SERVER_NUM_EXT, POST_PARAM_SIZE, REQUEST_INFO_SIZE,
};
use std::os::fd::RawFd;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("{field} {value} exceeds {max}")]
    BoundsViolation {
        field: &'static str,
        value: usize,
        max: usize,
    },
    #[error("empty host key")]
    EmptyKey,
    #[error("cache set without answers")]
    EmptySet,
    #[error("{0:?} is not served")]
    Unsupported(CommandType),
}

impl ProtocolError {
    fn category(&self) -> ErrorCategory {
        match self {
            ProtocolError::BoundsViolation { .. } => ErrorCategory::BoundsViolation,
            _ => ErrorCategory::ProtocolError,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOp {
    Get,
    Set,
}

/// Identity a client sends ahead of its quality reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller {
    pub net_id: u32,
    pub uid: u32,
    pub pid: u32,
}

/// What the connection is waiting for next.
#[derive(Debug)]
pub enum Stage {
    Request,
    CacheKeyLen { op: CacheOp, net_id: u16 },
    CacheKey { op: CacheOp, net_id: u16 },
    CacheCount { net_id: u16, host: String },
    CacheEntries { net_id: u16, host: String, count: usize },
    ResultCaller { net_id: u32 },
    ResultKeyLen { caller: Caller },
    ResultKey { caller: Caller },
    ResultParam { caller: Caller, host: String },
    ResultAddrs { caller: Caller, host: String, param: PostParam },
    BindFd { net_id: u32 },
    QueryHeader { net_id: u32 },
    QueryPayload { caller: Caller, count: usize },
    Abnormal,
    AbnormalAddrs { fail_cause: u32, query: Box<PostDnsQueryParam> },
}

#[derive(Debug)]
pub enum Step {
    /// Read `needed` more bytes for the given stage.
    Next(Stage, usize),
    /// Send these bytes, then close.
    Reply(Vec<u8>),
    /// Close without replying.
    Done,
}

/// Request handling for the dnsproxyd socket, independent of any descriptor.
pub struct DnsResolvProtocol {
    cache: Arc<DnsParamCache>,
    reporter: Arc<dyn QualityReporter>,
    binder: Arc<dyn FwmarkBinder>,
    default_network: Arc<dyn DefaultNetworkSource>,
    properties: Arc<dyn PropertySource>,
}

impl DnsResolvProtocol {
    pub fn new(cache: Arc<DnsParamCache>) -> Self {
        Self {
            default_network: Arc::clone(&cache) as Arc<dyn DefaultNetworkSource>,
            cache,
            reporter: Arc::new(DnsQualityDiag::new()),
            binder: Arc::new(SoMarkBinder),
            properties: Arc::new(EnvProperties),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn QualityReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_binder(mut self, binder: Arc<dyn FwmarkBinder>) -> Self {
        self.binder = binder;
        self
    }

    pub fn with_default_network(mut self, source: Arc<dyn DefaultNetworkSource>) -> Self {
        self.default_network = source;
        self
    }

    pub fn with_properties(mut self, properties: Arc<dyn PropertySource>) -> Self {
        self.properties = properties;
        self
    }

    pub fn cache(&self) -> &Arc<DnsParamCache> {
        &self.cache
    }

    /// Consumes the bytes a stage asked for and decides what comes next.
    pub fn advance(&self, stage: Stage, data: &[u8]) -> Result<Step, ProtocolError> {
        match stage {
            Stage::Request => self.on_request(data),
            Stage::CacheKeyLen { op, net_id } => {
                let len = read_key_len(data)?;
                Ok(Step::Next(Stage::CacheKey { op, net_id }, len))
            }
            Stage::CacheKey { op, net_id } => {
                let host = read_key(data)?;
                match op {
                    CacheOp::Get => Ok(Step::Reply(self.cache_reply(net_id, &host))),
                    CacheOp::Set => Ok(Step::Next(Stage::CacheCount { net_id, host }, 4)),
                }
            }
            Stage::CacheCount { net_id, host } => {
                let count = (WireReader::new(data).u32()? as usize).min(MAX_RESULTS);
                if count == 0 {
                    return Err(ProtocolError::EmptySet);
                }
                Ok(Step::Next(
                    Stage::CacheEntries {
                        net_id,
                        host,
                        count,
                    },
                    count * ADDR_INFO_SIZE,
                ))
            }
            Stage::CacheEntries {
                net_id,
                host,
                count,
            } => {
                self.store_answers(net_id, &host, &decode_addrs(data, count)?);
                Ok(Step::Done)
            }
            Stage::ResultCaller { net_id } => {
                let mut reader = WireReader::new(data);
                let caller = Caller {
                    net_id,
                    uid: reader.u32()?,
                    pid: reader.u32()?,
                };
                Ok(Step::Next(Stage::ResultKeyLen { caller }, 4))
            }
            Stage::ResultKeyLen { caller } => {
                let len = read_key_len(data)?;
                Ok(Step::Next(Stage::ResultKey { caller }, len))
            }
            Stage::ResultKey { caller } => {
                let host = read_key(data)?;
                Ok(Step::Next(Stage::ResultParam { caller, host }, POST_PARAM_SIZE))
            }
            Stage::ResultParam { caller, host } => {
                let mut param = PostParam::decode(data)?;
                if param.query_ret != 0 || param.ai_size == 0 {
                    self.report_result(caller, host, param, Vec::new());
                    return Ok(Step::Done);
                }
                let count = (param.ai_size as usize).min(MAX_RESULTS);
                param.ai_size = count as u32;
                Ok(Step::Next(
                    Stage::ResultAddrs {
                        caller,
                        host,
                        param,
                    },
                    count * ADDR_INFO_SIZE,
                ))
            }
            Stage::ResultAddrs {
                caller,
                host,
                param,
            } => {
                let addrs = decode_addrs(data, param.ai_size as usize)?;
                self.report_result(caller, host, param, addrs);
                Ok(Step::Done)
            }
            Stage::BindFd { net_id } => {
                let remote_fd = WireReader::new(data).i32()?;
                if let Err(error) = self.binder.bind_socket(remote_fd, net_id) {
                    logger::rate_limited_error(
                        ErrorCategory::BindFailed,
                        format!("bind fd {remote_fd} to net {net_id} failed: {error}"),
                    );
                }
                Ok(Step::Done)
            }
            Stage::QueryHeader { net_id } => {
                let mut reader = WireReader::new(data);
                let caller = Caller {
                    net_id,
                    uid: reader.u32()?,
                    pid: reader.u32()?,
                };
                let count = (reader.u32()? as usize).min(MAX_DNS_CACHE_SIZE);
                let size = (reader.u32()? as usize).min(MAX_QUERY_RESULT_PAYLOAD);
                Ok(Step::Next(Stage::QueryPayload { caller, count }, size))
            }
            Stage::QueryPayload { caller, count } => {
                self.on_query_results(caller, count, data)?;
                Ok(Step::Done)
            }
            Stage::Abnormal => {
                let envelope = AbnormalEnvelope::decode(data)?;
                let count = (envelope.addr_size as usize).min(MAX_RESULTS);
                let query = PostDnsQueryParam {
                    net_id: 0,
                    uid: envelope.uid,
                    pid: envelope.pid,
                    addr_size: count as u8,
                    process_info: envelope.process_info,
                };
                if count == 0 {
                    self.reporter
                        .report_dns_query_abnormal(envelope.fail_cause, query, Vec::new());
                    return Ok(Step::Done);
                }
                Ok(Step::Next(
                    Stage::AbnormalAddrs {
                        fail_cause: envelope.fail_cause,
                        query: Box::new(query),
                    },
                    count * ADDR_INFO_SIZE,
                ))
            }
            Stage::AbnormalAddrs { fail_cause, query } => {
                let addrs = decode_addrs(data, query.addr_size as usize)?;
                self.reporter
                    .report_dns_query_abnormal(fail_cause, *query, addrs);
                Ok(Step::Done)
            }
        }
    }

    fn on_request(&self, data: &[u8]) -> Result<Step, ProtocolError> {
        let request = RequestInfo::decode(data)?;
        let command = request.command_type()?;
        let net_id = request.net_id;
        logger::breadcrumb(
            BreadcrumbFlags::LISTENER,
            format!("{command:?} uid={} net={net_id}", request.uid),
        );
        match command {
            CommandType::GetConfig => {
                Ok(Step::Reply(self.config_reply(net_id as u16, request.uid, MAX_SERVER_NUM)?))
            }
            CommandType::GetConfigExt => Ok(Step::Reply(self.config_reply(
                net_id as u16,
                request.uid,
                MAX_SERVER_NUM_EXT,
            )?)),
            CommandType::GetCache => Ok(Step::Next(
                Stage::CacheKeyLen {
                    op: CacheOp::Get,
                    net_id: net_id as u16,
                },
                4,
            )),
            CommandType::SetCache => Ok(Step::Next(
                Stage::CacheKeyLen {
                    op: CacheOp::Set,
                    net_id: net_id as u16,
                },
                4,
            )),
            CommandType::PostDnsResult => Ok(Step::Next(Stage::ResultCaller { net_id }, 8)),
            CommandType::JudgeIpv6 => {
                let enabled = self.cache.is_ipv6_enabled(net_id as u16);
                Ok(Step::Reply(i32::from(enabled).to_ne_bytes().to_vec()))
            }
            CommandType::JudgeIpv4 => {
                let net_id = net_id as u16;
                let enabled =
                    self.cache.is_ipv4_enabled(net_id) || self.cache.is_clat_ipv4_enabled(net_id);
                Ok(Step::Reply(i32::from(enabled).to_ne_bytes().to_vec()))
            }
            CommandType::GetDefaultNetwork => {
                let net_id = self.default_network.default_network();
                Ok(Step::Reply(net_id.to_ne_bytes().to_vec()))
            }
            CommandType::BindSocket => Ok(Step::Next(Stage::BindFd { net_id }, 4)),
            CommandType::PostDnsQueryResult => Ok(Step::Next(
                Stage::QueryHeader { net_id },
                DNS_QUERY_HEADER_SIZE,
            )),
            CommandType::PostDnsAbnormalResult => {
                Ok(Step::Next(Stage::Abnormal, DNS_QUERY_ABNORMAL_SIZE))
            }
            CommandType::SetConfigExt => Err(ProtocolError::Unsupported(command)),
        }
    }

    /// Builds the `ResolvConfig` reply. Lookup failures travel in `error`.
    pub fn resolv_config(&self, net_id: u16, uid: u32, slots: usize) -> ResolvConfig {
        let lookup = if self.cache.is_vpn_open() && net_id == 0 {
            self.cache.resolver_config_for_uid(net_id, uid)
        } else {
            self.cache.resolver_config(net_id)
        };
        let config = match lookup {
            Ok(config) => config,
            Err(error) => {
                logger::rate_limited_error(
                    ErrorCategory::CacheError,
                    format!("GET_CONFIG net {net_id}: {error}"),
                );
                return ResolvConfig::failure(error.status());
            }
        };

        let mut reply = ResolvConfig {
            error: 0,
            timeout_ms: i32::from(config.timeout_ms),
            retry_count: u32::from(config.retry_count),
            non_public_num: 0,
            nameservers: Vec::with_capacity(slots),
        };
        for server in config.servers.iter().take(slots - 1) {
            if server_fits(server) {
                reply.nameservers.push(server.clone());
            } else {
                // The slot stays empty but still counts, as clients index by position.
                logger::warn(format!("net {net_id} nameserver of {} bytes skipped", server.len()));
                reply.nameservers.push(String::new());
            }
        }
        reply.non_public_num = reply.nameservers.len() as u32;

        #[cfg(feature = "public-dns-server")]
        if !self.is_user_defined_server(net_id, uid) {
            self.add_public_dns_server(&mut reply, slots);
        }
        reply
    }

    fn config_reply(&self, net_id: u16, uid: u32, slots: usize) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.resolv_config(net_id, uid, slots).encode(slots)?)
    }

    #[cfg(feature = "public-dns-server")]
    fn is_user_defined_server(&self, net_id: u16, uid: u32) -> bool {
        let flag = if self.cache.is_vpn_open() && net_id == 0 {
            self.cache.user_defined_server_flag_for_uid(net_id, uid)
        } else {
            self.cache.user_defined_server_flag(net_id)
        };
        flag.unwrap_or(false)
    }

    #[cfg(feature = "public-dns-server")]
    fn add_public_dns_server(&self, reply: &mut ResolvConfig, slots: usize) {
        let Some(public) = self.properties.get(crate::platform::PUBLIC_DNS_PROPERTY) else {
            return;
        };
        if reply.nameservers.iter().any(|server| server == &public)
            || reply.nameservers.len() >= slots
            || !server_fits(&public)
        {
            return;
        }
        reply.nameservers.push(public);
    }

    fn cache_reply(&self, net_id: u16, host: &str) -> Vec<u8> {
        let answers = self.cache.dns_cache(net_id, host);
        let count = answers.len().min(MAX_RESULTS);
        let mut reply = Vec::with_capacity(4 + count * ADDR_INFO_SIZE);
        reply.extend_from_slice(&(count as u32).to_ne_bytes());
        for answer in answers.iter().take(count) {
            reply.extend_from_slice(answer.as_bytes());
        }
        reply
    }

    fn store_answers(&self, net_id: u16, host: &str, answers: &[AddrInfo]) {
        for answer in answers {
            if let Err(error) = self.cache.set_dns_cache(net_id, host, *answer) {
                logger::rate_limited_error(
                    ErrorCategory::CacheError,
                    format!("SET_CACHE net {net_id}: {error}"),
                );
                return;
            }
        }
        if let Err(error) = self.cache.set_cache_delayed(net_id, host) {
            logger::rate_limited_error(
                ErrorCategory::CacheError,
                format!("SET_CACHE expiry net {net_id}: {error}"),
            );
        }
    }

    fn report_result(&self, caller: Caller, hostname: String, param: PostParam, addrs: Vec<AddrInfo>) {
        self.reporter.report_dns_result(DnsResultReport {
            net_id: caller.net_id,
            uid: caller.uid,
            pid: caller.pid,
            used_time_ms: param.used_time_ms,
            hostname,
            query_ret: param.query_ret,
            param: param.param,
            addrs,
        });
    }

    /// Payload layout per record: `addrSize:u8`, a process-info block, then
    /// `addrSize` answers of which at most `MAX_RESULTS` are kept.
    fn on_query_results(&self, caller: Caller, count: usize, data: &[u8]) -> Result<(), ProtocolError> {
        let mut reader = WireReader::new(data);
        for _ in 0..count {
            let declared = reader.u8()? as usize;
            let process_info = DnsProcessInfo::decode(reader.take(DNS_PROCESS_INFO_SIZE)?)?;
            let answers = reader.take(declared * ADDR_INFO_SIZE)?;
            let kept = declared.min(MAX_RESULTS);
            let addrs = decode_addrs(answers, kept)?;
            let query = PostDnsQueryParam {
                net_id: caller.net_id,
                uid: caller.uid,
                pid: caller.pid,
                addr_size: kept as u8,
                process_info,
            };
            self.reporter.report_dns_query_result(query, addrs);
        }
        Ok(())
    }
}

fn read_key_len(data: &[u8]) -> Result<usize, ProtocolError> {
    let len = WireReader::new(data).u32()? as usize;
    if len > MAX_HOST_NAME_LEN {
        return Err(ProtocolError::BoundsViolation {
            field: "nameLen",
            value: len,
            max: MAX_HOST_NAME_LEN,
        });
    }
    Ok(len)
}

fn read_key(data: &[u8]) -> Result<String, ProtocolError> {
    let key = c_str_lossy(data);
    if key.is_empty() {
        return Err(ProtocolError::EmptyKey);
    }
    Ok(key)
}

fn decode_addrs(data: &[u8], count: usize) -> Result<Vec<AddrInfo>, WireError> {
    let mut reader = WireReader::new(data);
    (0..count)
        .map(|_| AddrInfo::from_bytes(reader.take(ADDR_INFO_SIZE)?))
        .collect()
}

impl StageHandler for DnsResolvProtocol {
    type Stage = Stage;

    fn first_stage(&self) -> (Stage, usize) {
        (Stage::Request, REQUEST_INFO_SIZE)
    }

    fn on_data(&self, fd: RawFd, stage: Stage, data: Vec<u8>) -> Advance<Stage> {
        match self.advance(stage, &data) {
            Ok(Step::Next(stage, needed)) => Advance::Next(stage, needed),
            Ok(Step::Reply(reply)) => {
                if let Err(error) = poll_send(fd, &reply) {
                    logger::rate_limited_error(
                        ErrorCategory::ReplyFailed,
                        format!("reply of {} bytes to fd {fd} failed: {error}", reply.len()),
                    );
                }
                Advance::Done
            }
            Ok(Step::Done) => Advance::Done,
            Err(error) => {
                logger::rate_limited_error(error.category(), format!("fd {fd}: {error}"));
                Advance::Fail
            }
        }
    }
}
