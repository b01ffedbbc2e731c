//! Fixed byte layouts exchanged with resolver clients over the dnsproxyd socket.
//!
//! Every frame mirrors an LP64 Linux C struct in native byte order, padding
//! included, so a client that writes the struct verbatim and this daemon agree
//! on offsets without any negotiation.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use thiserror::Error;

pub const DNS_SOCKET_PATH: &str = "/dev/unix/socket/dnsproxyd";

pub const MAX_SERVER_NUM: usize = 5;
pub const MAX_SERVER_NUM_EXT: usize = 8;
pub const MAX_SERVER_LENGTH: usize = 50;
pub const MAX_RESULTS: usize = 32;
pub const MAX_CANON_NAME: usize = 256;
pub const MAX_HOST_NAME_LEN: usize = 256;
pub const MAX_DNS_CACHE_SIZE: usize = 50;
pub const DEFAULT_TIMEOUT: i32 = 5000;
pub const DEFAULT_RETRY: u32 = 2;
pub const DNS_QUERY_PRE_NUM: usize = 4;

pub const REQUEST_INFO_SIZE: usize = 12;
pub const SOCKADDR_SIZE: usize = 28;
pub const ADDR_INFO_SIZE: usize = 308;
pub const QUERY_PARAM_SIZE: usize = 24;
pub const FAMILY_QUERY_INFO_SIZE: usize = 60;
pub const DNS_PROCESS_INFO_SIZE: usize = 456;
pub const POST_PARAM_SIZE: usize = 12 + QUERY_PARAM_SIZE;
pub const DNS_QUERY_HEADER_SIZE: usize = 16;
pub const DNS_QUERY_ABNORMAL_SIZE: usize = 4 + 4 + DNS_PROCESS_INFO_SIZE + 4 + 1;
pub const RESOLV_CONFIG_SIZE: usize = resolv_config_size(MAX_SERVER_NUM);
pub const RESOLV_CONFIG_EXT_SIZE: usize = resolv_config_size(MAX_SERVER_NUM_EXT);

/// Largest `POST_DNS_QUERY_RESULT` payload accepted: every cached query with a
/// full answer set.
pub const MAX_QUERY_RESULT_PAYLOAD: usize =
    MAX_DNS_CACHE_SIZE * (1 + DNS_PROCESS_INFO_SIZE + MAX_RESULTS * ADDR_INFO_SIZE);

const SERVER_SLOT: usize = MAX_SERVER_LENGTH + 1;
const RESOLV_CONFIG_HEADER: usize = 16;

pub const fn resolv_config_size(slots: usize) -> usize {
    (RESOLV_CONFIG_HEADER + slots * SERVER_SLOT + 3) & !3
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unknown command {0}")]
    UnknownCommand(u32),
    #[error("{field} is {len} bytes, limit {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandType {
    GetConfig = 1,
    GetCache = 2,
    SetCache = 3,
    JudgeIpv6 = 4,
    PostDnsResult = 5,
    GetDefaultNetwork = 6,
    BindSocket = 7,
    PostDnsQueryResult = 8,
    PostDnsAbnormalResult = 9,
    GetConfigExt = 10,
    JudgeIpv4 = 11,
    SetConfigExt = 12,
}

impl TryFrom<u32> for CommandType {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::GetConfig,
            2 => Self::GetCache,
            3 => Self::SetCache,
            4 => Self::JudgeIpv6,
            5 => Self::PostDnsResult,
            6 => Self::GetDefaultNetwork,
            7 => Self::BindSocket,
            8 => Self::PostDnsQueryResult,
            9 => Self::PostDnsAbnormalResult,
            10 => Self::GetConfigExt,
            11 => Self::JudgeIpv4,
            12 => Self::SetConfigExt,
            other => return Err(WireError::UnknownCommand(other)),
        })
    }
}

/// Cursor over a received frame. Reads fail instead of running past the end.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), WireError> {
        self.take(len).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        self.array().map(u16::from_ne_bytes)
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        self.array().map(u32::from_ne_bytes)
    }

    pub fn i32(&mut self) -> Result<i32, WireError> {
        self.array().map(i32::from_ne_bytes)
    }

    pub fn i64(&mut self) -> Result<i64, WireError> {
        self.array().map(i64::from_ne_bytes)
    }

    /// Reads a NUL-padded character array of exactly `width` bytes.
    pub fn c_string(&mut self, width: usize) -> Result<String, WireError> {
        self.take(width).map(c_str_lossy)
    }
}

#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_zeros(&mut self, len: usize) {
        self.buf.resize(self.buf.len() + len, 0);
    }

    /// Writes `value` into a `width`-byte character array, always leaving room
    /// for the terminating NUL.
    pub fn put_c_string(
        &mut self,
        field: &'static str,
        value: &str,
        width: usize,
    ) -> Result<(), WireError> {
        let bytes = value.as_bytes();
        if bytes.len() >= width {
            return Err(WireError::FieldTooLong {
                field,
                len: bytes.len(),
                max: width.saturating_sub(1),
            });
        }
        self.buf.extend_from_slice(bytes);
        self.put_zeros(width - bytes.len());
        Ok(())
    }

    pub fn pad_to(&mut self, len: usize) {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Decodes bytes up to the first NUL, replacing invalid UTF-8.
pub fn c_str_lossy(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestInfo {
    pub uid: u32,
    pub command: u32,
    pub net_id: u32,
}

impl RequestInfo {
    pub fn new(uid: u32, command: CommandType, net_id: u32) -> Self {
        Self {
            uid,
            command: command as u32,
            net_id,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        Ok(Self {
            uid: reader.u32()?,
            command: reader.u32()?,
            net_id: reader.u32()?,
        })
    }

    pub fn encode(&self) -> [u8; REQUEST_INFO_SIZE] {
        let mut out = [0u8; REQUEST_INFO_SIZE];
        out[0..4].copy_from_slice(&self.uid.to_ne_bytes());
        out[4..8].copy_from_slice(&self.command.to_ne_bytes());
        out[8..12].copy_from_slice(&self.net_id.to_ne_bytes());
        out
    }

    pub fn command_type(&self) -> Result<CommandType, WireError> {
        CommandType::try_from(self.command)
    }
}

const AI_FLAGS: usize = 0;
const AI_FAMILY: usize = 4;
const AI_SOCKTYPE: usize = 8;
const AI_PROTOCOL: usize = 12;
const AI_ADDRLEN: usize = 16;
const AI_ADDR: usize = 20;
const AI_CANON: usize = AI_ADDR + SOCKADDR_SIZE;

const SOCKADDR_IN_SIZE: u32 = 16;
const SOCKADDR_IN6_SIZE: u32 = 28;

/// One resolved address in the client's `AddrInfo` layout.
///
/// Kept as the raw 308-byte image so that a cache round trip hands back
/// exactly what the client stored, padding included.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AddrInfo {
    raw: [u8; ADDR_INFO_SIZE],
}

impl Default for AddrInfo {
    fn default() -> Self {
        Self {
            raw: [0; ADDR_INFO_SIZE],
        }
    }
}

impl fmt::Debug for AddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddrInfo")
            .field("family", &self.family())
            .field("addr", &self.socket_addr())
            .field("canon_name", &self.canon_name())
            .finish()
    }
}

impl AddrInfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        let mut raw = [0u8; ADDR_INFO_SIZE];
        raw.copy_from_slice(reader.take(ADDR_INFO_SIZE)?);
        Ok(Self { raw })
    }

    pub fn as_bytes(&self) -> &[u8; ADDR_INFO_SIZE] {
        &self.raw
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let mut info = Self::default();
        let sockaddr = &mut info.raw[AI_ADDR..AI_CANON];
        match addr {
            SocketAddr::V4(v4) => {
                sockaddr[0..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
                sockaddr[2..4].copy_from_slice(&v4.port().to_be_bytes());
                sockaddr[4..8].copy_from_slice(&v4.ip().octets());
                info.set_field(AI_FAMILY, libc::AF_INET as u32);
                info.set_field(AI_ADDRLEN, SOCKADDR_IN_SIZE);
            }
            SocketAddr::V6(v6) => {
                sockaddr[0..2].copy_from_slice(&(libc::AF_INET6 as u16).to_ne_bytes());
                sockaddr[2..4].copy_from_slice(&v6.port().to_be_bytes());
                sockaddr[4..8].copy_from_slice(&v6.flowinfo().to_be_bytes());
                sockaddr[8..24].copy_from_slice(&v6.ip().octets());
                sockaddr[24..28].copy_from_slice(&v6.scope_id().to_ne_bytes());
                info.set_field(AI_FAMILY, libc::AF_INET6 as u32);
                info.set_field(AI_ADDRLEN, SOCKADDR_IN6_SIZE);
            }
        }
        info
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        Self::from_socket_addr(SocketAddr::new(ip, 0))
    }

    pub fn with_socket_type(mut self, socket_type: u32, protocol: u32) -> Self {
        self.set_field(AI_SOCKTYPE, socket_type);
        self.set_field(AI_PROTOCOL, protocol);
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.set_field(AI_FLAGS, flags);
        self
    }

    pub fn with_canon_name(mut self, name: &str) -> Result<Self, WireError> {
        let bytes = name.as_bytes();
        if bytes.len() > MAX_CANON_NAME {
            return Err(WireError::FieldTooLong {
                field: "aiCanonName",
                len: bytes.len(),
                max: MAX_CANON_NAME,
            });
        }
        let canon = &mut self.raw[AI_CANON..AI_CANON + MAX_CANON_NAME + 1];
        canon.fill(0);
        canon[..bytes.len()].copy_from_slice(bytes);
        Ok(self)
    }

    fn field(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.raw[offset..offset + 4]);
        u32::from_ne_bytes(bytes)
    }

    fn set_field(&mut self, offset: usize, value: u32) {
        self.raw[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn flags(&self) -> u32 {
        self.field(AI_FLAGS)
    }

    pub fn family(&self) -> u32 {
        self.field(AI_FAMILY)
    }

    pub fn socket_type(&self) -> u32 {
        self.field(AI_SOCKTYPE)
    }

    pub fn protocol(&self) -> u32 {
        self.field(AI_PROTOCOL)
    }

    pub fn addr_len(&self) -> u32 {
        self.field(AI_ADDRLEN)
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let sockaddr = &self.raw[AI_ADDR..AI_CANON];
        let port = u16::from_be_bytes([sockaddr[2], sockaddr[3]]);
        match self.family() as i32 {
            libc::AF_INET => {
                let ip = Ipv4Addr::new(sockaddr[4], sockaddr[5], sockaddr[6], sockaddr[7]);
                Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            libc::AF_INET6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&sockaddr[8..24]);
                let flowinfo =
                    u32::from_be_bytes([sockaddr[4], sockaddr[5], sockaddr[6], sockaddr[7]]);
                let scope_id =
                    u32::from_ne_bytes([sockaddr[24], sockaddr[25], sockaddr[26], sockaddr[27]]);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope_id,
                )))
            }
            _ => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.socket_addr().map(|addr| addr.ip())
    }

    pub fn canon_name(&self) -> String {
        c_str_lossy(&self.raw[AI_CANON..AI_CANON + MAX_CANON_NAME + 1])
    }
}

/// `QueryParam` without its hook pointer, which has no meaning in this process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryParam {
    pub query_type: i32,
    pub net_id: i32,
    pub mark: i32,
    pub flags: i32,
}

impl QueryParam {
    fn read(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let param = Self {
            query_type: reader.i32()?,
            net_id: reader.i32()?,
            mark: reader.i32()?,
            flags: reader.i32()?,
        };
        reader.skip(QUERY_PARAM_SIZE - 16)?;
        Ok(param)
    }

    fn write(&self, writer: &mut WireWriter) {
        writer.put_i32(self.query_type);
        writer.put_i32(self.net_id);
        writer.put_i32(self.mark);
        writer.put_i32(self.flags);
        writer.put_zeros(QUERY_PARAM_SIZE - 16);
    }
}

/// Fixed block sent ahead of the answers in `POST_DNS_RESULT`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PostParam {
    pub used_time_ms: u32,
    pub query_ret: i32,
    pub ai_size: u32,
    pub param: QueryParam,
}

impl PostParam {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        Ok(Self {
            used_time_ms: reader.u32()?,
            query_ret: reader.i32()?,
            ai_size: reader.u32()?,
            param: QueryParam::read(&mut reader)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::with_capacity(POST_PARAM_SIZE);
        writer.put_u32(self.used_time_ms);
        writer.put_i32(self.query_ret);
        writer.put_u32(self.ai_size);
        self.param.write(&mut writer);
        writer.into_inner()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FamilyQueryInfo {
    pub ret_code: i32,
    pub server_addr: String,
    pub is_no_answer: u8,
    pub cname: u8,
}

impl FamilyQueryInfo {
    fn read(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let info = Self {
            ret_code: reader.i32()?,
            server_addr: reader.c_string(SERVER_SLOT)?,
            is_no_answer: reader.u8()?,
            cname: reader.u8()?,
        };
        reader.skip(FAMILY_QUERY_INFO_SIZE - (4 + SERVER_SLOT + 2))?;
        Ok(info)
    }

    fn write(&self, writer: &mut WireWriter) -> Result<(), WireError> {
        writer.put_i32(self.ret_code);
        writer.put_c_string("serverAddr", &self.server_addr, SERVER_SLOT)?;
        writer.put_u8(self.is_no_answer);
        writer.put_u8(self.cname);
        writer.put_zeros(FAMILY_QUERY_INFO_SIZE - (4 + SERVER_SLOT + 2));
        Ok(())
    }
}

/// Per-query statistics a client reports after resolving a host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsProcessInfo {
    pub query_time: i64,
    pub hostname: String,
    pub src_addr: String,
    pub ret_code: i32,
    pub first_query_end_duration: u32,
    pub first_query_end2app_duration: u32,
    pub first_return_type: u16,
    pub is_from_cache: u8,
    pub source_from: u8,
    pub ipv4_query_info: FamilyQueryInfo,
    pub ipv6_query_info: FamilyQueryInfo,
}

const PROCESS_INFO_HOST_WIDTH: usize = MAX_HOST_NAME_LEN + 1;

impl DnsProcessInfo {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        let query_time = reader.i64()?;
        let hostname = reader.c_string(PROCESS_INFO_HOST_WIDTH)?;
        let src_addr = reader.c_string(SERVER_SLOT)?;
        // retCode is 4-byte aligned after the two character arrays.
        reader.skip(align4(reader.position()) - reader.position())?;
        let info = Self {
            query_time,
            hostname,
            src_addr,
            ret_code: reader.i32()?,
            first_query_end_duration: reader.u32()?,
            first_query_end2app_duration: reader.u32()?,
            first_return_type: reader.u16()?,
            is_from_cache: reader.u8()?,
            source_from: reader.u8()?,
            ipv4_query_info: FamilyQueryInfo::read(&mut reader)?,
            ipv6_query_info: FamilyQueryInfo::read(&mut reader)?,
        };
        reader.skip(DNS_PROCESS_INFO_SIZE - reader.position())?;
        Ok(info)
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = WireWriter::with_capacity(DNS_PROCESS_INFO_SIZE);
        writer.put_i64(self.query_time);
        writer.put_c_string("hostname", &self.hostname, PROCESS_INFO_HOST_WIDTH)?;
        writer.put_c_string("srcAddr", &self.src_addr, SERVER_SLOT)?;
        writer.pad_to(align4(writer.len()));
        writer.put_i32(self.ret_code);
        writer.put_u32(self.first_query_end_duration);
        writer.put_u32(self.first_query_end2app_duration);
        writer.put_u16(self.first_return_type);
        writer.put_u8(self.is_from_cache);
        writer.put_u8(self.source_from);
        self.ipv4_query_info.write(&mut writer)?;
        self.ipv6_query_info.write(&mut writer)?;
        writer.pad_to(DNS_PROCESS_INFO_SIZE);
        Ok(writer.into_inner())
    }
}

const fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PostDnsQueryParam {
    pub net_id: u32,
    pub uid: u32,
    pub pid: u32,
    pub addr_size: u8,
    pub process_info: DnsProcessInfo,
}

/// Leading fields of a `POST_DNS_ABNORMAL_RESULT` envelope.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AbnormalEnvelope {
    pub uid: u32,
    pub pid: u32,
    pub fail_cause: u32,
    pub addr_size: u8,
    pub process_info: DnsProcessInfo,
}

impl AbnormalEnvelope {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        let uid = reader.u32()?;
        let pid = reader.u32()?;
        let fail_cause = reader.u32()?;
        let addr_size = reader.u8()?;
        let process_info = DnsProcessInfo::decode(reader.take(DNS_PROCESS_INFO_SIZE)?)?;
        Ok(Self {
            uid,
            pid,
            fail_cause,
            addr_size,
            process_info,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = WireWriter::with_capacity(DNS_QUERY_ABNORMAL_SIZE);
        writer.put_u32(self.uid);
        writer.put_u32(self.pid);
        writer.put_u32(self.fail_cause);
        writer.put_u8(self.addr_size);
        writer.put_bytes(&self.process_info.encode()?);
        Ok(writer.into_inner())
    }
}

/// `ResolvConfig` / `ResolvConfigExt` reply, depending on the slot count.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvConfig {
    pub error: i32,
    pub timeout_ms: i32,
    pub retry_count: u32,
    pub non_public_num: u32,
    pub nameservers: Vec<String>,
}

impl ResolvConfig {
    pub fn failure(error: i32) -> Self {
        Self {
            error,
            ..Self::default()
        }
    }

    pub fn encode(&self, slots: usize) -> Result<Vec<u8>, WireError> {
        if self.nameservers.len() > slots {
            return Err(WireError::FieldTooLong {
                field: "nameservers",
                len: self.nameservers.len(),
                max: slots,
            });
        }
        let size = resolv_config_size(slots);
        let mut writer = WireWriter::with_capacity(size);
        writer.put_i32(self.error);
        writer.put_i32(self.timeout_ms);
        writer.put_u32(self.retry_count);
        writer.put_u32(self.non_public_num);
        for server in &self.nameservers {
            writer.put_c_string("nameserver", server, SERVER_SLOT)?;
        }
        writer.pad_to(size);
        Ok(writer.into_inner())
    }

    /// Empty slots are dropped from `nameservers`.
    pub fn decode(bytes: &[u8], slots: usize) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        let error = reader.i32()?;
        let timeout_ms = reader.i32()?;
        let retry_count = reader.u32()?;
        let non_public_num = reader.u32()?;
        let mut nameservers = Vec::with_capacity(slots);
        for _ in 0..slots {
            let server = reader.c_string(SERVER_SLOT)?;
            if !server.is_empty() {
                nameservers.push(server);
            }
        }
        Ok(Self {
            error,
            timeout_ms,
            retry_count,
            non_public_num,
            nameservers,
        })
    }
}

pub fn server_fits(server: &str) -> bool {
    server.len() <= MAX_SERVER_LENGTH
}
