//! Process-wide log routing to an `extern "C"` sink.
//!
//! Plain log lines are filtered by level; breadcrumbs are debug lines tagged
//! with a category and filtered by the sink's breadcrumb mask instead.

use crate::ffi::DnsdLogSink;
use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

type LogCallback = unsafe extern "C" fn(
    level: *const c_char,
    message: *const c_char,
    breadcrumbs: u32,
    context: *mut c_void,
);

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn error(message: impl Into<String>) {
    LOGGER.emit(LogLevel::Error, BreadcrumbFlags::empty(), message.into());
}

pub fn warn(message: impl Into<String>) {
    LOGGER.emit(LogLevel::Warn, BreadcrumbFlags::empty(), message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.emit(LogLevel::Info, BreadcrumbFlags::empty(), message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.emit(LogLevel::Debug, BreadcrumbFlags::empty(), message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    if flag.is_empty() {
        return;
    }
    LOGGER.emit(LogLevel::Debug, flag, message.into());
}

/// Replaces the sink. `None` detaches logging entirely.
pub fn install_sink(sink: Option<&DnsdLogSink>, level: Option<&str>) -> Result<(), &'static str> {
    LOGGER.install(sink, level)
}

pub fn set_breadcrumb_mask(mask: u32) {
    if let Some(sink) = LOGGER.sink.lock().as_mut() {
        sink.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreadcrumbFlags: u32 {
        const LISTENER = 0b0000_0001;
        const EPOLL    = 0b0000_0010;
        const CACHE    = 0b0000_0100;
        const QUEUE    = 0b0000_1000;
        const DIAG     = 0b0001_0000;
        const CLIENT   = 0b0010_0000;
        const FFI      = 0b0100_0000;
        const ALL      = u32::MAX;
    }
}

impl BreadcrumbFlags {
    fn label(self) -> &'static str {
        self.iter_names()
            .map(|(name, _)| name)
            .find(|name| *name != "ALL")
            .unwrap_or("LOG")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn as_c_str(self) -> &'static [u8] {
        match self {
            LogLevel::Error => b"error\0",
            LogLevel::Warn => b"warn\0",
            LogLevel::Info => b"info\0",
            LogLevel::Debug => b"debug\0",
        }
    }
}

impl FromStr for LogLevel {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" | "verbose" => Ok(LogLevel::Debug),
            _ => Err("unknown log level"),
        }
    }
}

#[derive(Clone, Copy)]
struct InstalledSink {
    callback: LogCallback,
    context: *mut c_void,
    breadcrumbs: BreadcrumbFlags,
    max_level: LogLevel,
}

// The sink owner promises the context may be used from any thread.
unsafe impl Send for InstalledSink {}

impl InstalledSink {
    fn accepts(&self, level: LogLevel, flags: BreadcrumbFlags) -> bool {
        if flags.is_empty() {
            level <= self.max_level
        } else {
            self.breadcrumbs.intersects(flags)
        }
    }
}

struct LogManager {
    sink: Mutex<Option<InstalledSink>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            prefix: format!("[dnsd-p{}]", std::process::id()),
        }
    }

    fn install(&self, sink: Option<&DnsdLogSink>, level: Option<&str>) -> Result<(), &'static str> {
        let Some(sink) = sink else {
            *self.sink.lock() = None;
            return Ok(());
        };
        let callback = sink.log.ok_or("log callback missing")?;
        let max_level = match level {
            Some(level) => level.parse()?,
            None => LogLevel::Info,
        };
        *self.sink.lock() = Some(InstalledSink {
            callback,
            context: sink.context,
            breadcrumbs: BreadcrumbFlags::from_bits_truncate(sink.enabled_breadcrumbs),
            max_level,
        });
        Ok(())
    }

    fn emit(&self, level: LogLevel, flags: BreadcrumbFlags, message: String) {
        if message.is_empty() {
            return;
        }
        let Some(sink) = *self.sink.lock() else {
            return;
        };
        if !sink.accepts(level, flags) {
            return;
        }
        let line = if flags.is_empty() {
            format!("{} {message}", self.prefix)
        } else {
            format!("{} [{}] {message}", self.prefix, flags.label())
        };
        let Ok(line) = CString::new(line) else {
            return;
        };
        let level = level.as_c_str();
        // Safety: the callback stays valid while installed; `level` is NUL terminated.
        unsafe {
            (sink.callback)(
                level.as_ptr() as *const c_char,
                line.as_ptr(),
                flags.bits(),
                sink.context,
            );
        }
    }
}

/// Minimum spacing between two lines of the same [`ErrorCategory`].
const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(1);

const CATEGORY_COUNT: usize = 6;

/// Failure classes throttled by [`rate_limited_error`]. A misbehaving client
/// can trip the same one on every connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ErrorCategory {
    /// Malformed or unexpected request bytes
    ProtocolError,
    /// Declared length or count outside the protocol bounds
    BoundsViolation,
    SocketError,
    CacheError,
    /// Reply could not be delivered to the client
    ReplyFailed,
    /// Fwmark binding of a client descriptor failed
    BindFailed,
}

impl ErrorCategory {
    fn label(self) -> &'static str {
        match self {
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::BoundsViolation => "BOUNDS_VIOLATION",
            Self::SocketError => "SOCKET_ERROR",
            Self::CacheError => "CACHE_ERROR",
            Self::ReplyFailed => "REPLY_FAILED",
            Self::BindFailed => "BIND_FAILED",
        }
    }
}

/// Milliseconds since `epoch` of each category's last line, offset by one so
/// zero means "never".
struct RateLimiter {
    epoch: Instant,
    interval: Duration,
    last: [AtomicU64; CATEGORY_COUNT],
}

impl RateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            interval,
            last: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn admit(&self, category: ErrorCategory) -> bool {
        let now = self.epoch.elapsed().as_millis() as u64 + 1;
        let slot = &self.last[category as usize];
        let last = slot.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < self.interval.as_millis() as u64 {
            return false;
        }
        // Only the thread that wins the swap emits.
        slot.compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

static RATE_LIMITER: Lazy<RateLimiter> = Lazy::new(|| RateLimiter::new(RATE_LIMIT_INTERVAL));

/// Logs at warn level unless `category` already logged within the last second.
/// Returns true when the line was emitted.
pub fn rate_limited_error(category: ErrorCategory, message: impl Into<String>) -> bool {
    if !RATE_LIMITER.admit(category) {
        return false;
    }
    warn(format!("[{}] {}", category.label(), message.into()));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_leniently() {
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(" dbg ".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Error < LogLevel::Debug);
    }

    #[test]
    fn breadcrumb_labels_name_first_category() {
        assert_eq!(BreadcrumbFlags::CACHE.label(), "CACHE");
        assert_eq!((BreadcrumbFlags::EPOLL | BreadcrumbFlags::DIAG).label(), "EPOLL");
        assert_eq!(BreadcrumbFlags::ALL.label(), "LISTENER");
    }

    #[test]
    fn sink_filters_by_level_and_mask() {
        unsafe extern "C" fn noop(_: *const c_char, _: *const c_char, _: u32, _: *mut c_void) {}
        let sink = InstalledSink {
            callback: noop,
            context: std::ptr::null_mut(),
            breadcrumbs: BreadcrumbFlags::CACHE,
            max_level: LogLevel::Warn,
        };
        assert!(sink.accepts(LogLevel::Error, BreadcrumbFlags::empty()));
        assert!(!sink.accepts(LogLevel::Info, BreadcrumbFlags::empty()));
        assert!(sink.accepts(LogLevel::Debug, BreadcrumbFlags::CACHE));
        assert!(!sink.accepts(LogLevel::Debug, BreadcrumbFlags::EPOLL));
    }

    #[test]
    fn rate_limiter_admits_once_per_interval_per_category() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.admit(ErrorCategory::ProtocolError));
        assert!(!limiter.admit(ErrorCategory::ProtocolError));
        assert!(limiter.admit(ErrorCategory::BindFailed));

        let eager = RateLimiter::new(Duration::ZERO);
        assert!(eager.admit(ErrorCategory::ReplyFailed));
        assert!(eager.admit(ErrorCategory::ReplyFailed));
    }
}
