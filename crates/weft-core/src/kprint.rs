//! Leveled stderr logging for the runtime
//!
//! Every log line carries the worker identity of the thread that emitted
//! it: the scheduler tags each worker thread on startup (and the caller
//! thread while it drains), so interleaved output from a pool reads as
//! `[error] [pool-2] ...` without each call site repeating the worker.
//!
//! # Environment Variables
//!
//! - `WEFT_LOG_LEVEL=<level>` - off, error, warn, info (default), debug,
//!   trace (names or 0-5)
//! - `WEFT_FLUSH_EPRINT=1` - flush stderr after each line (useful when
//!   chasing crashes in fiber code, where buffered output dies with the
//!   process)
//!
//! # Usage
//!
//! ```ignore
//! use weft_core::{kdebug, kinfo, kwarn, kerror};
//!
//! kinfo!("worker starting");
//! kerror!("epoll_ctl({}) failed: {}", fd, err);
//! ```

use crate::env::env_get_bool;

use std::cell::RefCell;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels, least to most verbose
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

const LEVELS: [LogLevel; 6] = [
    LogLevel::Off,
    LogLevel::Error,
    LogLevel::Warn,
    LogLevel::Info,
    LogLevel::Debug,
    LogLevel::Trace,
];

impl LogLevel {
    fn decode(v: u8) -> Self {
        *LEVELS.get(v as usize).unwrap_or(&LogLevel::Trace)
    }

    fn label(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Ok(LogLevel::Off),
            "error" | "1" => Ok(LogLevel::Error),
            "warn" | "2" => Ok(LogLevel::Warn),
            "info" | "3" => Ok(LogLevel::Info),
            "debug" | "4" => Ok(LogLevel::Debug),
            "trace" | "5" => Ok(LogLevel::Trace),
            _ => Err(()),
        }
    }
}

/// Sentinel: level not yet read from the environment
const LEVEL_UNSET: u8 = u8::MAX;

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_UNSET);
static FLUSH_EPRINT: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Worker identity stamped on every line this thread logs
    static THREAD_TAG: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Tag the current thread's log output (e.g. "echo-1" for a worker).
/// The scheduler calls this as each worker thread enters its loop.
pub fn set_thread_tag(tag: impl Into<String>) {
    THREAD_TAG.with(|cell| *cell.borrow_mut() = Some(tag.into()));
}

/// The current thread's log tag, if one was set
pub fn thread_tag() -> Option<String> {
    THREAD_TAG.with(|cell| cell.borrow().clone())
}

/// Current log level; first use reads the environment. Racing first
/// uses both parse the same variables, so the race is benign.
pub fn log_level() -> LogLevel {
    let v = LOG_LEVEL.load(Ordering::Relaxed);
    if v != LEVEL_UNSET {
        return LogLevel::decode(v);
    }
    FLUSH_EPRINT.store(env_get_bool("WEFT_FLUSH_EPRINT", false), Ordering::Relaxed);
    let level = std::env::var("WEFT_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(LogLevel::Info);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    level
}

/// Set log level programmatically (overrides the environment)
pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check if a log level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

/// Internal: format one line, holding the stderr lock so lines from
/// parallel workers never interleave mid-line.
#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let tag = thread_tag();
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = match &tag {
        Some(tag) => writeln!(out, "[{:<5}] [{}] {}", level.label(), tag, args),
        None => writeln!(out, "[{:<5}] {}", level.label(), args),
    };
    if FLUSH_EPRINT.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

/// Error level log (always shown unless logging is off)
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_ordered_by_verbosity() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_parse_names_and_digits() {
        assert_eq!("error".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert_eq!("DEBUG".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("4".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("0".parse::<LogLevel>(), Ok(LogLevel::Off));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_decode_saturates() {
        assert_eq!(LogLevel::decode(1), LogLevel::Error);
        assert_eq!(LogLevel::decode(99), LogLevel::Trace);
    }

    // level gate and macros share the one global level, so they live in
    // a single test to avoid racing each other
    #[test]
    fn test_level_gate_and_macros() {
        set_log_level(LogLevel::Off);
        assert!(!level_enabled(LogLevel::Error));
        assert!(!level_enabled(LogLevel::Off));

        kerror!("error {}", "msg");
        kwarn!("warn");
        kinfo!("info");
        kdebug!("debug");
        ktrace!("trace");

        set_log_level(LogLevel::Warn);
        assert!(level_enabled(LogLevel::Error));
        assert!(level_enabled(LogLevel::Warn));
        assert!(!level_enabled(LogLevel::Info));

        set_log_level(LogLevel::Off);
    }

    #[test]
    fn test_thread_tag_is_per_thread() {
        set_thread_tag("pool-0");
        assert_eq!(thread_tag().as_deref(), Some("pool-0"));

        let other = std::thread::spawn(thread_tag);
        assert_eq!(other.join().unwrap(), None);
    }
}
