//! Kernel-style logging macros for hbmon.
//!
//! The monitor logs the way a kernel module printk()s: terse diagnostic
//! lines on stderr at failure points, gated by an environment variable.
//!
//! # Environment
//!
//! - `HBMON_LOG_LEVEL=<n>`: 0=off, 1=error, 2=warn, 3=info, 4=debug
//!   (default: warn)
//!
//! # Usage
//!
//! ```ignore
//! use hbmon_core::{kerror, kinfo};
//!
//! kerror!("group {}: slot allocation failed", gid);
//! kinfo!("group {} created", gid);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Log levels, lowest value most severe.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
}

impl LogLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

// 0xff = not yet read from the environment.
static LEVEL: AtomicU8 = AtomicU8::new(0xff);

/// Current log level, read from `HBMON_LOG_LEVEL` on first use.
pub fn level() -> LogLevel {
    let raw = LEVEL.load(Ordering::Relaxed);
    if raw != 0xff {
        return LogLevel::from_u8(raw);
    }
    let parsed = std::env::var("HBMON_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .unwrap_or(LogLevel::Warn as u8);
    LEVEL.store(parsed, Ordering::Relaxed);
    LogLevel::from_u8(parsed)
}

/// Override the log level (tests, embedders).
pub fn set_level(l: LogLevel) {
    LEVEL.store(l as u8, Ordering::Relaxed);
}

#[doc(hidden)]
pub fn log(at: LogLevel, args: fmt::Arguments<'_>) {
    if at <= level() && at != LogLevel::Off {
        eprintln!("[hbmon {}] {}", at.prefix(), args);
    }
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Debug, format_args!($($arg)*))
    };
}
