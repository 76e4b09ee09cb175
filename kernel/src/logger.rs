//! Kernel logging
//!
//! Leveled, tick-stamped log lines over the serial console. Messages are
//! best-effort and never fail the caller.

use core::sync::atomic::{AtomicU8, Ordering};

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
        }
    }
}

static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Debug as u8);

/// Raise or lower the minimum level that reaches the console
pub fn set_min_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[doc(hidden)]
pub fn _log(level: LogLevel, args: core::fmt::Arguments) {
    if (level as u8) < MIN_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    let stamp = crate::time::uptime_ms();
    crate::serial::_print(format_args!(
        "[{:>8}][{}] {}\n",
        stamp,
        level.as_str(),
        args
    ));
}

/// Log at an explicit level
#[macro_export]
macro_rules! log_level {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::_log($level, format_args!($($arg)*))
    };
}

/// Info log (default)
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Info, $($arg)*)
    };
}

/// Debug log
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Debug, $($arg)*)
    };
}

/// Warning log
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Warn, $($arg)*)
    };
}

/// Error log
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Error, $($arg)*)
    };
}
