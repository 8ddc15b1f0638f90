//! Leveled message channel from plugins to the host.
//!
//! The router forwards level and bytes untouched. Filtering is left to
//! whatever the sink forwards to (for [`FacadeSink`], the `log` backend the
//! host installed).

use std::fmt;
use std::sync::{Arc, Mutex};

/// Log target used for every message coming from a plugin.
pub const PLUGIN_LOG_TARGET: &str = "stagefuzz::plugin";

/// Plugin log levels, ordered by increasing verbosity.
///
/// The numeric values are part of the plugin ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl TryFrom<u32> for LogLevel {
    type Error = u32;

    fn try_from(level: u32) -> Result<Self, u32> {
        match level {
            0 => Ok(LogLevel::Error),
            1 => Ok(LogLevel::Warn),
            2 => Ok(LogLevel::Info),
            3 => Ok(LogLevel::Debug),
            4 => Ok(LogLevel::Trace),
            other => Err(other),
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&log::Level::from(*self), f)
    }
}

/// Destination for plugin log messages.
///
/// `message` has an explicit length, may be empty and need not be UTF-8.
pub trait LogSink {
    fn log(&self, source: &str, level: LogLevel, message: &[u8]);
}

impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    fn log(&self, source: &str, level: LogLevel, message: &[u8]) {
        (**self).log(source, level, message)
    }
}

impl<T: LogSink + ?Sized> LogSink for Box<T> {
    fn log(&self, source: &str, level: LogLevel, message: &[u8]) {
        (**self).log(source, level, message)
    }
}

/// Forwards plugin messages to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeSink;

impl LogSink for FacadeSink {
    fn log(&self, source: &str, level: LogLevel, message: &[u8]) {
        log::log!(
            target: PLUGIN_LOG_TARGET,
            level.into(),
            "[{}] {}",
            source,
            String::from_utf8_lossy(message)
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub source: String,
    pub level: LogLevel,
    pub message: Vec<u8>,
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Messages at `level` rendered as lossy UTF-8.
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.level == level)
            .map(|r| String::from_utf8_lossy(&r.message).into_owned())
            .collect()
    }
}

impl LogSink for MemorySink {
    fn log(&self, source: &str, level: LogLevel, message: &[u8]) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(LogRecord {
                source: source.to_string(),
                level,
                message: message.to_vec(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_convert_from_abi_codes() {
        assert_eq!(LogLevel::try_from(0), Ok(LogLevel::Error));
        assert_eq!(LogLevel::try_from(4), Ok(LogLevel::Trace));
        assert_eq!(LogLevel::try_from(5), Err(5));
        assert!(LogLevel::Error < LogLevel::Trace);
        assert_eq!(log::Level::from(LogLevel::Warn), log::Level::Warn);
    }

    #[test]
    fn memory_sink_keeps_raw_bytes() {
        let sink = MemorySink::new();
        sink.log("p", LogLevel::Info, b"");
        sink.log("p", LogLevel::Info, &[0xff, b'a']);
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(records[0].message.is_empty(), "empty messages are accepted");
        assert_eq!(records[1].message, vec![0xff, b'a']);
    }

    #[test]
    fn shared_sink_sees_messages_through_arc() {
        let sink = Arc::new(MemorySink::new());
        let boxed: Box<dyn LogSink> = Box::new(Arc::clone(&sink));
        boxed.log("q", LogLevel::Warn, b"careful");
        assert_eq!(sink.messages(LogLevel::Warn), vec!["careful".to_string()]);
    }

    #[test_log::test]
    fn facade_sink_accepts_non_utf8_and_empty() {
        FacadeSink.log("p", LogLevel::Debug, b"");
        FacadeSink.log("p", LogLevel::Error, &[0xc3, 0x28]);
    }
}
