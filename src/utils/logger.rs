use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

impl LogLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warning,
            3 => Self::Error,
            _ => Self::Critical,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Destination for formatted log lines.
pub trait LogSink: Send + Sync {
    fn emit(&self, level: LogLevel, line: &str);
}

/// Forwards every line to `tracing` under the `powerline` target.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, level: LogLevel, line: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "powerline", "{}", line),
            LogLevel::Info => tracing::info!(target: "powerline", "{}", line),
            LogLevel::Warning => tracing::warn!(target: "powerline", "{}", line),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(target: "powerline", "{}", line)
            }
        }
    }
}

/// Keeps lines in memory. Used by tests and by embedders that surface
/// diagnostics themselves.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every recorded line, leaving the sink empty.
    pub fn pop(&self) -> Vec<(LogLevel, String)> {
        match self.messages.lock() {
            Ok(mut messages) => std::mem::take(&mut *messages),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.pop().into_iter().map(|(_, line)| line).collect()
    }
}

impl LogSink for RecordingSink {
    fn emit(&self, level: LogLevel, line: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((level, line.to_string()));
        }
    }
}

/// Logging handle shared by the coordinator, the config loader and every
/// segment. Lines come out as `{ext}:{prefix}:{message}`.
#[derive(Clone)]
pub struct PowerlineLogger {
    ext: Arc<str>,
    level: Arc<AtomicU8>,
    sink: Arc<dyn LogSink>,
}

impl PowerlineLogger {
    pub fn new(ext: &str) -> Self {
        Self::with_sink(ext, Arc::new(TracingSink))
    }

    pub fn with_sink(ext: &str, sink: Arc<dyn LogSink>) -> Self {
        let level = if env::var("POWERLINE_DEBUG").is_ok() {
            LogLevel::Debug
        } else {
            LogLevel::Warning
        };
        Self {
            ext: Arc::from(ext),
            level: Arc::new(AtomicU8::new(level as u8)),
            sink,
        }
    }

    pub fn ext(&self) -> &str {
        &self.ext
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Applies to every clone of this logger.
    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn log(&self, level: LogLevel, prefix: &str, message: impl fmt::Display) {
        if level < self.level() {
            return;
        }
        let line = format!("{}:{}:{}", self.ext, prefix, message);
        self.sink.emit(level, &line);
    }

    pub fn debug(&self, prefix: &str, message: impl fmt::Display) {
        self.log(LogLevel::Debug, prefix, message);
    }

    pub fn info(&self, prefix: &str, message: impl fmt::Display) {
        self.log(LogLevel::Info, prefix, message);
    }

    pub fn warn(&self, prefix: &str, message: impl fmt::Display) {
        self.log(LogLevel::Warning, prefix, message);
    }

    pub fn error(&self, prefix: &str, message: impl fmt::Display) {
        self.log(LogLevel::Error, prefix, message);
    }

    pub fn critical(&self, prefix: &str, message: impl fmt::Display) {
        self.log(LogLevel::Critical, prefix, message);
    }
}

impl fmt::Debug for PowerlineLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerlineLogger")
            .field("ext", &self.ext)
            .field("level", &self.level())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_carry_ext_and_prefix() {
        let sink = Arc::new(RecordingSink::new());
        let pl = PowerlineLogger::with_sink("shell", sink.clone());
        pl.set_level(LogLevel::Debug);
        pl.error("network_load", "interface vanished");
        assert_eq!(sink.lines(), vec!["shell:network_load:interface vanished"]);
    }

    #[test]
    fn test_threshold_is_shared_between_clones() {
        let sink = Arc::new(RecordingSink::new());
        let pl = PowerlineLogger::with_sink("tmux", sink.clone());
        let clone = pl.clone();
        pl.set_level(LogLevel::Error);
        clone.warn("x", "dropped");
        clone.error("x", "kept");
        assert_eq!(sink.lines(), vec!["tmux:x:kept"]);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
