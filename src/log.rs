//! Structured logging for judo.
//!
//! Log levels:
//! - ERROR: Failures that end a host's pipeline
//! - WARN: Unexpected conditions that are recoverable
//! - INFO: Remote output lines, job progress, and the final report
//! - DEBUG: Transport invocations and state transitions
//! - TRACE: Very detailed traces
//!
//! There is no global logger. `main` builds one `Logger`, and every host gets
//! a child from `Logger::for_host` whose lines are tagged `"<host>: "`.
//! Debug mode can be enabled with `--debug` flag or `JUDO_DEBUG=1` env var.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

enum Sink {
    Stderr { file: Option<PathBuf> },
    Memory(Mutex<Vec<(LogLevel, String)>>),
}

struct Inner {
    level: AtomicU8,
    sink: Sink,
}

/// Cloneable logging context. Clones share the sink and level.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
    prefix: Option<Arc<str>>,
}

impl Logger {
    /// Logger writing to stderr, and to `file` (truncated) when given.
    pub fn new(debug: bool, file: Option<PathBuf>) -> Self {
        let env_debug = std::env::var("JUDO_DEBUG")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let level = if debug || env_debug {
            LogLevel::Debug
        } else {
            LogLevel::Info
        };

        let file = file.and_then(|path| {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            std::fs::write(&path, "").ok().map(|_| path)
        });

        Self::with_sink(level, Sink::Stderr { file })
    }

    /// Logger that keeps every line in memory. Used by tests to assert on output.
    pub fn memory() -> Self {
        Self::with_sink(LogLevel::Trace, Sink::Memory(Mutex::new(Vec::new())))
    }

    fn with_sink(level: LogLevel, sink: Sink) -> Self {
        Self {
            inner: Arc::new(Inner {
                level: AtomicU8::new(level as u8),
                sink,
            }),
            prefix: None,
        }
    }

    /// Child logger whose lines are tagged with the host's name.
    pub fn for_host(&self, name: &str) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            prefix: Some(Arc::from(format!("{}: ", name))),
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        self.inner.level.store(level as u8, Ordering::SeqCst);
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.level.load(Ordering::Relaxed))
    }

    /// Log a message at the specified level.
    pub fn log_at(&self, level: LogLevel, msg: &str) {
        if level > self.level() {
            return;
        }

        let line = match &self.prefix {
            Some(prefix) => format!("{}{}", prefix, msg),
            None => msg.to_string(),
        };

        match &self.inner.sink {
            Sink::Stderr { file } => {
                eprintln!("{}", line);
                if let Some(path) = file {
                    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
                        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
                        let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), line);
                    }
                }
            }
            Sink::Memory(lines) => {
                if let Ok(mut lines) = lines.lock() {
                    lines.push((level, line));
                }
            }
        }
    }

    pub fn error(&self, msg: &str) {
        self.log_at(LogLevel::Error, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.log_at(LogLevel::Warn, msg);
    }

    pub fn info(&self, msg: &str) {
        self.log_at(LogLevel::Info, msg);
    }

    pub fn debug(&self, msg: &str) {
        self.log_at(LogLevel::Debug, msg);
    }

    pub fn trace(&self, msg: &str) {
        self.log_at(LogLevel::Trace, msg);
    }

    /// Captured records of a memory logger. Empty for stderr loggers.
    pub fn records(&self) -> Vec<(LogLevel, String)> {
        match &self.inner.sink {
            Sink::Memory(lines) => lines.lock().map(|l| l.clone()).unwrap_or_default(),
            Sink::Stderr { .. } => Vec::new(),
        }
    }

    /// Captured lines of a memory logger, without levels.
    pub fn lines(&self) -> Vec<String> {
        self.records().into_iter().map(|(_, line)| line).collect()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.level())
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Log macro for INFO level.
#[macro_export]
macro_rules! jlog {
    ($log:expr, $($arg:tt)*) => {
        $log.info(&format!($($arg)*))
    };
}

/// Log macro for ERROR level.
#[macro_export]
macro_rules! jlog_error {
    ($log:expr, $($arg:tt)*) => {
        $log.error(&format!($($arg)*))
    };
}

/// Log macro for WARN level.
#[macro_export]
macro_rules! jlog_warn {
    ($log:expr, $($arg:tt)*) => {
        $log.warn(&format!($($arg)*))
    };
}

/// Log macro for DEBUG level (only logs when debug mode is enabled).
#[macro_export]
macro_rules! jlog_debug {
    ($log:expr, $($arg:tt)*) => {
        $log.debug(&format!($($arg)*))
    };
}

/// Log macro for TRACE level.
#[macro_export]
macro_rules! jlog_trace {
    ($log:expr, $($arg:tt)*) => {
        $log.trace(&format!($($arg)*))
    };
}
