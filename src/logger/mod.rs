use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

/// Handler invoked for every record a [`Logger`] lets through.
pub type LogHandler = Arc<dyn Fn(&LogRecord) + Send + Sync + 'static>;

/// Named, level-aware logger with a replaceable output handler.
///
/// The default handler writes timestamped lines to stdout. Install a handler with
/// [`Logger::set_log_handler`] to capture engine trace output instead.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    name: String,
    log_level: AtomicU8,
    log_handler: RwLock<LogHandler>,
}

/// One emitted log line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub logger: String,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.inner.name)
            .field("log_level", &self.log_level())
            .finish()
    }
}

impl Logger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                name: name.into(),
                log_level: AtomicU8::new(LogLevel::Info as u8),
                log_handler: RwLock::new(Arc::new(default_log_handler)),
            }),
        }
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.log_level.load(Ordering::SeqCst))
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.log_level.store(level as u8, Ordering::SeqCst);
    }

    pub fn set_log_handler<F>(&self, handler: F)
    where
        F: Fn(&LogRecord) + Send + Sync + 'static,
    {
        *self
            .inner
            .log_handler
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = Arc::new(handler);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.dispatch(LogLevel::Debug, message.into());
    }

    fn dispatch(&self, level: LogLevel, message: String) {
        if level < self.log_level() {
            return;
        }
        let record = LogRecord {
            logger: self.inner.name.clone(),
            level,
            message,
        };
        let handler = self
            .inner
            .log_handler
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone();
        handler(&record);
    }
}

fn default_log_handler(record: &LogRecord) {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    println!(
        "[{now}]  {} {}: {}",
        record.logger,
        record.level.as_str(),
        record.message
    );
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Silent = 2,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Silent => "silent",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            _ => LogLevel::Silent,
        }
    }
}
