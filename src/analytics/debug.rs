use std::sync::atomic::{AtomicBool, Ordering};

use crate::analytics::constants::DEBUG_LOGGER_NAME;
use crate::logger::{LogLevel, LogRecord, Logger};

/// Hard-gated trace output for one engine.
///
/// Use [`debug_print!`] rather than calling [`DebugSink::emit`] directly so the message is only
/// formatted when tracing is enabled.
#[derive(Debug)]
pub(crate) struct DebugSink {
    enabled: AtomicBool,
    logger: Logger,
}

impl DebugSink {
    /// The logger, injected or default, is set to `LogLevel::Debug` so the enabled flag stays
    /// the only gate on trace lines.
    pub(crate) fn new(enabled: bool, logger: Option<Logger>) -> Self {
        let logger = logger.unwrap_or_else(|| Logger::new(DEBUG_LOGGER_NAME));
        logger.set_log_level(LogLevel::Debug);
        Self {
            enabled: AtomicBool::new(enabled),
            logger,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&LogRecord) + Send + Sync + 'static,
    {
        self.logger.set_log_handler(handler);
    }

    pub(crate) fn emit(&self, message: String) {
        self.logger.debug(message);
    }
}

macro_rules! debug_print {
    ($sink:expr, $($arg:tt)*) => {{
        let sink: &$crate::analytics::debug::DebugSink = &$sink;
        if sink.is_enabled() {
            sink.emit(format!($($arg)*));
        }
    }};
}

pub(crate) use debug_print;
