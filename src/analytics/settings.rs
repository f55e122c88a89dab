use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::analytics::constants::{
    DATA_STORE_DIR_ENV, DEFAULT_DISPATCH_INTERVAL_SECS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_BATCH_SIZE, STORE_FILE_EXTENSION,
};
use crate::analytics::error::{invalid_argument, storage_unavailable, AnalyticsResult};
use crate::analytics::transport::HitTransport;
use crate::logger::Logger;

const FILE_NAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Construction parameters for an [`Analytics`](crate::analytics::Analytics) engine.
///
/// `product_name` together with the resolved data store path identifies the engine: two
/// settings values that agree on both resolve to the same instance.
#[derive(Clone)]
pub struct AnalyticsSettings {
    product_name: String,
    product_version: String,
    data_store_location: PathBuf,
    custom_client_id: Option<String>,
    dispatch_interval: f64,
    max_batch_size: usize,
    max_attempts: u32,
    debug: bool,
    opt_out: bool,
    transport: Option<Arc<dyn HitTransport>>,
    logger: Option<Logger>,
}

impl fmt::Debug for AnalyticsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyticsSettings")
            .field("product_name", &self.product_name)
            .field("product_version", &self.product_version)
            .field("data_store_location", &self.data_store_location)
            .field("custom_client_id", &self.custom_client_id)
            .field("dispatch_interval", &self.dispatch_interval)
            .field("max_batch_size", &self.max_batch_size)
            .field("max_attempts", &self.max_attempts)
            .field("debug", &self.debug)
            .field("opt_out", &self.opt_out)
            .field("custom_transport", &self.transport.is_some())
            .finish()
    }
}

impl AnalyticsSettings {
    /// `location` is either a directory (the store becomes `<dir>/<product_name>.gai`) or a file
    /// stem (the store becomes `<location>.gai`). An empty location uses `GAI_DATA_STORE_DIR`,
    /// falling back to the working directory.
    pub fn new(
        product_name: impl Into<String>,
        product_version: impl Into<String>,
        location: impl Into<PathBuf>,
    ) -> Self {
        Self {
            product_name: product_name.into(),
            product_version: product_version.into(),
            data_store_location: location.into(),
            custom_client_id: None,
            dispatch_interval: DEFAULT_DISPATCH_INTERVAL_SECS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            debug: false,
            opt_out: false,
            transport: None,
            logger: None,
        }
    }

    /// Reports every hit of this engine under `client_id` instead of the identity stored with
    /// the queue. The override is never written to the store.
    pub fn with_custom_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.custom_client_id = Some(client_id.into());
        self
    }

    /// Seconds between dispatch cycles. Zero dispatches after every hit; a negative value
    /// disables periodic dispatch.
    pub fn with_dispatch_interval(mut self, seconds: f64) -> Self {
        self.dispatch_interval = seconds;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Failed deliveries after which a hit is dropped. `0` retries forever.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_opt_out(mut self, opt_out: bool) -> Self {
        self.opt_out = opt_out;
        self
    }

    /// Replaces the default Measurement Protocol transport.
    pub fn with_transport(mut self, transport: Arc<dyn HitTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Routes debug trace lines through `logger`. Lines are emitted at `LogLevel::Debug` and the
    /// engine lowers the logger's level to match, so the debug flag alone decides what is shown.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn product_version(&self) -> &str {
        &self.product_version
    }

    pub fn data_store_location(&self) -> &Path {
        &self.data_store_location
    }

    pub fn custom_client_id(&self) -> Option<&str> {
        self.custom_client_id.as_deref()
    }

    pub fn dispatch_interval(&self) -> f64 {
        self.dispatch_interval
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn opt_out(&self) -> bool {
        self.opt_out
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn HitTransport>> {
        self.transport.clone()
    }

    pub(crate) fn logger(&self) -> Option<Logger> {
        self.logger.clone()
    }

    pub(crate) fn validate(&self) -> AnalyticsResult<()> {
        if self.product_name.trim().is_empty() {
            return Err(invalid_argument("product name must not be empty"));
        }
        if self.max_batch_size == 0 {
            return Err(invalid_argument("max batch size must be at least 1"));
        }
        if let Some(client_id) = &self.custom_client_id {
            if client_id.trim().is_empty() {
                return Err(invalid_argument("custom client id must not be empty"));
            }
        }
        Ok(())
    }

    /// Absolute path of the store file these settings resolve to.
    pub fn store_path(&self) -> AnalyticsResult<PathBuf> {
        resolve_store_path(&self.product_name, &self.data_store_location)
    }
}

pub(crate) fn resolve_store_path(product_name: &str, location: &Path) -> AnalyticsResult<PathBuf> {
    let file = if location.as_os_str().is_empty() {
        let dir = std::env::var_os(DATA_STORE_DIR_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        dir.join(store_file_name(product_name))
    } else if names_directory(location) {
        location.join(store_file_name(product_name))
    } else {
        let mut stem = OsString::from(location.as_os_str());
        stem.push(".");
        stem.push(STORE_FILE_EXTENSION);
        PathBuf::from(stem)
    };

    std::path::absolute(&file).map_err(|err| {
        storage_unavailable(format!(
            "failed to resolve data store path '{}': {err}",
            file.display()
        ))
    })
}

fn names_directory(location: &Path) -> bool {
    let raw = location.to_string_lossy();
    raw.ends_with('/') || raw.ends_with(MAIN_SEPARATOR) || location.is_dir()
}

fn store_file_name(product_name: &str) -> String {
    format!(
        "{}.{STORE_FILE_EXTENSION}",
        utf8_percent_encode(product_name, FILE_NAME_ENCODE_SET)
    )
}

/// Live, caller-mutable policy shared between the public API and the dispatch timeline.
#[derive(Debug)]
pub(crate) struct EnginePolicy {
    opt_out: AtomicBool,
    dispatch_interval_bits: AtomicU64,
    max_batch_size: usize,
    max_attempts: u32,
}

impl EnginePolicy {
    pub(crate) fn from_settings(settings: &AnalyticsSettings) -> Self {
        Self {
            opt_out: AtomicBool::new(settings.opt_out),
            dispatch_interval_bits: AtomicU64::new(settings.dispatch_interval.to_bits()),
            max_batch_size: settings.max_batch_size,
            max_attempts: settings.max_attempts,
        }
    }

    pub(crate) fn opt_out(&self) -> bool {
        self.opt_out.load(Ordering::SeqCst)
    }

    pub(crate) fn set_opt_out(&self, opt_out: bool) {
        self.opt_out.store(opt_out, Ordering::SeqCst);
    }

    pub(crate) fn dispatch_interval(&self) -> f64 {
        f64::from_bits(self.dispatch_interval_bits.load(Ordering::SeqCst))
    }

    pub(crate) fn set_dispatch_interval(&self, seconds: f64) {
        self.dispatch_interval_bits
            .store(seconds.to_bits(), Ordering::SeqCst);
    }

    pub(crate) fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub(crate) fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
