pub const STORE_FILE_EXTENSION: &str = "gai";
pub const DATA_STORE_DIR_ENV: &str = "GAI_DATA_STORE_DIR";
pub const DEBUG_LOGGER_NAME: &str = "@gai/analytics";
pub const DISPATCH_THREAD_NAME: &str = "gai-dispatch";

pub const DEFAULT_DISPATCH_INTERVAL_SECS: f64 = 120.0;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 20;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const MAX_BATCHES_PER_CYCLE: usize = 50;

pub const MEASUREMENT_PROTOCOL_VERSION: &str = "1";
pub const MEASUREMENT_PROTOCOL_MAX_BATCH: usize = 20;
pub const CLIENT_ID_LENGTH: usize = 36;
