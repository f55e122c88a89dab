//! Test utilities shared across crate-level unit tests.

pub mod http;
pub mod transport;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use http::start_mock_server;
pub use transport::RecordingTransport;

/// Returns a fresh, empty directory under the system temp dir.
pub fn temp_store_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "gai-{prefix}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    let _ = std::fs::remove_dir_all(&path);
    path
}

/// Returns a store file path inside a fresh temp directory. The file itself does not exist yet.
pub fn temp_store_path(prefix: &str) -> PathBuf {
    temp_store_dir(prefix).join(format!("{prefix}.gai"))
}
