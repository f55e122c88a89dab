use std::future::Future;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::runtime::Builder;

/// Runs the future produced by `make_future` to completion on a dedicated, named OS thread with
/// its own single-threaded tokio runtime.
///
/// The thread is independent of any runtime the caller may be running on, so callers may join
/// it from synchronous code.
pub fn spawn_timeline<F, Fut>(name: &str, make_future: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()>,
{
    let thread_name = name.to_string();
    thread::Builder::new().name(thread_name.clone()).spawn(move || {
        match Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(make_future()),
            Err(err) => log::error!("failed to build runtime for thread '{thread_name}': {err}"),
        }
    })
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    tokio::time::sleep(duration).await;
}
