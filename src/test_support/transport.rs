use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::analytics::error::delivery_failure;
use crate::analytics::{AnalyticsResult, HitRecord, HitTransport};
use crate::platform::runtime::sleep;

/// In-memory transport that records every batch it accepts and can be switched to fail.
#[derive(Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<Vec<HitRecord>>>,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    started: AtomicUsize,
}

#[async_trait]
impl HitTransport for RecordingTransport {
    async fn send(&self, batch: &[HitRecord]) -> AnalyticsResult<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        sleep(delay).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(delivery_failure("collector unreachable"));
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

impl RecordingTransport {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Holds every send for `delay` before it completes.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Number of sends that have begun, finished or not.
    pub fn sends_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Sequence ids of every accepted batch, in send order.
    pub fn sent_ids(&self) -> Vec<Vec<u64>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|batch| batch.iter().map(HitRecord::sequence_id).collect())
            .collect()
    }

    pub fn sent_payloads(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|record| String::from_utf8_lossy(record.payload()).into_owned())
            .collect()
    }
}
