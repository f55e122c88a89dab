use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::analytics::api::AnalyticsInner;
use crate::analytics::constants::MEASUREMENT_PROTOCOL_VERSION;
use crate::analytics::debug::debug_print;
use crate::analytics::error::{invalid_argument, invalid_reference, AnalyticsResult};
use crate::analytics::hit::Hit;

const SAMPLE_BUCKETS: u32 = 10_000;
const FULL_SAMPLE_RATE: f64 = 100.0;

/// Hit producer for one tracking id, issued by
/// [`Analytics::create_tracker`](crate::analytics::Analytics::create_tracker).
///
/// Clones share state; two `Tracker` values compare equal only when they are the same issued
/// instance.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    handle: u64,
    tracker_id: String,
    client_id: String,
    engine: Weak<AnalyticsInner>,
    attached: AtomicBool,
    defaults: Mutex<BTreeMap<String, String>>,
    sample_rate_bits: AtomicU64,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("tracker_id", &self.inner.tracker_id)
            .field("client_id", &self.inner.client_id)
            .field("handle", &self.inner.handle)
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl PartialEq for Tracker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Tracker {}

impl Tracker {
    pub(crate) fn new(
        handle: u64,
        tracker_id: impl Into<String>,
        client_id: impl Into<String>,
        engine: Weak<AnalyticsInner>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                handle,
                tracker_id: tracker_id.into(),
                client_id: client_id.into(),
                engine,
                attached: AtomicBool::new(true),
                defaults: Mutex::new(BTreeMap::new()),
                sample_rate_bits: AtomicU64::new(FULL_SAMPLE_RATE.to_bits()),
            }),
        }
    }

    pub fn tracker_id(&self) -> &str {
        &self.inner.tracker_id
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Token issued by the registry when this tracker was created. Every issued tracker has a
    /// distinct handle, including one recreated under a previously removed id.
    pub fn handle(&self) -> u64 {
        self.inner.handle
    }

    /// Whether the tracker is still registered with a live engine.
    pub fn is_attached(&self) -> bool {
        self.inner.attached.load(Ordering::SeqCst)
    }

    pub(crate) fn detach(&self) {
        self.inner.attached.store(false, Ordering::SeqCst);
    }

    /// Encodes and queues a hit.
    ///
    /// Returns `Ok(())` without queueing anything when the user has opted out or this
    /// installation is outside the tracker's sample.
    pub fn track(&self, hit: Hit) -> AnalyticsResult<()> {
        let engine = self.engine()?;
        hit.validate()?;
        if !self.admits(&engine, hit.hit_type().as_str()) {
            return Ok(());
        }

        let mut defaults = BTreeMap::from([("an".to_string(), engine.product_name().to_string())]);
        if !engine.product_version().is_empty() {
            defaults.insert("av".to_string(), engine.product_version().to_string());
        }
        defaults.extend(self.lock_defaults().clone());

        let payload = hit.encode(
            &defaults,
            &[
                ("v", MEASUREMENT_PROTOCOL_VERSION),
                ("tid", self.tracker_id()),
                ("cid", self.client_id()),
            ],
        );
        engine.enqueue(self.tracker_id(), payload)
    }

    /// Queues an already encoded payload as-is, subject to the same opt-out and sampling gates
    /// as [`Tracker::track`].
    ///
    /// The payload must be form-urlencoded text; non-UTF-8 bytes are rejected with
    /// `InvalidArgument`.
    pub fn track_payload(&self, payload: impl Into<Bytes>) -> AnalyticsResult<()> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(invalid_argument("hit payload must not be empty"));
        }
        if let Err(err) = std::str::from_utf8(&payload) {
            return Err(invalid_argument(format!(
                "hit payload must be UTF-8 text: {err}"
            )));
        }
        let engine = self.engine()?;
        if !self.admits(&engine, "raw") {
            return Ok(());
        }
        engine.enqueue(self.tracker_id(), payload)
    }

    /// Sets a parameter sent with every hit from this tracker unless the hit sets it itself.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> AnalyticsResult<()> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(invalid_argument("parameter name must not be empty"));
        }
        self.lock_defaults().insert(key, value.into());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock_defaults().get(key).cloned()
    }

    pub fn unset(&self, key: &str) -> Option<String> {
        self.lock_defaults().remove(key)
    }

    /// Percentage of installations (0 to 100) whose hits are kept.
    pub fn set_sample_rate(&self, percent: f64) -> AnalyticsResult<()> {
        if !(0.0..=FULL_SAMPLE_RATE).contains(&percent) {
            return Err(invalid_argument(format!(
                "sample rate must be between 0 and 100, got {percent}"
            )));
        }
        self.inner
            .sample_rate_bits
            .store(percent.to_bits(), Ordering::SeqCst);
        Ok(())
    }

    pub fn sample_rate(&self) -> f64 {
        f64::from_bits(self.inner.sample_rate_bits.load(Ordering::SeqCst))
    }

    fn is_sampled(&self) -> bool {
        let rate = self.sample_rate();
        if rate >= FULL_SAMPLE_RATE {
            return true;
        }
        f64::from(sample_bucket(self.client_id())) < rate * (SAMPLE_BUCKETS as f64 / 100.0)
    }

    fn admits(&self, engine: &AnalyticsInner, kind: &str) -> bool {
        if engine.opted_out() {
            debug_print!(
                engine.debug(),
                "discarded {kind} hit for tracker '{}': user opted out",
                self.tracker_id()
            );
            return false;
        }
        if !self.is_sampled() {
            debug_print!(
                engine.debug(),
                "discarded {kind} hit for tracker '{}': client outside {}% sample",
                self.tracker_id(),
                self.sample_rate()
            );
            return false;
        }
        true
    }

    fn engine(&self) -> AnalyticsResult<Arc<AnalyticsInner>> {
        if !self.is_attached() {
            return Err(invalid_reference(format!(
                "tracker '{}' has been removed",
                self.tracker_id()
            )));
        }
        self.inner
            .engine
            .upgrade()
            .filter(|engine| !engine.is_invalidated())
            .ok_or_else(|| {
                invalid_reference(format!(
                    "tracker '{}' belongs to an invalidated engine",
                    self.tracker_id()
                ))
            })
    }

    fn lock_defaults(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.inner
            .defaults
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Stable bucket in `0..10_000` derived from the client id.
fn sample_bucket(client_id: &str) -> u32 {
    let digest = Sha1::digest(client_id.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % SAMPLE_BUCKETS
}
