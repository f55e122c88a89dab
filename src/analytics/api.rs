use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use bytes::Bytes;

use crate::analytics::debug::{debug_print, DebugSink};
use crate::analytics::dispatch::{
    DispatchContext, DispatchMode, DispatchScheduler, DispatchSummary,
};
use crate::analytics::error::{invalid_argument, invalid_reference, AnalyticsResult};
use crate::analytics::queue::DurableQueue;
use crate::analytics::registry::TrackerRegistry;
use crate::analytics::settings::{AnalyticsSettings, EnginePolicy};
use crate::analytics::tracker::Tracker;
use crate::analytics::transport::{
    HitTransport, MeasurementProtocolConfig, MeasurementProtocolTransport,
};
use crate::logger::LogRecord;

/// Live engines in construction order. The first entry is the default engine.
static ENGINES: LazyLock<Mutex<Vec<Analytics>>> = LazyLock::new(|| Mutex::new(Vec::new()));

fn engines() -> MutexGuard<'static, Vec<Analytics>> {
    ENGINES.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct EngineKey {
    product_name: String,
    store_path: PathBuf,
}

/// Handle to one telemetry engine: its durable queue, its trackers and its dispatch timeline.
///
/// Handles are cheap to clone and all clones address the same engine.
#[derive(Clone)]
pub struct Analytics {
    inner: Arc<AnalyticsInner>,
}

pub(crate) struct AnalyticsInner {
    key: EngineKey,
    product_version: String,
    client_id: String,
    queue: Arc<DurableQueue>,
    registry: TrackerRegistry,
    policy: Arc<EnginePolicy>,
    debug: Arc<DebugSink>,
    scheduler: DispatchScheduler,
    invalidated: AtomicBool,
}

impl fmt::Debug for Analytics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analytics")
            .field("product_name", &self.inner.key.product_name)
            .field("data_store_path", &self.inner.key.store_path)
            .field("invalidated", &self.inner.is_invalidated())
            .finish()
    }
}

impl PartialEq for Analytics {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Analytics {}

/// Returns the default engine, the earliest constructed one that is still alive.
pub fn get_instance() -> Option<Analytics> {
    engines().first().cloned()
}

/// Returns the engine for the product name and data store these settings resolve to,
/// constructing it on first use.
///
/// Construction opens (or creates) the store, resolves the client id and starts the dispatch
/// timeline. Later calls with the same key return the existing engine and ignore the rest of
/// `settings`. A data store belongs to at most one engine: asking for a store that is already
/// open under another product name fails with `InvalidArgument`.
pub fn get_instance_with(settings: AnalyticsSettings) -> AnalyticsResult<Analytics> {
    settings.validate()?;
    let key = EngineKey {
        product_name: settings.product_name().to_string(),
        store_path: settings.store_path()?,
    };

    let mut engines = engines();
    if let Some(existing) = engines
        .iter()
        .find(|engine| engine.inner.key.store_path == key.store_path)
    {
        if existing.inner.key != key {
            return Err(invalid_argument(format!(
                "data store '{}' is already open for product '{}'",
                key.store_path.display(),
                existing.inner.key.product_name
            )));
        }
        return Ok(existing.clone());
    }
    let engine = Analytics::construct(key, &settings)?;
    engines.push(engine.clone());
    Ok(engine)
}

/// Invalidates every live engine. The next [`get_instance_with`] constructs afresh.
pub fn invalidate_instance() {
    let drained: Vec<Analytics> = engines().drain(..).collect();
    for engine in drained {
        engine.inner.teardown();
    }
}

impl Analytics {
    fn construct(key: EngineKey, settings: &AnalyticsSettings) -> AnalyticsResult<Self> {
        let queue = Arc::new(DurableQueue::open(&key.store_path)?);
        let client_id = match settings.custom_client_id() {
            Some(custom) => custom.to_string(),
            None => queue.ensure_client_id(generate_client_id)?,
        };
        let transport: Arc<dyn HitTransport> = match settings.transport() {
            Some(transport) => transport,
            None => Arc::new(MeasurementProtocolTransport::new(
                MeasurementProtocolConfig::new(),
            )?),
        };
        let policy = Arc::new(EnginePolicy::from_settings(settings));
        let debug = Arc::new(DebugSink::new(settings.debug(), settings.logger()));
        let scheduler = DispatchScheduler::start(DispatchContext {
            queue: Arc::clone(&queue),
            transport,
            policy: Arc::clone(&policy),
            debug: Arc::clone(&debug),
        })?;

        debug_print!(
            debug,
            "opened data store '{}' for '{}' with {} pending hits",
            key.store_path.display(),
            key.product_name,
            queue.count()
        );
        let mode = DispatchMode::from_interval(policy.dispatch_interval());
        if mode == DispatchMode::OnEnqueue && queue.count() > 0 {
            scheduler.request_flush();
        }

        Ok(Self {
            inner: Arc::new(AnalyticsInner {
                key,
                product_version: settings.product_version().to_string(),
                client_id,
                queue,
                registry: TrackerRegistry::new(),
                policy,
                debug,
                scheduler,
                invalidated: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the tracker registered under `tracker_id`, creating it with the engine's client
    /// id if needed.
    pub fn create_tracker(&self, tracker_id: &str) -> AnalyticsResult<Tracker> {
        self.create_tracker_inner(tracker_id, None)
    }

    /// Like [`Analytics::create_tracker`], but a newly created tracker reports `client_id`. An
    /// already registered tracker is returned unchanged.
    pub fn create_tracker_with_client_id(
        &self,
        tracker_id: &str,
        client_id: &str,
    ) -> AnalyticsResult<Tracker> {
        if client_id.trim().is_empty() {
            return Err(invalid_argument("client id must not be empty"));
        }
        self.create_tracker_inner(tracker_id, Some(client_id))
    }

    fn create_tracker_inner(
        &self,
        tracker_id: &str,
        client_id: Option<&str>,
    ) -> AnalyticsResult<Tracker> {
        if tracker_id.trim().is_empty() {
            return Err(invalid_argument("tracker id must not be empty"));
        }
        self.inner.ensure_live()?;
        let client_id = client_id.unwrap_or(&self.inner.client_id);
        let tracker = self.inner.registry.get_or_create(tracker_id, |handle| {
            Tracker::new(handle, tracker_id, client_id, Arc::downgrade(&self.inner))
        });
        debug_print!(
            self.inner.debug,
            "tracker '{tracker_id}' ready (handle {})",
            tracker.handle()
        );
        Ok(tracker)
    }

    pub fn tracker(&self, tracker_id: &str) -> Option<Tracker> {
        self.inner.registry.get(tracker_id)
    }

    pub fn tracker_ids(&self) -> Vec<String> {
        self.inner.registry.ids()
    }

    /// Detaches and unregisters the tracker. Returns whether a tracker was registered.
    pub fn remove_tracker(&self, tracker_id: &str) -> bool {
        let removed = self.inner.registry.remove(tracker_id).is_some();
        if removed {
            debug_print!(self.inner.debug, "removed tracker '{tracker_id}'");
        }
        removed
    }

    /// Makes `tracker` the default tracker. Returns `false`, leaving the current default in
    /// place, unless `tracker` was issued by this engine and is still registered.
    pub fn set_default_tracker(&self, tracker: &Tracker) -> bool {
        match self.inner.registry.set_default(tracker) {
            Ok(()) => true,
            Err(err) => {
                debug_print!(self.inner.debug, "rejected default tracker: {err}");
                false
            }
        }
    }

    pub fn default_tracker(&self) -> Option<Tracker> {
        self.inner.registry.default_tracker()
    }

    pub fn set_debug(&self, debug: bool) {
        self.inner.debug.set_enabled(debug);
    }

    pub fn debug(&self) -> bool {
        self.inner.debug.is_enabled()
    }

    /// While opted out, hits are discarded at `track` and dispatch cycles are skipped. Hits
    /// already queued stay queued.
    pub fn set_opt_out(&self, opt_out: bool) {
        self.inner.policy.set_opt_out(opt_out);
        debug_print!(self.inner.debug, "opt-out set to {opt_out}");
    }

    pub fn opt_out(&self) -> bool {
        self.inner.policy.opt_out()
    }

    /// Changes the dispatch interval and re-arms the timer from now.
    pub fn set_dispatch_interval(&self, seconds: f64) {
        self.inner.policy.set_dispatch_interval(seconds);
        self.inner.scheduler.reschedule();
        debug_print!(self.inner.debug, "dispatch interval set to {seconds}s");
    }

    pub fn dispatch_interval(&self) -> f64 {
        self.inner.policy.dispatch_interval()
    }

    pub fn product_name(&self) -> &str {
        self.inner.product_name()
    }

    pub fn product_version(&self) -> &str {
        self.inner.product_version()
    }

    pub fn data_store_path(&self) -> &Path {
        &self.inner.key.store_path
    }

    /// Client id used by trackers that have no override of their own.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn pending_hits(&self) -> usize {
        self.inner.queue.count()
    }

    /// Runs a dispatch cycle now and reports what it did.
    pub async fn dispatch(&self) -> AnalyticsResult<DispatchSummary> {
        self.inner.ensure_live()?;
        self.inner.scheduler.flush().await
    }

    /// Routes debug trace lines to `handler` instead of stdout.
    pub fn set_log_handler<F>(&self, handler: F)
    where
        F: Fn(&LogRecord) + Send + Sync + 'static,
    {
        self.inner.debug.set_handler(handler);
    }

    /// Stops dispatching, closes the store and releases this engine's key.
    pub fn invalidate(&self) {
        engines().retain(|engine| engine != self);
        self.inner.teardown();
    }

    pub fn is_invalidated(&self) -> bool {
        self.inner.is_invalidated()
    }
}

impl AnalyticsInner {
    pub(crate) fn product_name(&self) -> &str {
        &self.key.product_name
    }

    pub(crate) fn product_version(&self) -> &str {
        &self.product_version
    }

    pub(crate) fn opted_out(&self) -> bool {
        self.policy.opt_out()
    }

    pub(crate) fn debug(&self) -> &DebugSink {
        &self.debug
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> AnalyticsResult<()> {
        if self.is_invalidated() {
            return Err(invalid_reference(format!(
                "analytics engine for '{}' has been invalidated",
                self.key.product_name
            )));
        }
        Ok(())
    }

    /// Durably queues one encoded hit.
    pub(crate) fn enqueue(&self, tracker_id: &str, payload: Bytes) -> AnalyticsResult<()> {
        self.ensure_live()?;
        let size = payload.len();
        let sequence_id = self.queue.append(tracker_id, payload)?;
        debug_print!(
            self.debug,
            "queued hit #{sequence_id} for tracker '{tracker_id}' ({size} bytes)"
        );
        let mode = DispatchMode::from_interval(self.policy.dispatch_interval());
        if mode == DispatchMode::OnEnqueue {
            self.scheduler.request_flush();
        }
        Ok(())
    }

    fn teardown(&self) {
        if self.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.shutdown();
        self.registry.clear();
        let pending = self.queue.count();
        self.queue.close();
        debug_print!(
            self.debug,
            "invalidated engine for '{}', {pending} hits left in '{}'",
            self.key.product_name,
            self.key.store_path.display()
        );
    }
}

impl Drop for AnalyticsInner {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

/// Random RFC 4122 version 4 identifier.
fn generate_client_id() -> String {
    let mut bytes: [u8; 16] = rand::random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
