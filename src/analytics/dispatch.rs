//! Background dispatch timeline.
//!
//! Each engine owns one [`DispatchScheduler`], which runs on its own named thread with a
//! single-threaded runtime. The public API talks to it only through [`Command`] messages; the
//! queue is the one piece of state both sides touch directly.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::analytics::constants::{DISPATCH_THREAD_NAME, MAX_BATCHES_PER_CYCLE};
use crate::analytics::debug::{debug_print, DebugSink};
use crate::analytics::error::{internal_error, AnalyticsResult};
use crate::analytics::queue::{DurableQueue, HitRecord};
use crate::analytics::settings::EnginePolicy;
use crate::analytics::transport::HitTransport;
use crate::platform::runtime::{sleep, spawn_timeline};
use crate::util::backoff::backoff_delay;

/// How the configured interval drives the timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DispatchMode {
    Periodic(Duration),
    OnEnqueue,
    Manual,
}

impl DispatchMode {
    pub(crate) fn from_interval(seconds: f64) -> Self {
        if seconds == 0.0 {
            return DispatchMode::OnEnqueue;
        }
        if seconds > 0.0 {
            if let Ok(interval) = Duration::try_from_secs_f64(seconds) {
                return DispatchMode::Periodic(interval);
            }
        }
        DispatchMode::Manual
    }
}

/// Outcome of one dispatch cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// The cycle did nothing because the user has opted out.
    pub skipped: bool,
    pub delivered: usize,
    /// Hits still queued once the cycle finished.
    pub retained: usize,
    /// Hits discarded after reaching the attempt ceiling.
    pub dropped: usize,
    /// A delivery attempt failed and the cycle stopped early.
    pub failed: bool,
}

enum Command {
    Reschedule,
    Flush(Option<oneshot::Sender<DispatchSummary>>),
    Shutdown,
}

/// Everything a cycle needs, shared with the engine that owns the scheduler.
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub(crate) queue: Arc<DurableQueue>,
    pub(crate) transport: Arc<dyn HitTransport>,
    pub(crate) policy: Arc<EnginePolicy>,
    pub(crate) debug: Arc<DebugSink>,
}

pub(crate) struct DispatchScheduler {
    commands: mpsc::UnboundedSender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchScheduler {
    pub(crate) fn start(context: DispatchContext) -> AnalyticsResult<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let thread = spawn_timeline(DISPATCH_THREAD_NAME, move || {
            run_timeline(context, receiver)
        })
        .map_err(|err| internal_error(format!("failed to start dispatch thread: {err}")))?;
        Ok(Self {
            commands,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Re-arms the timer from now using the current interval.
    pub(crate) fn reschedule(&self) {
        let _ = self.commands.send(Command::Reschedule);
    }

    /// Asks for a cycle without waiting for it.
    pub(crate) fn request_flush(&self) {
        let _ = self.commands.send(Command::Flush(None));
    }

    /// Runs a cycle as soon as the timeline is free and waits for its summary.
    pub(crate) async fn flush(&self) -> AnalyticsResult<DispatchSummary> {
        let (reply, summary) = oneshot::channel();
        self.commands
            .send(Command::Flush(Some(reply)))
            .map_err(|_| internal_error("dispatch scheduler has stopped"))?;
        summary
            .await
            .map_err(|_| internal_error("dispatch scheduler stopped before the cycle finished"))
    }

    /// Stops the timeline, waiting for an in-flight cycle to finish.
    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            log::error!("dispatch thread panicked before shutdown");
        }
    }
}

impl Drop for DispatchScheduler {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

async fn run_timeline(context: DispatchContext, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut failures: u32 = 0;
    let mut deadline = next_deadline(&context.policy, failures);
    log::debug!("dispatch timeline started");

    loop {
        let command = match deadline {
            Some(at) => {
                tokio::select! {
                    _ = sleep(at.saturating_duration_since(Instant::now())) => None,
                    command = commands.recv() => Some(command),
                }
            }
            None => Some(commands.recv().await),
        };

        match command {
            None => {
                let summary = run_cycle(&context).await;
                failures = next_failure_count(failures, &summary);
            }
            Some(Some(Command::Reschedule)) => {}
            // backing off: the armed retry picks up whatever was enqueued meanwhile
            Some(Some(Command::Flush(None))) if failures > 0 && deadline.is_some() => continue,
            Some(Some(Command::Flush(reply))) => {
                let summary = run_cycle(&context).await;
                failures = next_failure_count(failures, &summary);
                if let Some(reply) = reply {
                    let _ = reply.send(summary);
                }
            }
            Some(Some(Command::Shutdown)) | Some(None) => break,
        }
        deadline = next_deadline(&context.policy, failures);
    }
    log::debug!("dispatch timeline stopped");
}

fn next_failure_count(failures: u32, summary: &DispatchSummary) -> u32 {
    if summary.skipped {
        failures
    } else if summary.failed {
        failures.saturating_add(1)
    } else {
        0
    }
}

fn next_deadline(policy: &EnginePolicy, failures: u32) -> Option<Instant> {
    let backoff = backoff_delay(failures);
    let delay = match DispatchMode::from_interval(policy.dispatch_interval()) {
        DispatchMode::Periodic(interval) => interval.max(backoff),
        DispatchMode::OnEnqueue if failures > 0 => backoff,
        DispatchMode::OnEnqueue | DispatchMode::Manual => return None,
    };
    Instant::now().checked_add(delay)
}

/// Drains up to [`MAX_BATCHES_PER_CYCLE`] batches, stopping at the first delivery failure.
pub(crate) async fn run_cycle(context: &DispatchContext) -> DispatchSummary {
    let DispatchContext {
        queue,
        transport,
        policy,
        debug,
    } = context;
    let mut summary = DispatchSummary::default();

    if policy.opt_out() {
        summary.skipped = true;
        summary.retained = queue.count();
        debug_print!(
            **debug,
            "dispatch skipped: user opted out, {} hits retained",
            summary.retained
        );
        return summary;
    }

    for _ in 0..MAX_BATCHES_PER_CYCLE {
        let batch = match queue.peek_batch(policy.max_batch_size()) {
            Ok(batch) => batch,
            Err(err) => {
                log::warn!("failed to read hit queue: {err}");
                summary.failed = true;
                break;
            }
        };
        if batch.is_empty() {
            break;
        }

        let (expired, live): (Vec<HitRecord>, Vec<HitRecord>) = batch
            .into_iter()
            .partition(|record| is_expired(record, policy.max_attempts()));
        if !expired.is_empty() {
            let ids = sequence_ids(&expired);
            match queue.ack(&ids) {
                Ok(removed) => summary.dropped += removed,
                Err(err) => {
                    log::warn!("failed to drop expired hits: {err}");
                    summary.failed = true;
                    break;
                }
            }
            for record in &expired {
                debug_print!(
                    **debug,
                    "dropped hit #{} for tracker '{}' after {} failed attempts",
                    record.sequence_id(),
                    record.tracker_id(),
                    record.attempt_count()
                );
            }
        }
        if live.is_empty() {
            continue;
        }

        let ids = sequence_ids(&live);
        debug_print!(**debug, "dispatching batch of {} hits", live.len());
        match transport.send(&live).await {
            Ok(()) => match queue.ack(&ids) {
                Ok(acked) => {
                    summary.delivered += acked;
                    debug_print!(**debug, "acked hits {ids:?}");
                }
                Err(err) => {
                    log::warn!("delivered hits could not be acked: {err}");
                    summary.failed = true;
                    break;
                }
            },
            Err(err) => {
                debug_print!(
                    **debug,
                    "delivery of {} hits failed: {err}",
                    live.len()
                );
                if let Err(err) = queue.increment_attempts(&ids) {
                    log::warn!("failed to record delivery attempt: {err}");
                }
                summary.failed = true;
                break;
            }
        }
    }

    summary.retained = queue.count();
    summary
}

fn is_expired(record: &HitRecord, max_attempts: u32) -> bool {
    max_attempts > 0 && record.attempt_count() >= max_attempts
}

fn sequence_ids(records: &[HitRecord]) -> Vec<u64> {
    records.iter().map(HitRecord::sequence_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::settings::AnalyticsSettings;
    use crate::test_support::{temp_store_path, RecordingTransport};

    fn context(
        prefix: &str,
        settings: AnalyticsSettings,
    ) -> (DispatchContext, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let context = DispatchContext {
            queue: Arc::new(DurableQueue::open(temp_store_path(prefix)).unwrap()),
            transport: transport.clone(),
            policy: Arc::new(EnginePolicy::from_settings(&settings)),
            debug: Arc::new(DebugSink::new(false, None)),
        };
        (context, transport)
    }

    fn settings() -> AnalyticsSettings {
        AnalyticsSettings::new("dispatch-test", "1.0", "")
    }

    #[test]
    fn interval_maps_to_mode() {
        assert_eq!(
            DispatchMode::from_interval(20.0),
            DispatchMode::Periodic(Duration::from_secs(20))
        );
        assert_eq!(DispatchMode::from_interval(0.0), DispatchMode::OnEnqueue);
        assert_eq!(DispatchMode::from_interval(-1.0), DispatchMode::Manual);
        assert_eq!(DispatchMode::from_interval(f64::NAN), DispatchMode::Manual);
        assert_eq!(DispatchMode::from_interval(f64::INFINITY), DispatchMode::Manual);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn successful_cycle_acks_in_batches() {
        let (context, transport) = context("dispatch-ok", settings().with_max_batch_size(2));
        for n in 0..5 {
            context.queue.append("UA-1", format!("n={n}")).unwrap();
        }

        let summary = run_cycle(&context).await;
        assert_eq!(summary.delivered, 5);
        assert_eq!(summary.retained, 0);
        assert!(!summary.failed);
        assert_eq!(transport.sent_ids(), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_cycle_retains_and_counts_attempts() {
        let (context, transport) = context("dispatch-fail", settings());
        context.queue.append("UA-1", "n=0").unwrap();
        transport.set_failing(true);

        let summary = run_cycle(&context).await;
        assert!(summary.failed);
        assert_eq!(summary.delivered, 0);
        assert_eq!(summary.retained, 1);
        assert_eq!(context.queue.peek_batch(1).unwrap()[0].attempt_count(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn records_at_attempt_ceiling_are_dropped() {
        let (context, transport) = context("dispatch-expire", settings().with_max_attempts(2));
        let stale = context.queue.append("UA-1", "stale").unwrap();
        context.queue.increment_attempts(&[stale]).unwrap();
        context.queue.increment_attempts(&[stale]).unwrap();
        let fresh = context.queue.append("UA-1", "fresh").unwrap();

        let summary = run_cycle(&context).await;
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(transport.sent_ids(), vec![vec![fresh]]);
        assert_eq!(context.queue.count(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn opted_out_cycle_is_skipped() {
        let (context, transport) = context("dispatch-optout", settings().with_opt_out(true));
        context.queue.append("UA-1", "n=0").unwrap();

        let summary = run_cycle(&context).await;
        assert!(summary.skipped);
        assert_eq!(summary.retained, 1);
        assert!(transport.sent_ids().is_empty());
    }

    #[test]
    fn backoff_extends_periodic_delay() {
        let policy = EnginePolicy::from_settings(&settings().with_dispatch_interval(1.0));
        let start = Instant::now();
        let relaxed = next_deadline(&policy, 0).unwrap();
        assert!(relaxed >= start + Duration::from_secs(1));
        let backed_off = next_deadline(&policy, 4).unwrap();
        assert!(backed_off >= start + Duration::from_secs(20));

        policy.set_dispatch_interval(-1.0);
        assert!(next_deadline(&policy, 4).is_none());
        policy.set_dispatch_interval(0.0);
        assert!(next_deadline(&policy, 0).is_none());
        assert!(next_deadline(&policy, 1).is_some());
    }

    #[test]
    fn scheduler_flushes_on_request_and_shuts_down() {
        let (context, transport) =
            context("dispatch-scheduler", settings().with_dispatch_interval(-1.0));
        let queue = Arc::clone(&context.queue);
        queue.append("UA-1", "n=0").unwrap();

        let scheduler = DispatchScheduler::start(context).unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let summary = runtime.block_on(scheduler.flush()).unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(transport.sent_ids(), vec![vec![1]]);

        scheduler.shutdown();
        assert!(runtime.block_on(scheduler.flush()).is_err());
    }

    #[test]
    fn enqueue_requests_wait_out_backoff() {
        let (context, transport) = context(
            "dispatch-enqueue-backoff",
            settings().with_dispatch_interval(0.0).with_max_attempts(2),
        );
        transport.set_failing(true);
        let queue = Arc::clone(&context.queue);
        let scheduler = DispatchScheduler::start(context).unwrap();

        let first = queue.append("UA-1", "n=0").unwrap();
        scheduler.request_flush();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while queue.peek_batch(1).unwrap()[0].attempt_count() == 0
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }

        for n in 1..3 {
            queue.append("UA-1", format!("n={n}")).unwrap();
            scheduler.request_flush();
        }
        thread::sleep(Duration::from_millis(200));
        scheduler.shutdown();

        let pending = queue.peek_batch(10).unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].sequence_id(), first);
        assert_eq!(pending[0].attempt_count(), 1);
        assert_eq!(transport.sent_ids(), Vec::<Vec<u64>>::new());
    }

    #[test]
    fn periodic_timer_delivers_without_requests() {
        let (context, transport) =
            context("dispatch-periodic", settings().with_dispatch_interval(0.05));
        let queue = Arc::clone(&context.queue);
        queue.append("UA-1", "n=0").unwrap();

        let scheduler = DispatchScheduler::start(context).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while queue.count() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        scheduler.shutdown();
        assert_eq!(queue.count(), 0);
        assert_eq!(transport.sent_ids(), vec![vec![1]]);
    }
}
