use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::analytics::error::{storage_unavailable, AnalyticsError, AnalyticsResult};
use crate::analytics::journal::{Journal, JournalEntry, StoredHit};

/// Journals shorter than this are never compacted.
const COMPACTION_MIN_FRAMES: usize = 256;

/// One queued measurement hit. Everything but the attempt count is fixed at enqueue time, and
/// the attempt count is only ever changed by the queue that owns the record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HitRecord {
    sequence_id: u64,
    tracker_id: String,
    enqueued_at: SystemTime,
    attempt_count: u32,
    payload: Bytes,
}

impl HitRecord {
    pub(crate) fn restore(
        sequence_id: u64,
        tracker_id: String,
        enqueued_at: SystemTime,
        attempt_count: u32,
        payload: Bytes,
    ) -> Self {
        Self {
            sequence_id,
            tracker_id,
            enqueued_at,
            attempt_count,
            payload,
        }
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn tracker_id(&self) -> &str {
        &self.tracker_id
    }

    pub fn enqueued_at(&self) -> SystemTime {
        self.enqueued_at
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Time the record has spent in the queue as of `now`.
    pub fn queue_time(&self, now: SystemTime) -> Duration {
        now.duration_since(self.enqueued_at).unwrap_or_default()
    }
}

/// Crash-surviving FIFO of [`HitRecord`]s persisted in a single journal file.
///
/// All operations serialize through one lock, so concurrent appenders receive strictly
/// increasing sequence ids and the dispatcher's peek/ack never observes a torn append.
pub struct DurableQueue {
    path: PathBuf,
    state: Mutex<QueueState>,
}

struct QueueState {
    journal: Option<Journal>,
    records: BTreeMap<u64, HitRecord>,
    next_sequence: u64,
    client_id: Option<String>,
}

impl fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("DurableQueue")
            .field("path", &self.path)
            .field("pending", &state.records.len())
            .field("closed", &state.journal.is_none())
            .finish()
    }
}

impl DurableQueue {
    /// Opens the queue stored at `path`, replaying any pending records left by a previous run.
    pub fn open(path: impl Into<PathBuf>) -> AnalyticsResult<Self> {
        let path = path.into();
        let (journal, entries) = Journal::open(&path)?;

        let mut state = QueueState {
            journal: Some(journal),
            records: BTreeMap::new(),
            next_sequence: 1,
            client_id: None,
        };
        for entry in entries {
            state.replay(entry);
        }
        state.maybe_compact();

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably appends a hit and returns its sequence id.
    pub fn append(&self, tracker_id: &str, payload: impl Into<Bytes>) -> AnalyticsResult<u64> {
        let mut state = self.lock();
        let sequence_id = state.next_sequence;
        let record = HitRecord {
            sequence_id,
            tracker_id: tracker_id.to_string(),
            enqueued_at: now_millis_precision(),
            attempt_count: 0,
            payload: payload.into(),
        };
        state
            .journal_mut()?
            .write(&JournalEntry::Append(StoredHit::from_record(&record)))?;
        state.next_sequence += 1;
        state.records.insert(sequence_id, record);
        Ok(sequence_id)
    }

    /// Returns up to `max` of the oldest pending records. The result does not change between
    /// calls unless records are acked or appended.
    pub fn peek_batch(&self, max: usize) -> AnalyticsResult<Vec<HitRecord>> {
        let state = self.lock();
        state.ensure_open()?;
        Ok(state.records.values().take(max).cloned().collect())
    }

    /// Removes the given records and returns how many were still pending.
    pub fn ack(&self, sequence_ids: &[u64]) -> AnalyticsResult<usize> {
        let mut state = self.lock();
        let ids = state.pending_subset(sequence_ids)?;
        if ids.is_empty() {
            return Ok(0);
        }
        state
            .journal_mut()?
            .write(&JournalEntry::Ack { ids: ids.clone() })?;
        for id in &ids {
            state.records.remove(id);
        }
        state.maybe_compact();
        Ok(ids.len())
    }

    pub fn increment_attempts(&self, sequence_ids: &[u64]) -> AnalyticsResult<()> {
        let mut state = self.lock();
        let ids = state.pending_subset(sequence_ids)?;
        if ids.is_empty() {
            return Ok(());
        }
        state
            .journal_mut()?
            .write(&JournalEntry::Attempt { ids: ids.clone() })?;
        for id in &ids {
            if let Some(record) = state.records.get_mut(id) {
                record.attempt_count = record.attempt_count.saturating_add(1);
            }
        }
        state.maybe_compact();
        Ok(())
    }

    /// Number of pending records; zero once the queue is closed.
    pub fn count(&self) -> usize {
        self.lock().records.len()
    }

    /// The client identity persisted alongside the queue, if any.
    pub fn client_id(&self) -> Option<String> {
        self.lock().client_id.clone()
    }

    /// Returns the persisted client identity, generating and persisting one first if the store
    /// has none yet.
    pub fn ensure_client_id<F>(&self, generate: F) -> AnalyticsResult<String>
    where
        F: FnOnce() -> String,
    {
        let mut state = self.lock();
        if let Some(existing) = state.client_id.clone() {
            state.ensure_open()?;
            return Ok(existing);
        }
        let client_id = generate();
        state.journal_mut()?.write(&JournalEntry::Identity {
            client_id: client_id.clone(),
        })?;
        state.client_id = Some(client_id.clone());
        Ok(client_id)
    }

    /// Releases the file handle. Every later operation fails with `StorageUnavailable`.
    pub fn close(&self) {
        let mut state = self.lock();
        state.journal = None;
        state.records.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().journal.is_none()
    }

    #[cfg(test)]
    pub(crate) fn journal_frames(&self) -> usize {
        self.lock()
            .journal
            .as_ref()
            .map(Journal::frames)
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl QueueState {
    fn replay(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Identity { client_id } => {
                self.client_id = Some(client_id);
            }
            JournalEntry::Append(stored) => match stored.into_record() {
                Ok(record) => {
                    self.next_sequence = self.next_sequence.max(record.sequence_id + 1);
                    self.records.insert(record.sequence_id, record);
                }
                Err(err) => log::warn!("skipping unreadable queued hit: {err}"),
            },
            JournalEntry::Ack { ids } => {
                for id in ids {
                    self.records.remove(&id);
                }
            }
            JournalEntry::Attempt { ids } => {
                for id in ids {
                    if let Some(record) = self.records.get_mut(&id) {
                        record.attempt_count = record.attempt_count.saturating_add(1);
                    }
                }
            }
            JournalEntry::Watermark { next_sequence } => {
                self.next_sequence = self.next_sequence.max(next_sequence);
            }
        }
    }

    fn ensure_open(&self) -> AnalyticsResult<()> {
        if self.journal.is_none() {
            return Err(closed_error());
        }
        Ok(())
    }

    fn journal_mut(&mut self) -> AnalyticsResult<&mut Journal> {
        self.journal.as_mut().ok_or_else(closed_error)
    }

    fn pending_subset(&self, sequence_ids: &[u64]) -> AnalyticsResult<Vec<u64>> {
        self.ensure_open()?;
        let mut ids: Vec<u64> = sequence_ids
            .iter()
            .copied()
            .filter(|id| self.records.contains_key(id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn maybe_compact(&mut self) {
        let live = self.records.len();
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        let frames = journal.frames();
        if frames < COMPACTION_MIN_FRAMES || frames <= live.saturating_mul(2) + 1 {
            return;
        }

        let mut snapshot = Vec::with_capacity(live + 2);
        if let Some(client_id) = &self.client_id {
            snapshot.push(JournalEntry::Identity {
                client_id: client_id.clone(),
            });
        }
        snapshot.push(JournalEntry::Watermark {
            next_sequence: self.next_sequence,
        });
        snapshot.extend(
            self.records
                .values()
                .map(|record| JournalEntry::Append(StoredHit::from_record(record))),
        );
        if let Err(err) = journal.rewrite(&snapshot) {
            log::warn!(
                "failed to compact hit journal '{}': {err}",
                journal.path().display()
            );
        }
    }
}

fn closed_error() -> AnalyticsError {
    storage_unavailable("hit queue has been closed")
}

/// Journal timestamps are stored in milliseconds; truncating here keeps a record equal to its
/// replayed copy.
fn now_millis_precision() -> SystemTime {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0);
    UNIX_EPOCH + Duration::from_millis(millis)
}
