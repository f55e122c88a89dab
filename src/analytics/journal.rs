//! Append-only journal backing the durable hit queue.
//!
//! The file is a sequence of frames, each a little-endian `u32` byte length followed by one
//! JSON-encoded [`JournalEntry`]. Every mutation of the queue is exactly one frame, synced to
//! disk before the call returns. On open the journal is scanned from the start; the first frame
//! that runs past the end of the file or fails to decode marks the end of the valid prefix and
//! everything after it is truncated.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::analytics::error::{storage_unavailable, AnalyticsError, AnalyticsResult};
use crate::analytics::queue::HitRecord;

const FRAME_HEADER_BYTES: usize = 4;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum JournalEntry {
    Identity { client_id: String },
    Append(StoredHit),
    Ack { ids: Vec<u64> },
    Attempt { ids: Vec<u64> },
    /// Lowest sequence id the queue may hand out next. Written by compaction, which otherwise
    /// drops every trace of acked ids.
    Watermark { next_sequence: u64 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct StoredHit {
    sequence_id: u64,
    tracker_id: String,
    enqueued_at_ms: u64,
    attempt_count: u32,
    payload: String,
}

impl StoredHit {
    pub(crate) fn from_record(record: &HitRecord) -> Self {
        Self {
            sequence_id: record.sequence_id(),
            tracker_id: record.tracker_id().to_string(),
            enqueued_at_ms: system_time_to_millis(record.enqueued_at()),
            attempt_count: record.attempt_count(),
            payload: STANDARD.encode(record.payload()),
        }
    }

    pub(crate) fn into_record(self) -> AnalyticsResult<HitRecord> {
        let payload = STANDARD.decode(self.payload.as_bytes()).map_err(|err| {
            storage_unavailable(format!(
                "hit {} has an undecodable payload: {err}",
                self.sequence_id
            ))
        })?;
        Ok(HitRecord::restore(
            self.sequence_id,
            self.tracker_id,
            UNIX_EPOCH + Duration::from_millis(self.enqueued_at_ms),
            self.attempt_count,
            Bytes::from(payload),
        ))
    }
}

pub(crate) struct Journal {
    path: PathBuf,
    file: File,
    len: u64,
    frames: usize,
}

impl Journal {
    /// Opens (or creates) the journal and returns every entry of its valid prefix in write order.
    pub(crate) fn open(path: &Path) -> AnalyticsResult<(Self, Vec<JournalEntry>)> {
        ensure_parent_dir(path)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|err| io_failure("open", path, err))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|err| io_failure("read", path, err))?;

        let (entries, valid_len) = scan_valid_prefix(&bytes, path);
        let valid_len = valid_len as u64;
        if valid_len < bytes.len() as u64 {
            log::warn!(
                "discarding {} trailing bytes of torn journal '{}'",
                bytes.len() as u64 - valid_len,
                path.display()
            );
            file.set_len(valid_len)
                .and_then(|_| file.sync_data())
                .map_err(|err| io_failure("truncate", path, err))?;
        }
        file.seek(SeekFrom::Start(valid_len))
            .map_err(|err| io_failure("seek", path, err))?;

        let frames = entries.len();
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                len: valid_len,
                frames,
            },
            entries,
        ))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn frames(&self) -> usize {
        self.frames
    }

    /// Appends one frame and syncs it. A failed write is rolled back to the previous length so a
    /// partial frame never sits in front of later ones.
    pub(crate) fn write(&mut self, entry: &JournalEntry) -> AnalyticsResult<()> {
        let frame = encode_frame(entry)?;
        let result = self
            .file
            .write_all(&frame)
            .and_then(|_| self.file.sync_data());
        if let Err(err) = result {
            let _ = self.file.set_len(self.len);
            let _ = self.file.seek(SeekFrom::Start(self.len));
            return Err(io_failure("append to", &self.path, err));
        }
        self.len += frame.len() as u64;
        self.frames += 1;
        Ok(())
    }

    /// Replaces the journal with `entries` by writing a sibling file and renaming it into place.
    pub(crate) fn rewrite(&mut self, entries: &[JournalEntry]) -> AnalyticsResult<()> {
        let mut buffer = Vec::new();
        for entry in entries {
            buffer.extend_from_slice(&encode_frame(entry)?);
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|err| io_failure("create", &tmp_path, err))?;
        tmp.write_all(&buffer)
            .and_then(|_| tmp.sync_all())
            .map_err(|err| io_failure("write", &tmp_path, err))?;
        fs::rename(&tmp_path, &self.path).map_err(|err| io_failure("replace", &self.path, err))?;

        self.file = tmp;
        self.len = buffer.len() as u64;
        self.frames = entries.len();
        sync_parent_dir(&self.path)
    }
}

fn scan_valid_prefix(bytes: &[u8], path: &Path) -> (Vec<JournalEntry>, usize) {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset + FRAME_HEADER_BYTES <= bytes.len() {
        let header = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        let start = offset + FRAME_HEADER_BYTES;
        let end = start + u32::from_le_bytes(header) as usize;
        if end > bytes.len() {
            break;
        }
        match serde_json::from_slice::<JournalEntry>(&bytes[start..end]) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                log::warn!(
                    "undecodable frame at offset {offset} in '{}': {err}",
                    path.display()
                );
                break;
            }
        }
        offset = end;
    }
    (entries, offset)
}

fn encode_frame(entry: &JournalEntry) -> AnalyticsResult<Vec<u8>> {
    let body = serde_json::to_vec(entry)
        .map_err(|err| storage_unavailable(format!("failed to encode journal frame: {err}")))?;
    let len = u32::try_from(body.len())
        .map_err(|_| storage_unavailable("journal frame exceeds 4 GiB"))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn ensure_parent_dir(path: &Path) -> AnalyticsResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| {
                storage_unavailable(format!(
                    "failed to create data store directory '{}': {err}",
                    parent.display()
                ))
            })?;
        }
    }
    Ok(())
}

/// Makes a rename inside the data store directory durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> AnalyticsResult<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|err| io_failure("sync directory", parent, err))
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> AnalyticsResult<()> {
    Ok(())
}

fn io_failure(action: &str, path: &Path, err: std::io::Error) -> AnalyticsError {
    storage_unavailable(format!("failed to {action} '{}': {err}", path.display()))
}

fn system_time_to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
