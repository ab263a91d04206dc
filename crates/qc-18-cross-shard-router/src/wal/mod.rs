//! # Write-Ahead Log
//!
//! One append-only log per route (`shard-<id>.wal`) plus a compaction marker
//! (`shard-<id>.commit`).
//!
//! - `append` writes a sealed batch before it is handed to transport.
//! - `mark_committed` appends a commit record once the batch is acknowledged
//!   or dead-lettered. It is idempotent and is the only operation that moves
//!   the compaction floor (every sequence below the floor is committed).
//! - `replay` yields every batch still in the log in ascending sequence
//!   order with its committed flag.
//!
//! A record that fails validation on replay, and everything after it, is
//! moved to `shard-<id>.wal.quarantine-<unix_ms>` and the log is truncated at
//! that record. Nothing is dropped without a copy on disk.
//!
//! The log is single-writer: the inner mutex serialises appends and the
//! route's dispatch permit guarantees sequence numbers arrive in order.

pub mod marker;
pub mod record;

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::WalSyncMode;
use crate::domain::{Batch, ShardId};
use crate::error::WalError;
use record::{Decoded, WalEntry};

/// Dead records tolerated before `mark_committed` rewrites the log.
pub const COMPACTION_THRESHOLD: usize = 1024;

/// Batch recovered from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedBatch {
    /// The batch as written.
    pub batch: Batch,
    /// Whether a commit was recorded for it.
    pub committed: bool,
}

/// Bytes moved aside during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineReport {
    /// Side file holding the bytes.
    pub path: PathBuf,
    /// Offset in the log where the bad record started.
    pub offset: u64,
    /// Bytes moved.
    pub bytes: u64,
    /// Why the record was rejected.
    pub reason: String,
}

/// Result of scanning a log.
#[derive(Debug, Clone, Default)]
pub struct WalReplay {
    /// Batches in ascending sequence order.
    pub entries: Vec<ReplayedBatch>,
    /// Set when a corrupt or torn tail was quarantined.
    pub quarantine: Option<QuarantineReport>,
    /// Compaction floor after the scan.
    pub floor: u64,
}

impl WalReplay {
    /// Batches not yet committed, in order.
    pub fn uncommitted(&self) -> impl Iterator<Item = &Batch> {
        self.entries.iter().filter(|e| !e.committed).map(|e| &e.batch)
    }
}

struct WalInner {
    file: File,
    len: u64,
    floor: u64,
    last_seq: Option<u64>,
    // Lowest sequence never handed out, including records compacted away
    high_water: u64,
    pending: BTreeSet<u64>,
    file_records: usize,
    dirty: bool,
    last_quarantine: Option<QuarantineReport>,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl WalInner {
    fn next_seq(&self) -> u64 {
        self.last_seq
            .map(|s| s + 1)
            .unwrap_or(0)
            .max(self.floor)
            .max(self.high_water)
    }
}

/// Per-route write-ahead log.
pub struct WriteAheadLog {
    partition: ShardId,
    path: PathBuf,
    marker_path: PathBuf,
    sync_mode: WalSyncMode,
    compaction_threshold: usize,
    inner: Mutex<WalInner>,
}

impl WriteAheadLog {
    /// Log file name for a partition.
    pub fn file_name(partition: ShardId) -> String {
        format!("shard-{}.wal", partition)
    }

    /// Partition id from a log file name.
    pub fn parse_file_name(name: &str) -> Option<ShardId> {
        name.strip_prefix("shard-")?.strip_suffix(".wal")?.parse().ok()
    }

    /// Open (or create) the log for `partition` under `dir` and load its state.
    ///
    /// A corrupt tail is quarantined here; the report is returned by the next
    /// `replay`.
    pub fn open(dir: &Path, partition: ShardId, sync_mode: WalSyncMode) -> Result<Self, WalError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(partition));
        let marker_path = dir.join(format!("shard-{}.commit", partition));
        let saved = marker::read(&marker_path)?.unwrap_or_default();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let wal = Self {
            partition,
            path,
            marker_path,
            sync_mode,
            compaction_threshold: COMPACTION_THRESHOLD,
            inner: Mutex::new(WalInner {
                file,
                len: 0,
                floor: saved.floor,
                last_seq: None,
                high_water: saved.next_seq,
                pending: BTreeSet::new(),
                file_records: 0,
                dirty: false,
                last_quarantine: None,
                #[cfg(test)]
                fail_next_sync: false,
            }),
        };

        {
            let mut inner = wal.inner.lock();
            let replay = wal.scan_locked(&mut inner)?;
            inner.last_quarantine = replay.quarantine;
            debug!(
                partition,
                floor = inner.floor,
                pending = inner.pending.len(),
                "[qc-18] WAL opened"
            );
        }
        Ok(wal)
    }

    /// Override the compaction threshold.
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold.max(1);
        self
    }

    /// Append a sealed batch; returns the record's byte offset.
    pub fn append(&self, batch: &Batch) -> Result<u64, WalError> {
        let bytes = record::encode_batch(batch)?;
        let mut inner = self.inner.lock();

        let next = inner.next_seq();
        if batch.seq() < next {
            return Err(WalError::OutOfOrder {
                last: next.saturating_sub(1),
                got: batch.seq(),
            });
        }

        // A failed append still burns its sequence
        inner.high_water = inner.high_water.max(batch.seq() + 1);
        let offset = self.write_locked(&mut inner, &bytes)?;
        inner.last_seq = Some(batch.seq());
        inner.pending.insert(batch.seq());
        Ok(offset)
    }

    /// Record that `seq` was delivered or dead-lettered.
    ///
    /// Returns `false` if it was already committed (or never appended).
    pub fn mark_committed(&self, seq: u64) -> Result<bool, WalError> {
        let mut inner = self.inner.lock();
        if !inner.pending.contains(&seq) {
            return Ok(false);
        }

        let bytes = record::encode_commit(seq)?;
        self.write_locked(&mut inner, &bytes)?;
        inner.pending.remove(&seq);

        let next = inner.next_seq();
        let floor = inner.pending.first().copied().unwrap_or(next);
        if floor > inner.floor {
            inner.floor = floor;
            let dead = inner.file_records.saturating_sub(inner.pending.len());
            if dead >= self.compaction_threshold {
                self.compact_locked(&mut inner)?;
            }
        }
        Ok(true)
    }

    /// fsync outstanding writes (group-commit tick, shutdown).
    pub fn sync(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        if inner.dirty {
            inner.file.sync_data()?;
            inner.dirty = false;
        }
        Ok(())
    }

    /// Re-read the log from disk.
    pub fn replay(&self) -> Result<WalReplay, WalError> {
        let mut inner = self.inner.lock();
        let mut replay = self.scan_locked(&mut inner)?;
        if replay.quarantine.is_none() {
            replay.quarantine = inner.last_quarantine.take();
        }
        Ok(replay)
    }

    /// Rewrite the log without records below the floor.
    pub fn compact(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        self.compact_locked(&mut inner)
    }

    /// Partition (route) this log belongs to.
    pub fn partition(&self) -> ShardId {
        self.partition
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current compaction floor.
    pub fn floor(&self) -> u64 {
        self.inner.lock().floor
    }

    /// Sequence the next appended batch must use at minimum.
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq()
    }

    /// Appended batches not yet committed.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Bytes in the log file.
    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().len
    }

    /// Write one record. On any failure, including the per-batch fsync, the
    /// file is cut back to its previous length so the record is never
    /// replayed.
    fn write_locked(&self, inner: &mut WalInner, bytes: &[u8]) -> Result<u64, WalError> {
        let offset = inner.len;
        let per_batch = matches!(self.sync_mode, WalSyncMode::PerBatch);

        let mut result = inner.file.write_all(bytes);
        if result.is_ok() && per_batch {
            result = Self::sync_file(inner);
        }
        if let Err(e) = result {
            if let Err(rollback) = inner.file.set_len(offset) {
                error!(
                    partition = self.partition,
                    offset,
                    error = %rollback,
                    "[qc-18] WAL rollback failed"
                );
            }
            return Err(e.into());
        }

        inner.len += bytes.len() as u64;
        inner.file_records += 1;
        if !per_batch {
            inner.dirty = true;
        }
        Ok(offset)
    }

    fn sync_file(inner: &mut WalInner) -> std::io::Result<()> {
        #[cfg(test)]
        let injected = std::mem::take(&mut inner.fail_next_sync);
        #[cfg(not(test))]
        let injected = false;
        if injected {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected fsync failure",
            ));
        }
        inner.file.sync_data()
    }

    fn scan_locked(&self, inner: &mut WalInner) -> Result<WalReplay, WalError> {
        if inner.dirty {
            inner.file.sync_data()?;
            inner.dirty = false;
        }
        let buf = fs::read(&self.path)?;

        let mut offset = 0usize;
        let mut batches: BTreeMap<u64, Batch> = BTreeMap::new();
        let mut commits: BTreeSet<u64> = BTreeSet::new();
        let mut last_seq: Option<u64> = None;
        let mut records = 0usize;
        let mut bad: Option<String> = None;

        while offset < buf.len() {
            match record::decode(&buf[offset..]) {
                Decoded::Record { seq, entry, len } => {
                    match entry {
                        WalEntry::Batch(batch) => {
                            if last_seq.is_some_and(|last| seq <= last) {
                                bad = Some(format!("sequence regression at {}", seq));
                                break;
                            }
                            last_seq = Some(seq);
                            batches.insert(seq, batch);
                        }
                        WalEntry::Commit { seq } => {
                            commits.insert(seq);
                        }
                    }
                    records += 1;
                    offset += len;
                }
                Decoded::Truncated => {
                    bad = Some("torn record at end of log".to_string());
                    break;
                }
                Decoded::Corrupt(reason) => {
                    bad = Some(reason);
                    break;
                }
            }
        }

        let quarantine = match bad {
            Some(reason) => Some(self.quarantine_tail(&buf, offset, reason)?),
            None => None,
        };

        let floor = inner.floor;
        let pending: BTreeSet<u64> = batches
            .keys()
            .copied()
            .filter(|seq| *seq >= floor && !commits.contains(seq))
            .collect();
        let entries = batches
            .into_values()
            .map(|batch| {
                let committed = batch.seq() < floor || !pending.contains(&batch.seq());
                ReplayedBatch { batch, committed }
            })
            .collect();

        inner.len = offset as u64;
        inner.last_seq = last_seq;
        inner.pending = pending;
        inner.file_records = records;
        let next = inner.next_seq();
        inner.floor = inner.pending.first().copied().unwrap_or(next).max(floor);

        Ok(WalReplay {
            entries,
            quarantine,
            floor: inner.floor,
        })
    }

    fn quarantine_tail(
        &self,
        buf: &[u8],
        offset: usize,
        reason: String,
    ) -> Result<QuarantineReport, WalError> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let side_path = self
            .path
            .with_file_name(format!("{}.quarantine-{}", Self::file_name(self.partition), stamp));

        let tail = &buf[offset..];
        let mut side = File::create(&side_path)?;
        side.write_all(tail)?;
        side.sync_all()?;

        let main = OpenOptions::new().write(true).open(&self.path)?;
        main.set_len(offset as u64)?;
        main.sync_all()?;

        error!(
            partition = self.partition,
            offset,
            bytes = tail.len(),
            quarantine = %side_path.display(),
            reason = %reason,
            "[qc-18] WAL corruption: tail quarantined"
        );

        Ok(QuarantineReport {
            path: side_path,
            offset: offset as u64,
            bytes: tail.len() as u64,
            reason,
        })
    }

    fn compact_locked(&self, inner: &mut WalInner) -> Result<(), WalError> {
        if inner.dirty {
            inner.file.sync_data()?;
            inner.dirty = false;
        }
        marker::write(
            &self.marker_path,
            marker::Marker {
                floor: inner.floor,
                next_seq: inner.next_seq(),
            },
        )?;

        let buf = fs::read(&self.path)?;
        let mut kept = Vec::new();
        let mut kept_records = 0usize;
        let mut offset = 0usize;
        while offset < buf.len() {
            match record::decode(&buf[offset..]) {
                Decoded::Record {
                    entry: WalEntry::Batch(batch),
                    len,
                    ..
                } => {
                    if inner.pending.contains(&batch.seq()) {
                        kept.extend_from_slice(&buf[offset..offset + len]);
                        kept_records += 1;
                    }
                    offset += len;
                }
                Decoded::Record { len, .. } => offset += len,
                Decoded::Truncated | Decoded::Corrupt(_) => {
                    return Err(WalError::Corruption {
                        path: self.path.clone(),
                        offset: offset as u64,
                        reason: "unreadable record during compaction".to_string(),
                    });
                }
            }
        }

        let temp_path = self.path.with_extension("wal.tmp");
        let mut temp = File::create(&temp_path)?;
        temp.write_all(&kept)?;
        temp.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        inner.file = OpenOptions::new().append(true).open(&self.path)?;
        let before = inner.len;
        inner.len = kept.len() as u64;
        inner.file_records = kept_records;

        info!(
            partition = self.partition,
            floor = inner.floor,
            bytes_before = before,
            bytes_after = inner.len,
            "[qc-18] WAL compacted"
        );
        Ok(())
    }
}
