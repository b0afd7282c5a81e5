//! Write-ahead log of applied write batches.
//!
//! The log is a directory of numbered segments (`00000001.wal`, ...). Each
//! segment starts with a file header followed by framed records, one per
//! batch:
//!
//! ```text
//! +-----------+----------------------+-----------+
//! |length:u32 | bincode(WalBatch)    |crc32:u32  |
//! +-----------+----------------------+-----------+
//! ```
//!
//! Every logged operation carries the stores it was applied to. The log
//! keeps the union of those targets per segment so that a closed segment
//! can be deleted once all of its targets are durable elsewhere.

use super::rowset::MutationTarget;
use crate::encoding::bincode;
use crate::encoding::frame::{self, FileHeader, RecordReader, WAL_MAGIC};
use crate::error::Result;
use crate::mvcc::Timestamp;
use crate::schema::{Row, RowChange};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LoggedChange {
    Insert(Row),
    Mutate(RowChange),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedOp {
    pub key: Vec<u8>,
    pub change: LoggedChange,
    pub targets: Vec<MutationTarget>,
}

/// The successfully applied operations of one write batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalBatch {
    pub ts: Timestamp,
    pub ops: Vec<LoggedOp>,
}

#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    pub buffer_size: usize,
    pub segment_size: u64,
}

struct ActiveSegment {
    id: u64,
    writer: BufWriter<File>,
    size: u64,
    targets: BTreeSet<MutationTarget>,
}

struct ClosedSegment {
    id: u64,
    targets: BTreeSet<MutationTarget>,
}

struct LogInner {
    active: ActiveSegment,
    closed: Vec<ClosedSegment>,
}

pub struct Log {
    dir: PathBuf,
    options: LogOptions,
    inner: Mutex<LogInner>,
    #[cfg(test)]
    fail_sync: AtomicBool,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("dir", &self.dir)
            .field("options", &self.options)
            .finish()
    }
}

impl Log {
    pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("{:08}.wal", id))
    }

    /// Start a fresh log in `dir`, which must not hold segments yet.
    pub fn create(dir: &Path, options: LogOptions) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let active = Self::open_segment(dir, 1, options.buffer_size)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            options,
            inner: Mutex::new(LogInner {
                active,
                closed: Vec::new(),
            }),
            #[cfg(test)]
            fail_sync: AtomicBool::new(false),
        })
    }

    fn open_segment(dir: &Path, id: u64, buffer_size: usize) -> Result<ActiveSegment> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(Self::segment_path(dir, id))?;
        let mut writer = BufWriter::with_capacity(buffer_size, file);
        FileHeader::new(WAL_MAGIC).write_to(&mut writer)?;
        Ok(ActiveSegment {
            id,
            writer,
            size: frame::HEADER_SIZE as u64,
            targets: BTreeSet::new(),
        })
    }

    fn roll_locked(&self, inner: &mut LogInner) -> Result<()> {
        inner.active.writer.flush()?;
        inner.active.writer.get_ref().sync_all()?;

        let next = Self::open_segment(&self.dir, inner.active.id + 1, self.options.buffer_size)?;
        let old = std::mem::replace(&mut inner.active, next);
        tracing::debug!(
            segment = old.id,
            bytes = old.size,
            "Rolled WAL segment"
        );
        inner.closed.push(ClosedSegment {
            id: old.id,
            targets: old.targets,
        });
        Ok(())
    }

    /// Start a new segment if the active one has reached the size
    /// threshold. Appenders call this before taking any tablet lock so the
    /// roll's sync never runs under one.
    pub fn roll_if_full(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let has_records = inner.active.size > frame::HEADER_SIZE as u64;
        if has_records && inner.active.size >= self.options.segment_size {
            self.roll_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Append a batch to the active segment. Not durable until [`Log::sync`].
    pub fn append(&self, batch: &WalBatch) -> Result<()> {
        let payload = bincode::serialize(batch)?;
        let mut inner = self.inner.lock();
        let written = frame::write_record(&mut inner.active.writer, &payload)?;
        inner.active.size += written;
        for op in &batch.ops {
            inner.active.targets.extend(op.targets.iter().copied());
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        #[cfg(test)]
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected WAL sync failure").into());
        }
        let mut inner = self.inner.lock();
        inner.active.writer.flush()?;
        inner.active.writer.get_ref().sync_data()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_syncs(&self) {
        self.fail_sync.store(true, Ordering::SeqCst);
    }

    /// Close the active segment and start a new one.
    pub fn roll(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.roll_locked(&mut inner)
    }

    /// Closed segments whose every target is durable.
    pub fn deletable_segments(&self, is_durable: impl Fn(&MutationTarget) -> bool) -> Vec<u64> {
        let inner = self.inner.lock();
        inner
            .closed
            .iter()
            .filter(|segment| segment.targets.iter().all(&is_durable))
            .map(|segment| segment.id)
            .collect()
    }

    /// Delete closed segments; returns how many files were removed.
    pub fn remove_segments(&self, ids: &[u64]) -> usize {
        let mut inner = self.inner.lock();
        inner.closed.retain(|segment| !ids.contains(&segment.id));
        drop(inner);

        let mut removed = 0;
        for id in ids {
            let path = Self::segment_path(&self.dir, *id);
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(segment = id, "Deleted WAL segment");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(segment = id, error = %e, "Failed to delete WAL segment");
                }
            }
        }
        removed
    }

    pub fn segment_ids(&self) -> Vec<u64> {
        let inner = self.inner.lock();
        inner
            .closed
            .iter()
            .map(|segment| segment.id)
            .chain(std::iter::once(inner.active.id))
            .collect()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Segment files found in `dir`, in id order.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let id = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(".wal"))
            .and_then(|num| num.parse::<u64>().ok());
        match id {
            Some(id) => segments.push((id, path)),
            None => tracing::warn!(path = %path.display(), "Ignoring unexpected file in WAL directory"),
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Every batch of one segment. A torn final record is ignored.
pub fn read_segment(path: &Path) -> Result<Vec<WalBatch>> {
    let mut reader = BufReader::new(File::open(path)?);
    FileHeader::read_from(&mut reader, WAL_MAGIC)?;
    RecordReader::new(reader, true)
        .map(|payload| bincode::deserialize(&payload?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Value;
    use tempfile::TempDir;

    fn options() -> LogOptions {
        LogOptions {
            buffer_size: 4096,
            segment_size: 1024 * 1024,
        }
    }

    fn batch(ts: u64, target: MutationTarget) -> WalBatch {
        let row: Row = [(0, Value::UInt32(ts as u32))].into_iter().collect();
        WalBatch {
            ts: Timestamp(ts),
            ops: vec![LoggedOp {
                key: vec![ts as u8],
                change: LoggedChange::Insert(row),
                targets: vec![target],
            }],
        }
    }

    #[test]
    fn test_append_roll_and_read() -> Result<()> {
        let dir = TempDir::new()?;
        let wal_dir = dir.path().join("wal");
        let log = Log::create(&wal_dir, options())?;

        log.append(&batch(1, MutationTarget::MemRowSet(1)))?;
        log.roll()?;
        log.append(&batch(2, MutationTarget::MemRowSet(2)))?;
        log.sync()?;
        assert_eq!(log.segment_ids(), vec![1, 2]);

        let segments = list_segments(&wal_dir)?;
        assert_eq!(segments.len(), 2);
        let first = read_segment(&segments[0].1)?;
        assert_eq!(first, vec![batch(1, MutationTarget::MemRowSet(1))]);
        let second = read_segment(&segments[1].1)?;
        assert_eq!(second[0].ts, Timestamp(2));
        Ok(())
    }

    #[test]
    fn test_deletable_segments() -> Result<()> {
        let dir = TempDir::new()?;
        let wal_dir = dir.path().join("wal");
        let log = Log::create(&wal_dir, options())?;

        log.append(&batch(1, MutationTarget::MemRowSet(1)))?;
        log.roll()?;
        log.append(&batch(2, MutationTarget::MemRowSet(2)))?;
        log.roll()?;

        let durable_mrs = |up_to: u64| {
            move |target: &MutationTarget| matches!(target, MutationTarget::MemRowSet(id) if *id <= up_to)
        };
        assert!(log.deletable_segments(durable_mrs(0)).is_empty());
        assert_eq!(log.deletable_segments(durable_mrs(1)), vec![1]);

        // The active segment is never handed out.
        let deletable = log.deletable_segments(durable_mrs(2));
        assert_eq!(deletable, vec![1, 2]);
        assert_eq!(log.remove_segments(&deletable), 2);
        assert_eq!(log.segment_ids(), vec![3]);
        assert_eq!(list_segments(&wal_dir)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_rolls_when_segment_full() -> Result<()> {
        let dir = TempDir::new()?;
        let log = Log::create(
            &dir.path().join("wal"),
            LogOptions {
                buffer_size: 4096,
                segment_size: 1,
            },
        )?;
        log.roll_if_full()?;
        assert_eq!(log.segment_ids(), vec![1]);

        log.append(&batch(1, MutationTarget::MemRowSet(1)))?;
        log.roll_if_full()?;
        log.append(&batch(2, MutationTarget::MemRowSet(1)))?;
        assert_eq!(log.segment_ids(), vec![1, 2]);
        Ok(())
    }
}
