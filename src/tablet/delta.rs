//! Delta stores: the per-row-set history of updates, deletes and reinserts
//! applied after a row reached its base data.
//!
//! Mutations first land in an in-memory [`DeltaMemStore`]. A delta flush
//! freezes it, writes it out as an immutable [`DeltaFile`] and starts a new
//! one with the next id. Deltas are keyed by `(row_idx, ts, seq)`, so the
//! history of one row is contiguous and timestamp-ordered; `seq` breaks ties
//! between mutations of the same row within one write batch.

use super::rowset::MutationTarget;
use crate::encoding::bincode;
use crate::encoding::frame::{self, FileHeader, RecordReader, DELTA_MAGIC};
use crate::error::Result;
use crate::mvcc::Timestamp;
use crate::schema::RowChange;

use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeltaKey {
    pub row_idx: u32,
    pub ts: Timestamp,
    pub seq: u64,
}

impl DeltaKey {
    fn row_start(row_idx: u32) -> Self {
        Self {
            row_idx,
            ts: Timestamp::INITIAL,
            seq: 0,
        }
    }

    fn row_end(row_idx: u32) -> Self {
        Self {
            row_idx,
            ts: Timestamp::MAX,
            seq: u64::MAX,
        }
    }
}

pub struct DeltaMemStore {
    id: u64,
    deltas: SkipMap<DeltaKey, RowChange>,
    size: AtomicUsize,
}

impl DeltaMemStore {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            deltas: SkipMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn insert(&self, key: DeltaKey, change: RowChange) {
        self.size
            .fetch_add(change.estimated_size() + 24, Ordering::Relaxed);
        self.deltas.insert(key, change);
    }

    fn row_changes(&self, row_idx: u32, out: &mut Vec<(DeltaKey, RowChange)>) {
        for entry in self
            .deltas
            .range(DeltaKey::row_start(row_idx)..=DeltaKey::row_end(row_idx))
        {
            out.push((*entry.key(), entry.value().clone()));
        }
    }
}

/// A flushed, immutable delta store.
#[derive(Debug)]
pub struct DeltaFile {
    id: u64,
    deltas: Vec<(DeltaKey, RowChange)>,
}

impl DeltaFile {
    pub fn path(dir: &Path, rowset_id: u64, id: u64) -> PathBuf {
        dir.join(format!("{:08}-{:08}.delta", rowset_id, id))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    fn max_seq(&self) -> Option<u64> {
        self.deltas.iter().map(|(k, _)| k.seq).max()
    }

    /// Write a frozen memstore to disk and sync it.
    pub fn write(dir: &Path, rowset_id: u64, dms: &DeltaMemStore) -> Result<Self> {
        let path = Self::path(dir, rowset_id, dms.id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        FileHeader::new(DELTA_MAGIC).write_to(&mut writer)?;

        let mut deltas = Vec::with_capacity(dms.deltas.len());
        for entry in dms.deltas.iter() {
            let record = (*entry.key(), entry.value().clone());
            frame::write_record(&mut writer, &bincode::serialize(&record)?)?;
            deltas.push(record);
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;

        tracing::debug!(
            rowset_id,
            delta_id = dms.id,
            deltas = deltas.len(),
            "Wrote delta file"
        );
        Ok(Self { id: dms.id, deltas })
    }

    pub fn open(dir: &Path, rowset_id: u64, id: u64) -> Result<Self> {
        let mut reader = BufReader::new(File::open(Self::path(dir, rowset_id, id))?);
        FileHeader::read_from(&mut reader, DELTA_MAGIC)?;

        let mut deltas = Vec::new();
        for payload in RecordReader::new(reader, false) {
            deltas.push(bincode::deserialize::<(DeltaKey, RowChange)>(&payload?)?);
        }
        Ok(Self { id, deltas })
    }

    fn row_changes(&self, row_idx: u32, out: &mut Vec<(DeltaKey, RowChange)>) {
        let start = self.deltas.partition_point(|(k, _)| k.row_idx < row_idx);
        out.extend(
            self.deltas[start..]
                .iter()
                .take_while(|(k, _)| k.row_idx == row_idx)
                .cloned(),
        );
    }
}

struct DeltaStores {
    dms: Arc<DeltaMemStore>,
    /// Frozen memstore whose file is being written
    flushing: Option<Arc<DeltaMemStore>>,
    files: Vec<Arc<DeltaFile>>,
}

/// Owns every delta store of one disk row set.
pub struct DeltaTracker {
    rowset_id: u64,
    dir: PathBuf,
    stores: RwLock<DeltaStores>,
    next_seq: AtomicU64,
    flush_lock: Mutex<()>,
}

impl DeltaTracker {
    /// A tracker over already flushed delta files; the live memstore gets
    /// id `next_dms_id`.
    pub fn new(rowset_id: u64, dir: &Path, files: Vec<DeltaFile>, next_dms_id: u64) -> Self {
        let next_seq = files
            .iter()
            .filter_map(|f| f.max_seq())
            .max()
            .map_or(0, |s| s + 1);
        Self {
            rowset_id,
            dir: dir.to_path_buf(),
            stores: RwLock::new(DeltaStores {
                dms: Arc::new(DeltaMemStore::new(next_dms_id)),
                flushing: None,
                files: files.into_iter().map(Arc::new).collect(),
            }),
            next_seq: AtomicU64::new(next_seq),
            flush_lock: Mutex::new(()),
        }
    }

    /// Record a mutation of `row_idx` in the live memstore.
    pub fn update(&self, row_idx: u32, ts: Timestamp, change: RowChange) -> MutationTarget {
        let stores = self.stores.read();
        let key = DeltaKey {
            row_idx,
            ts,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        stores.dms.insert(key, change);
        MutationTarget::DiskRowSet {
            rowset_id: self.rowset_id,
            dms_id: stores.dms.id,
        }
    }

    /// Every recorded change of one row, oldest first.
    pub fn row_changes(&self, row_idx: u32) -> Vec<(DeltaKey, RowChange)> {
        let stores = self.stores.read();
        let mut out = Vec::new();
        for file in &stores.files {
            file.row_changes(row_idx, &mut out);
        }
        if let Some(flushing) = &stores.flushing {
            flushing.row_changes(row_idx, &mut out);
        }
        stores.dms.row_changes(row_idx, &mut out);
        drop(stores);

        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// All changes whose timestamp satisfies `pred`.
    pub fn changes_where(&self, pred: impl Fn(Timestamp) -> bool) -> Vec<(DeltaKey, RowChange)> {
        let stores = self.stores.read();
        let mut out = Vec::new();
        for file in &stores.files {
            out.extend(file.deltas.iter().filter(|(k, _)| pred(k.ts)).cloned());
        }
        let memstores = stores.flushing.iter().chain(std::iter::once(&stores.dms));
        for dms in memstores {
            for entry in dms.deltas.iter() {
                if pred(entry.key().ts) {
                    out.push((*entry.key(), entry.value().clone()));
                }
            }
        }
        drop(stores);

        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Swap in an empty memstore and return the previous one, unless it is
    /// empty or another frozen store is still unflushed.
    fn freeze(&self) -> Option<Arc<DeltaMemStore>> {
        let mut stores = self.stores.write();
        if stores.dms.is_empty() || stores.flushing.is_some() {
            return None;
        }
        let next = Arc::new(DeltaMemStore::new(stores.dms.id + 1));
        let frozen = std::mem::replace(&mut stores.dms, next);
        stores.flushing = Some(frozen.clone());
        Some(frozen)
    }

    /// Flush the live memstore to a delta file.
    ///
    /// `wait_for_writers` runs between freezing and writing; it must block
    /// until every transaction that touched the frozen memstore has
    /// committed. Returns the flushed memstore id, or `None` if it was empty.
    pub fn flush(&self, wait_for_writers: impl FnOnce()) -> Result<Option<u64>> {
        let _guard = self.flush_lock.lock();
        let stuck = self.stores.read().flushing.clone();
        let frozen = match stuck {
            Some(frozen) => frozen,
            None => match self.freeze() {
                Some(frozen) => frozen,
                None => return Ok(None),
            },
        };
        wait_for_writers();

        let file = match DeltaFile::write(&self.dir, self.rowset_id, &frozen) {
            Ok(file) => Arc::new(file),
            Err(e) => {
                // The frozen store stays readable and is retried first by
                // the next flush.
                tracing::warn!(
                    rowset_id = self.rowset_id,
                    delta_id = frozen.id,
                    error = %e,
                    "Delta flush failed"
                );
                return Err(e);
            }
        };

        let mut stores = self.stores.write();
        stores.flushing = None;
        stores.files.push(file);
        Ok(Some(frozen.id))
    }

    pub fn delta_ids(&self) -> Vec<u64> {
        self.stores.read().files.iter().map(|f| f.id).collect()
    }

    /// Every memstore id below this one is in a delta file.
    pub fn current_dms_id(&self) -> u64 {
        let stores = self.stores.read();
        stores.flushing.as_ref().map_or(stores.dms.id, |frozen| frozen.id)
    }

    pub fn dms_size(&self) -> usize {
        self.stores.read().dms.size()
    }

    pub fn delete_files(&self) {
        for id in self.delta_ids() {
            let path = DeltaFile::path(&self.dir, self.rowset_id, id);
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete delta file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Value;
    use tempfile::TempDir;

    fn update(v: u32) -> RowChange {
        RowChange::Update(vec![(1, Value::UInt32(v))])
    }

    #[test]
    fn test_row_changes_ordered_across_stores() -> Result<()> {
        let dir = TempDir::new()?;
        let tracker = DeltaTracker::new(7, dir.path(), Vec::new(), 0);

        let target = tracker.update(3, Timestamp(5), update(1));
        assert_eq!(
            target,
            MutationTarget::DiskRowSet {
                rowset_id: 7,
                dms_id: 0
            }
        );
        tracker.update(4, Timestamp(6), RowChange::Delete);
        assert_eq!(tracker.flush(|| {})?, Some(0));
        assert_eq!(tracker.current_dms_id(), 1);

        tracker.update(3, Timestamp(9), update(2));
        let changes = tracker.row_changes(3);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].1, update(1));
        assert_eq!(changes[1].1, update(2));

        // An empty memstore has nothing to flush.
        let empty = DeltaTracker::new(8, dir.path(), Vec::new(), 0);
        assert_eq!(empty.flush(|| {})?, None);
        Ok(())
    }

    #[test]
    fn test_reopen_continues_sequence() -> Result<()> {
        let dir = TempDir::new()?;
        let tracker = DeltaTracker::new(1, dir.path(), Vec::new(), 0);
        tracker.update(0, Timestamp(3), update(1));
        tracker.update(0, Timestamp(3), update(2));
        tracker.flush(|| {})?;

        let file = DeltaFile::open(dir.path(), 1, 0)?;
        assert_eq!(file.len(), 2);
        let reopened = DeltaTracker::new(1, dir.path(), vec![file], 1);

        // Same timestamp as the flushed pair: must still order after them.
        reopened.update(0, Timestamp(3), update(3));
        let changes = reopened.row_changes(0);
        assert_eq!(
            changes.iter().map(|(_, c)| c.clone()).collect::<Vec<_>>(),
            vec![update(1), update(2), update(3)]
        );
        Ok(())
    }

    #[test]
    fn test_changes_where_filters_by_timestamp() {
        let dir = TempDir::new().unwrap();
        let tracker = DeltaTracker::new(2, dir.path(), Vec::new(), 0);
        tracker.update(0, Timestamp(1), update(1));
        tracker.update(1, Timestamp(5), update(2));
        tracker.update(2, Timestamp(9), RowChange::Delete);

        let missed = tracker.changes_where(|ts| ts > Timestamp(2) && ts < Timestamp(9));
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].0.row_idx, 1);
    }
}
