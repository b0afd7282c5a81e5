use super::delta::{DeltaFile, DeltaTracker};
use super::metadata::RowSetMeta;
use super::rowset::{KeyedMutation, MutationTarget, RowIterator, RowSet};
use crate::encoding::bincode;
use crate::encoding::frame::{self, FileHeader, RecordReader, BASE_MAGIC};
use crate::error::Result;
use crate::mvcc::{MvccManager, MvccSnapshot, Timestamp};
use crate::schema::{apply_change, Row, RowChange};
use crate::Error;

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Immutable sorted base rows produced by a flush or compaction, with the
/// delta stores layered on top of them.
///
/// Rows are addressed by their position in the base data; deltas refer to
/// that position, never to the key.
pub struct DiskRowSet {
    id: u64,
    dir: PathBuf,
    keys: Vec<Vec<u8>>,
    rows: Vec<Row>,
    base_size: usize,
    deltas: DeltaTracker,
}

impl DiskRowSet {
    pub fn base_path(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("{:08}.base", id))
    }

    /// Write key-ordered rows as the base data of row set `id`.
    pub fn write<I>(dir: &Path, id: u64, rows: I) -> Result<Self>
    where
        I: Iterator<Item = Result<(Vec<u8>, Row)>>,
    {
        let path = Self::base_path(dir, id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        FileHeader::new(BASE_MAGIC).write_to(&mut writer)?;

        let mut keys = Vec::new();
        let mut base = Vec::new();
        let mut base_size = 0;
        for item in rows {
            let (key, row) = item?;
            if keys.last().is_some_and(|last: &Vec<u8>| *last >= key) {
                return Err(Error::InvalidState(format!(
                    "Row set {} input is not in key order",
                    id
                )));
            }
            let record = (key, row);
            base_size += frame::write_record(&mut writer, &bincode::serialize(&record)?)?;
            let (key, row) = record;
            keys.push(key);
            base.push(row);
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;

        tracing::debug!(rowset_id = id, rows = keys.len(), bytes = base_size, "Wrote row set base data");
        Ok(Self {
            id,
            dir: dir.to_path_buf(),
            keys,
            rows: base,
            base_size: base_size as usize,
            deltas: DeltaTracker::new(id, dir, Vec::new(), 0),
        })
    }

    /// Load a committed row set with its flushed delta files.
    pub fn open(dir: &Path, meta: &RowSetMeta) -> Result<Self> {
        let mut reader = BufReader::new(File::open(Self::base_path(dir, meta.id))?);
        FileHeader::read_from(&mut reader, BASE_MAGIC)?;

        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut rows = Vec::new();
        let mut base_size = 0;
        for payload in RecordReader::new(reader, false) {
            let payload = payload?;
            base_size += payload.len() + 8;
            let (key, row): (Vec<u8>, Row) = bincode::deserialize(&payload)?;
            if keys.last().is_some_and(|last| *last >= key) {
                return Err(Error::Corruption(format!(
                    "Row set {} base data is not sorted",
                    meta.id
                )));
            }
            keys.push(key);
            rows.push(row);
        }

        let files = meta
            .delta_ids
            .iter()
            .map(|delta_id| DeltaFile::open(dir, meta.id, *delta_id))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: meta.id,
            dir: dir.to_path_buf(),
            keys,
            rows,
            base_size,
            deltas: DeltaTracker::new(meta.id, dir, files, meta.next_dms_id),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn row_count(&self) -> usize {
        self.keys.len()
    }

    /// Durable layout of this row set as recorded in tablet metadata.
    pub fn meta(&self) -> RowSetMeta {
        RowSetMeta {
            id: self.id,
            delta_ids: self.deltas.delta_ids(),
            next_dms_id: self.deltas.current_dms_id(),
        }
    }

    fn find_row(&self, key: &[u8]) -> Option<u32> {
        self.keys
            .binary_search_by(|probe| probe.as_slice().cmp(key))
            .ok()
            .map(|idx| idx as u32)
    }

    fn is_live(&self, row_idx: u32) -> bool {
        self.deltas
            .row_changes(row_idx)
            .iter()
            .fold(true, |live, (_, change)| match change {
                RowChange::Delete => false,
                RowChange::Reinsert(_) => true,
                RowChange::Update(_) => live,
            })
    }

    fn row_as_of(&self, row_idx: u32, snapshot: &MvccSnapshot) -> Option<Row> {
        let mut state = Some(self.rows[row_idx as usize].clone());
        for (key, change) in self.deltas.row_changes(row_idx) {
            if snapshot.is_committed(key.ts) {
                apply_change(&mut state, &change);
            }
        }
        state
    }

    /// Record a mutation that already succeeded against the row set this
    /// one is replacing. The row must exist in the base data.
    pub fn mirror(&self, key: &[u8], ts: Timestamp, change: &RowChange) -> Result<Vec<MutationTarget>> {
        let row_idx = self.find_row(key).ok_or_else(|| {
            Error::InvalidState(format!(
                "Row set {} is missing a row its predecessor mutated",
                self.id
            ))
        })?;
        Ok(vec![self.deltas.update(row_idx, ts, change.clone())])
    }

    /// Mutations whose timestamp satisfies `pred`, keyed by row key.
    pub fn mutations_where(&self, pred: impl Fn(Timestamp) -> bool) -> Vec<KeyedMutation> {
        self.deltas
            .changes_where(pred)
            .into_iter()
            .map(|(key, change)| KeyedMutation {
                key: self.keys[key.row_idx as usize].clone(),
                ts: key.ts,
                change,
            })
            .collect()
    }

    /// Write the in-memory deltas to a delta file once every transaction
    /// that touched them has committed.
    pub fn flush_deltas(&self, mvcc: &MvccManager) -> Result<Option<u64>> {
        self.deltas.flush(|| {
            let boundary = mvcc.clock().now().next();
            mvcc.wait_for_all_committed_before(boundary);
        })
    }

    pub fn delta_memstore_size(&self) -> usize {
        self.deltas.dms_size()
    }

    /// Best-effort removal of this row set's files once it is retired.
    pub fn delete_files(&self) {
        self.deltas.delete_files();
        let path = Self::base_path(&self.dir, self.id);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete row set file");
        }
    }
}

impl RowSet for DiskRowSet {
    fn describe(&self) -> String {
        format!("DiskRowSet({})", self.id)
    }

    fn check_row_present(&self, key: &[u8]) -> Result<bool> {
        Ok(self.find_row(key).is_some_and(|idx| self.is_live(idx)))
    }

    fn mutate_row(
        &self,
        key: &[u8],
        ts: Timestamp,
        change: &RowChange,
    ) -> Result<Option<Vec<MutationTarget>>> {
        let Some(row_idx) = self.find_row(key) else {
            return Ok(None);
        };
        let live = self.is_live(row_idx);
        let applicable = match change {
            RowChange::Reinsert(_) => !live,
            RowChange::Update(_) | RowChange::Delete => live,
        };
        if !applicable {
            return Ok(None);
        }
        Ok(Some(vec![self.deltas.update(row_idx, ts, change.clone())]))
    }

    fn iter(self: Arc<Self>, snapshot: MvccSnapshot) -> Result<RowIterator> {
        Ok(Box::new(DiskRowSetIter {
            rowset: self,
            snapshot,
            pos: 0,
        }))
    }

    fn estimated_size(&self) -> usize {
        self.base_size + self.deltas.dms_size()
    }

    fn as_disk(self: Arc<Self>) -> Option<Arc<DiskRowSet>> {
        Some(self)
    }
}

struct DiskRowSetIter {
    rowset: Arc<DiskRowSet>,
    snapshot: MvccSnapshot,
    pos: usize,
}

impl Iterator for DiskRowSetIter {
    type Item = Result<(Vec<u8>, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.rowset.keys.len() {
            let idx = self.pos;
            self.pos += 1;
            if let Some(row) = self.rowset.row_as_of(idx as u32, &self.snapshot) {
                return Some(Ok((self.rowset.keys[idx].clone(), row)));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::Clock;
    use crate::schema::Value;
    use tempfile::TempDir;

    fn base_rows(n: u8) -> impl Iterator<Item = Result<(Vec<u8>, Row)>> {
        (0..n).map(|i| {
            let row: Row = [(0, Value::UInt32(i as u32)), (1, Value::UInt32(0))]
                .into_iter()
                .collect();
            Ok((vec![i], row))
        })
    }

    fn live_keys(rs: &Arc<DiskRowSet>, snapshot: MvccSnapshot) -> Vec<u8> {
        rs.clone()
            .iter(snapshot)
            .unwrap()
            .map(|r| r.unwrap().0[0])
            .collect()
    }

    #[test]
    fn test_write_mutate_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let mvcc = MvccManager::new(Arc::new(Clock::new()));
        let rs = Arc::new(DiskRowSet::write(dir.path(), 1, base_rows(4))?);
        assert_eq!(rs.row_count(), 4);

        let ts = mvcc.start_transaction();
        let update = RowChange::Update(vec![(1, Value::UInt32(42))]);
        assert!(rs.mutate_row(&[1], ts, &update)?.is_some());
        assert!(rs.mutate_row(&[2], ts, &RowChange::Delete)?.is_some());
        assert!(rs.mutate_row(&[9], ts, &RowChange::Delete)?.is_none());
        mvcc.commit(ts);

        assert!(!rs.check_row_present(&[2])?);
        assert!(rs.mutate_row(&[2], Timestamp(99), &update)?.is_none());
        assert_eq!(live_keys(&rs, mvcc.take_snapshot()), vec![0, 1, 3]);

        assert_eq!(rs.flush_deltas(&mvcc)?, Some(0));
        let meta = rs.meta();
        assert_eq!(meta.delta_ids, vec![0]);
        assert_eq!(meta.next_dms_id, 1);

        let reopened = Arc::new(DiskRowSet::open(dir.path(), &meta)?);
        let rows: Vec<_> = reopened
            .clone()
            .iter(MvccSnapshot::including_all())?
            .collect::<Result<_>>()?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].1.get(1), Some(&Value::UInt32(42)));
        Ok(())
    }

    #[test]
    fn test_unsorted_input_rejected() {
        let dir = TempDir::new().unwrap();
        let rows = vec![Ok((vec![2], Row::new())), Ok((vec![1], Row::new()))];
        assert!(DiskRowSet::write(dir.path(), 1, rows.into_iter()).is_err());
    }

    #[test]
    fn test_mirror_and_missed_mutations() -> Result<()> {
        let dir = TempDir::new()?;
        let rs = DiskRowSet::write(dir.path(), 5, base_rows(3))?;

        let targets = rs.mirror(&[2], Timestamp(7), &RowChange::Delete)?;
        assert_eq!(
            targets,
            vec![MutationTarget::DiskRowSet {
                rowset_id: 5,
                dms_id: 0
            }]
        );
        assert!(rs.mirror(&[8], Timestamp(7), &RowChange::Delete).is_err());

        let missed = rs.mutations_where(|ts| ts == Timestamp(7));
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].key, vec![2]);
        Ok(())
    }
}
