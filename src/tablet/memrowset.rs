use super::rowset::{KeyedMutation, MutationTarget, RowIterator, RowSet};
use crate::error::Result;
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::schema::{apply_change, Row, RowChange};
use crate::Error;

use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One inserted row plus the mutations applied to it since.
struct MrsRow {
    insert_ts: Timestamp,
    row: Row,
    mutations: Mutex<Vec<(Timestamp, RowChange)>>,
}

impl MrsRow {
    /// Liveness after every applied mutation, committed or not.
    fn is_live(&self) -> bool {
        self.mutations
            .lock()
            .iter()
            .fold(true, |live, (_, change)| match change {
                RowChange::Delete => false,
                RowChange::Reinsert(_) => true,
                RowChange::Update(_) => live,
            })
    }

    fn state_as_of(&self, snapshot: &MvccSnapshot) -> Option<Row> {
        if !snapshot.is_committed(self.insert_ts) {
            return None;
        }
        let mut state = Some(self.row.clone());
        for (ts, change) in self.mutations.lock().iter() {
            if snapshot.is_committed(*ts) {
                apply_change(&mut state, change);
            }
        }
        state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The key held a deleted row, which is now restored.
    Reinserted,
}

/// The mutable, key-indexed in-memory store accepting new rows.
///
/// Deleted rows stay in the map as ghosts so a later insert of the same
/// key becomes a reinsert of the existing entry, keeping every mutation of
/// a key in one timestamp-ordered list.
pub struct MemRowSet {
    id: u64,
    rows: SkipMap<Vec<u8>, MrsRow>,
    size: AtomicUsize,
}

impl MemRowSet {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            rows: SkipMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.rows.len()
    }

    /// Insert a new row, or restore a deleted one under the same key.
    ///
    /// Callers serialize inserts; the map itself only guards readers.
    pub fn insert(&self, key: Vec<u8>, ts: Timestamp, row: Row) -> Result<InsertOutcome> {
        if let Some(entry) = self.rows.get(key.as_slice()) {
            let existing = entry.value();
            if existing.is_live() {
                return Err(Error::AlreadyPresent(
                    "key already present in MemRowSet".to_string(),
                ));
            }
            let change = RowChange::Reinsert(row);
            self.size.fetch_add(change.estimated_size(), Ordering::Relaxed);
            existing.mutations.lock().push((ts, change));
            return Ok(InsertOutcome::Reinserted);
        }

        self.size
            .fetch_add(key.len() + row.estimated_size(), Ordering::Relaxed);
        self.rows.insert(
            key,
            MrsRow {
                insert_ts: ts,
                row,
                mutations: Mutex::new(Vec::new()),
            },
        );
        Ok(InsertOutcome::Inserted)
    }

    /// Mutations whose timestamp satisfies `pred`, in per-row order.
    pub fn mutations_where(&self, pred: impl Fn(Timestamp) -> bool) -> Vec<KeyedMutation> {
        let mut out = Vec::new();
        for entry in self.rows.iter() {
            for (ts, change) in entry.value().mutations.lock().iter() {
                if pred(*ts) {
                    out.push(KeyedMutation {
                        key: entry.key().clone(),
                        ts: *ts,
                        change: change.clone(),
                    });
                }
            }
        }
        out
    }
}

impl RowSet for MemRowSet {
    fn describe(&self) -> String {
        format!("MemRowSet({})", self.id)
    }

    fn check_row_present(&self, key: &[u8]) -> Result<bool> {
        Ok(self
            .rows
            .get(key)
            .is_some_and(|entry| entry.value().is_live()))
    }

    fn mutate_row(
        &self,
        key: &[u8],
        ts: Timestamp,
        change: &RowChange,
    ) -> Result<Option<Vec<MutationTarget>>> {
        let Some(entry) = self.rows.get(key) else {
            return Ok(None);
        };
        let row = entry.value();
        let live = row.is_live();
        let applicable = match change {
            RowChange::Reinsert(_) => !live,
            RowChange::Update(_) | RowChange::Delete => live,
        };
        if !applicable {
            return Ok(None);
        }

        self.size
            .fetch_add(change.estimated_size(), Ordering::Relaxed);
        row.mutations.lock().push((ts, change.clone()));
        Ok(Some(vec![MutationTarget::MemRowSet(self.id)]))
    }

    fn iter(self: Arc<Self>, snapshot: MvccSnapshot) -> Result<RowIterator> {
        Ok(Box::new(MemRowSetIter {
            mrs: self,
            snapshot,
            last_key: None,
        }))
    }

    fn estimated_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }
}

/// Owning cursor over a MemRowSet; resumes after the last returned key so
/// rows inserted concurrently are either seen once or not at all.
struct MemRowSetIter {
    mrs: Arc<MemRowSet>,
    snapshot: MvccSnapshot,
    last_key: Option<Vec<u8>>,
}

impl Iterator for MemRowSetIter {
    type Item = Result<(Vec<u8>, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match &self.last_key {
                None => self.mrs.rows.front(),
                Some(last) => self
                    .mrs
                    .rows
                    .lower_bound(Bound::Excluded(last.as_slice())),
            }?;
            let key = entry.key().clone();
            let state = entry.value().state_as_of(&self.snapshot);
            self.last_key = Some(key.clone());
            if let Some(row) = state {
                return Some(Ok((key, row)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::{Clock, MvccManager};
    use crate::schema::Value;

    fn row(v: u32) -> Row {
        [(0, Value::UInt32(v)), (1, Value::UInt32(v * 10))]
            .into_iter()
            .collect()
    }

    fn collect(mrs: &Arc<MemRowSet>, snapshot: MvccSnapshot) -> Vec<(Vec<u8>, Row)> {
        mrs.clone()
            .iter(snapshot)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn test_insert_duplicate_and_reinsert() -> Result<()> {
        let mrs = MemRowSet::new(1);
        assert_eq!(mrs.insert(vec![1], Timestamp(1), row(1))?, InsertOutcome::Inserted);
        assert!(matches!(
            mrs.insert(vec![1], Timestamp(2), row(1)),
            Err(Error::AlreadyPresent(_))
        ));

        assert!(mrs
            .mutate_row(&[1], Timestamp(3), &RowChange::Delete)?
            .is_some());
        assert!(!mrs.check_row_present(&[1])?);

        // Deleting or updating a ghost finds nothing.
        assert!(mrs.mutate_row(&[1], Timestamp(4), &RowChange::Delete)?.is_none());

        assert_eq!(mrs.insert(vec![1], Timestamp(5), row(2))?, InsertOutcome::Reinserted);
        assert!(mrs.check_row_present(&[1])?);
        assert_eq!(mrs.entry_count(), 1);
        Ok(())
    }

    #[test]
    fn test_iter_respects_snapshot() -> Result<()> {
        let mvcc = MvccManager::new(Arc::new(Clock::new()));
        let mrs = Arc::new(MemRowSet::new(1));

        let t1 = mvcc.start_transaction();
        mrs.insert(vec![1], t1, row(1))?;
        mrs.insert(vec![2], t1, row(2))?;
        mvcc.commit(t1);
        let before_update = mvcc.take_snapshot();

        let t2 = mvcc.start_transaction();
        mrs.mutate_row(&[1], t2, &RowChange::Update(vec![(1, Value::UInt32(99))]))?;
        mrs.mutate_row(&[2], t2, &RowChange::Delete)?;

        // Applied but uncommitted changes are invisible.
        let during = mvcc.take_snapshot();
        assert_eq!(collect(&mrs, during).len(), 2);

        mvcc.commit(t2);
        let after = collect(&mrs, mvcc.take_snapshot());
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].1.get(1), Some(&Value::UInt32(99)));

        let old = collect(&mrs, before_update);
        assert_eq!(old[0].1.get(1), Some(&Value::UInt32(10)));
        Ok(())
    }

    #[test]
    fn test_mutations_where() -> Result<()> {
        let mrs = MemRowSet::new(3);
        mrs.insert(vec![1], Timestamp(1), row(1))?;
        mrs.mutate_row(&[1], Timestamp(4), &RowChange::Update(vec![(1, Value::UInt32(5))]))?;
        mrs.mutate_row(&[1], Timestamp(8), &RowChange::Delete)?;

        let missed = mrs.mutations_where(|ts| ts >= Timestamp(3) && ts < Timestamp(6));
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].ts, Timestamp(4));
        assert_eq!(missed[0].key, vec![1]);
        Ok(())
    }
}
