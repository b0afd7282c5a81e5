use super::diskrowset::DiskRowSet;
use super::iterator::MergeIterator;
use super::rowset::{MutationTarget, RowIterator, RowSet};
use crate::error::Result;
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::schema::RowChange;

use itertools::Itertools as _;
use std::sync::Arc;

/// Stands in for the inputs of a flush or compaction while their output is
/// being handed over.
///
/// Reads are served by the inputs. A mutation is applied to whichever input
/// holds the live row and then mirrored into the output's delta store, so
/// both sides see it no matter which one survives a crash.
pub struct DuplicatingRowSet {
    old: Vec<Arc<dyn RowSet>>,
    new: Arc<DiskRowSet>,
}

impl DuplicatingRowSet {
    pub fn new(old: Vec<Arc<dyn RowSet>>, new: Arc<DiskRowSet>) -> Self {
        Self { old, new }
    }
}

impl RowSet for DuplicatingRowSet {
    fn describe(&self) -> String {
        format!(
            "DuplicatingRowSet([{}] -> {})",
            self.old.iter().map(|rs| rs.describe()).join(", "),
            self.new.describe()
        )
    }

    fn check_row_present(&self, key: &[u8]) -> Result<bool> {
        for rs in &self.old {
            if rs.check_row_present(key)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn mutate_row(
        &self,
        key: &[u8],
        ts: Timestamp,
        change: &RowChange,
    ) -> Result<Option<Vec<MutationTarget>>> {
        for rs in &self.old {
            if let Some(mut targets) = rs.mutate_row(key, ts, change)? {
                targets.extend(self.new.mirror(key, ts, change)?);
                return Ok(Some(targets));
            }
        }
        Ok(None)
    }

    fn iter(self: Arc<Self>, snapshot: MvccSnapshot) -> Result<RowIterator> {
        let iters = self
            .old
            .iter()
            .map(|rs| rs.clone().iter(snapshot.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(MergeIterator::new(iters)))
    }

    fn estimated_size(&self) -> usize {
        self.old.iter().map(|rs| rs.estimated_size()).sum()
    }
}
