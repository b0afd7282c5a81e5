use super::diskrowset::DiskRowSet;
use crate::error::Result;
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::schema::{Row, RowChange};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Rows in primary-key order, as `(encoded key, row)`.
pub type RowIterator = Box<dyn Iterator<Item = Result<(Vec<u8>, Row)>> + Send>;

/// The store a logged operation was applied to.
///
/// Recovery uses these to decide whether an operation is already durable
/// in flushed data or must be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MutationTarget {
    MemRowSet(u64),
    DiskRowSet { rowset_id: u64, dms_id: u64 },
}

/// A mutation found in a row set's delta history, keyed by row key.
#[derive(Debug, Clone)]
pub struct KeyedMutation {
    pub key: Vec<u8>,
    pub ts: Timestamp,
    pub change: RowChange,
}

/// Common surface of the MemRowSet, disk row sets and the duplicating
/// wrapper installed while a flush or compaction hands data over.
pub trait RowSet: Send + Sync {
    fn describe(&self) -> String;

    /// Whether `key` currently holds a live row, counting mutations that
    /// are applied but not yet committed.
    fn check_row_present(&self, key: &[u8]) -> Result<bool>;

    /// Apply a post-insert mutation to a row of this set.
    ///
    /// Updates and deletes need a live row; reinserts need a deleted one.
    /// Returns `None` when the row is not here in the required state.
    fn mutate_row(
        &self,
        key: &[u8],
        ts: Timestamp,
        change: &RowChange,
    ) -> Result<Option<Vec<MutationTarget>>>;

    /// Live rows as of `snapshot`, in key order.
    fn iter(self: Arc<Self>, snapshot: MvccSnapshot) -> Result<RowIterator>;

    fn estimated_size(&self) -> usize;

    fn as_disk(self: Arc<Self>) -> Option<Arc<DiskRowSet>> {
        None
    }
}

/// Identity comparison of shared row sets.
pub fn same_rowset(a: &Arc<dyn RowSet>, b: &Arc<dyn RowSet>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
