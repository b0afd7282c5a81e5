//! Disk row set compaction.
//!
//! Compaction merges several disk row sets, with their deltas applied as of
//! an MVCC snapshot, into one new row set. Rows deleted as of the snapshot
//! are dropped. The hand-off to the output follows the same protocol as a
//! flush: a duplicating row set mirrors mutations into the output while
//! the mutations that raced the snapshot are reapplied, then the output is
//! committed and replaces its inputs.

use super::diskrowset::DiskRowSet;
use super::duplicating::DuplicatingRowSet;
use super::hooks::TabletHooks;
use super::iterator::MergeIterator;
use super::metadata::MetadataEdit;
use super::metrics::TabletMetrics;
use super::rowset::RowSet;
use super::Tablet;
use crate::error::Result;

use itertools::Itertools as _;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionMode {
    /// Compact only when the policy's minimum number of row sets is reached.
    #[default]
    Normal,
    /// Merge every disk row set, even a single one.
    ForceAll,
}

pub fn needs_compaction(tablet: &Tablet) -> bool {
    !select_inputs(tablet, CompactionMode::Normal).is_empty()
}

/// Pick the row sets to merge: for a normal compaction the smallest ones,
/// at most `max_rowsets` of them.
fn select_inputs(tablet: &Tablet, mode: CompactionMode) -> Vec<Arc<DiskRowSet>> {
    let config = &tablet.config.compaction;
    let rowsets = tablet.components().disk_rowsets();
    match mode {
        CompactionMode::ForceAll => rowsets,
        CompactionMode::Normal => {
            if rowsets.len() < config.min_rowsets.max(2) {
                return Vec::new();
            }
            rowsets
                .into_iter()
                .sorted_by_key(|rs| rs.estimated_size())
                .take(config.max_rowsets.max(2))
                .collect()
        }
    }
}

pub(crate) fn compact(tablet: &Tablet, mode: CompactionMode) -> Result<()> {
    tablet.check_open()?;
    let _maintenance = tablet.maintenance.lock();
    tablet.check_maintenance()?;

    let inputs = select_inputs(tablet, mode);
    if inputs.is_empty() {
        return Ok(());
    }
    let input_ids = inputs.iter().map(|rs| rs.id()).collect_vec();
    tracing::info!(
        tablet_id = %tablet.tablet_id(),
        ?mode,
        inputs = ?input_ids,
        "Starting compaction"
    );

    let hooks = tablet.hooks();
    let output_id = tablet.allocate_rowset_id();
    let output = match write_output(tablet, &hooks, &inputs, output_id) {
        Ok(written) => written,
        Err(e) => {
            let path = DiskRowSet::base_path(&tablet.rowset_dir(), output_id);
            if let Err(remove_err) = std::fs::remove_file(&path) {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %remove_err, "Failed to remove compaction output");
                }
            }
            return Err(e);
        }
    };

    if let Err(e) = hand_off(tablet, &hooks, &inputs, output) {
        tablet.fence_maintenance("compaction", &e);
        return Err(e);
    }
    TabletMetrics::incr(&tablet.metrics.compactions);
    Ok(())
}

struct CompactionOutput {
    rowset: Arc<DiskRowSet>,
    snapshot: crate::mvcc::MvccSnapshot,
}

fn write_output(
    tablet: &Tablet,
    hooks: &TabletHooks,
    inputs: &[Arc<DiskRowSet>],
    output_id: u64,
) -> Result<CompactionOutput> {
    let snapshot = tablet.mvcc.take_snapshot();
    tracing::debug!(tablet_id = %tablet.tablet_id(), %snapshot, "Took compaction snapshot");
    hooks.common.post_take_mvcc_snapshot()?;

    let iterators = inputs
        .iter()
        .map(|rs| rs.clone().iter(snapshot.clone()))
        .collect::<Result<Vec<_>>>()?;
    let merged = MergeIterator::new(iterators);
    hooks.compaction.post_select_iterators()?;

    let rowset = Arc::new(DiskRowSet::write(&tablet.rowset_dir(), output_id, merged)?);
    hooks.common.post_write_snapshot()?;
    Ok(CompactionOutput { rowset, snapshot })
}

fn hand_off(
    tablet: &Tablet,
    hooks: &TabletHooks,
    inputs: &[Arc<DiskRowSet>],
    output: CompactionOutput,
) -> Result<()> {
    let CompactionOutput { rowset, snapshot } = output;

    let old: Vec<Arc<dyn RowSet>> = inputs
        .iter()
        .map(|rs| rs.clone() as Arc<dyn RowSet>)
        .collect();
    let duplicating: Arc<dyn RowSet> = Arc::new(DuplicatingRowSet::new(old.clone(), rowset.clone()));
    let boundary = tablet.swap_rowsets(&old, duplicating.clone());
    tablet.mvcc.wait_for_all_committed_before(boundary);
    hooks.common.post_swap_in_duplicating_rowset()?;

    let mut missed = 0;
    for input in inputs {
        for mutation in input.mutations_where(|ts| !snapshot.is_committed(ts) && ts < boundary) {
            rowset.mirror(&mutation.key, mutation.ts, &mutation.change)?;
            missed += 1;
        }
    }
    tracing::debug!(tablet_id = %tablet.tablet_id(), rowset_id = rowset.id(), missed, "Reapplied missed deltas");
    hooks.common.post_reupdate_missed_deltas()?;

    rowset.flush_deltas(&tablet.mvcc)?;
    tablet.check_maintenance()?;
    tablet.metadata.commit(MetadataEdit::Compaction {
        removed: inputs.iter().map(|rs| rs.id()).collect(),
        added: rowset.meta(),
        next_rowset_id: tablet.peek_next_rowset_id(),
        clock: tablet.clock().now(),
    })?;

    tablet.swap_rowsets(&[duplicating], rowset.clone());
    // Scanners still holding an input keep reading its loaded rows.
    for input in inputs {
        input.delete_files();
    }
    hooks.common.post_swap_new_rowset()?;

    tracing::info!(
        tablet_id = %tablet.tablet_id(),
        rowset_id = rowset.id(),
        inputs = inputs.len(),
        rows = rowset.row_count(),
        "Compaction finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::config::{CompactionConfig, TabletConfig};
    use crate::schema::Value;
    use crate::tablet::{RowOp, TabletInfo};
    use tempfile::TempDir;

    fn flushed_rowsets(tablet: &Tablet, first: u32, count: u32) -> Result<()> {
        for i in first..first + count {
            assert!(insert(tablet, i * 2, i)?.is_ok());
            assert!(insert(tablet, i * 2 + 1, i)?.is_ok());
            tablet.flush()?;
        }
        Ok(())
    }

    #[test]
    fn test_normal_compaction_needs_min_rowsets() -> Result<()> {
        let dir = TempDir::new()?;
        let tablet = Tablet::create(
            TabletConfig::new(dir.path()).compaction(CompactionConfig {
                min_rowsets: 3,
                max_rowsets: 8,
            }),
            TabletInfo {
                tablet_id: "t".to_string(),
                table_id: "t".to_string(),
                table_name: "t".to_string(),
                start_key: Vec::new(),
                end_key: Vec::new(),
                schema: test_schema(),
            },
        )?;

        flushed_rowsets(&tablet, 0, 2)?;
        assert!(!tablet.needs_compaction());
        tablet.compact(CompactionMode::Normal)?;
        assert_eq!(tablet.num_rowsets(), 2);

        flushed_rowsets(&tablet, 2, 1)?;
        assert_eq!(tablet.num_rowsets(), 3);
        assert!(tablet.needs_compaction());
        tablet.compact(CompactionMode::Normal)?;
        assert_eq!(tablet.num_rowsets(), 1);
        assert_eq!(tablet.metrics().snapshot().compactions, 1);
        Ok(())
    }

    #[test]
    fn test_force_all_drops_deleted_rows() -> Result<()> {
        let dir = TempDir::new()?;
        let tablet = create_test_tablet(dir.path())?;
        for k in 1..=4 {
            insert(&tablet, k, k)?;
        }
        tablet.flush()?;
        tablet.write(
            &test_schema(),
            vec![RowOp::Mutate {
                key: vec![Value::UInt32(2)],
                mutation: crate::encoding::mutation::ClientMutation::Delete,
            }],
        )?;
        update(&tablet, 3, 30)?;

        tablet.compact(CompactionMode::ForceAll)?;
        let rowsets = tablet.components().disk_rowsets();
        assert_eq!(rowsets.len(), 1);
        assert_eq!(rowsets[0].row_count(), 3);
        assert_eq!(scan_pairs(&tablet)?, vec![(1, 1), (3, 30), (4, 4)]);

        drop(rowsets);
        drop(tablet);
        let tablet = Tablet::open(TabletConfig::new(dir.path()))?;
        assert_eq!(scan_pairs(&tablet)?, vec![(1, 1), (3, 30), (4, 4)]);
        Ok(())
    }
}
