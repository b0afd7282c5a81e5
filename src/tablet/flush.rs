//! MemRowSet flush and delta flush.

use super::diskrowset::DiskRowSet;
use super::duplicating::DuplicatingRowSet;
use super::hooks::TabletHooks;
use super::memrowset::MemRowSet;
use super::metadata::MetadataEdit;
use super::metrics::TabletMetrics;
use super::rowset::RowSet;
use super::Tablet;
use crate::error::Result;
use crate::Error;

use std::sync::Arc;

/// Flush the active MemRowSet into a new disk row set.
///
/// 1. Swap in an empty MemRowSet; the frozen one stays readable and
///    mutable in the row set list.
/// 2. Take a clean MVCC snapshot and write the frozen rows as of it.
/// 3. Swap in a duplicating row set so mutations of frozen rows are also
///    recorded against the new row set.
/// 4. Reapply the mutations that committed between the snapshot and the
///    swap, flush the new row set's deltas and commit it to metadata.
/// 5. Replace the duplicating row set with the new row set.
pub(crate) fn flush(tablet: &Tablet) -> Result<()> {
    tablet.check_open()?;
    let _maintenance = tablet.maintenance.lock();
    tablet.check_maintenance()?;

    let Some(frozen) = tablet.swap_new_mem_rowset() else {
        tracing::debug!(tablet_id = %tablet.tablet_id(), "MemRowSet is empty; nothing to flush");
        return Ok(());
    };

    tracing::info!(
        tablet_id = %tablet.tablet_id(),
        mrs_id = frozen.id(),
        rows = frozen.entry_count(),
        bytes = frozen.estimated_size(),
        "Flushing MemRowSet"
    );

    let hooks = tablet.hooks();
    if let Err(e) = flush_frozen(tablet, &hooks, frozen) {
        tablet.fence_maintenance("flush", &e);
        return Err(e);
    }
    TabletMetrics::incr(&tablet.metrics.flushes);
    Ok(())
}

fn flush_frozen(tablet: &Tablet, hooks: &TabletHooks, frozen: Arc<MemRowSet>) -> Result<()> {
    // Segments written from here on only target the new MemRowSet.
    tablet.wal.roll()?;
    hooks.flush.post_swap_new_mem_rowset()?;

    let snapshot = tablet.mvcc.wait_for_clean_snapshot();
    tracing::debug!(tablet_id = %tablet.tablet_id(), %snapshot, "Took flush snapshot");
    hooks.common.post_take_mvcc_snapshot()?;

    let rowset_id = tablet.allocate_rowset_id();
    let rows = frozen.clone().iter(snapshot.clone())?;
    let output = Arc::new(DiskRowSet::write(&tablet.rowset_dir(), rowset_id, rows)?);
    hooks.common.post_write_snapshot()?;

    let input: Arc<dyn RowSet> = frozen.clone();
    let duplicating: Arc<dyn RowSet> =
        Arc::new(DuplicatingRowSet::new(vec![input.clone()], output.clone()));
    let boundary = tablet.swap_rowsets(&[input], duplicating.clone());
    tablet.mvcc.wait_for_all_committed_before(boundary);
    hooks.common.post_swap_in_duplicating_rowset()?;

    let missed = frozen.mutations_where(|ts| !snapshot.is_committed(ts) && ts < boundary);
    for mutation in &missed {
        output.mirror(&mutation.key, mutation.ts, &mutation.change)?;
    }
    tracing::debug!(
        tablet_id = %tablet.tablet_id(),
        rowset_id,
        missed = missed.len(),
        "Reapplied missed deltas"
    );
    hooks.common.post_reupdate_missed_deltas()?;

    output.flush_deltas(&tablet.mvcc)?;
    tablet.check_maintenance()?;
    tablet.metadata.commit(MetadataEdit::Flush {
        mrs_id: frozen.id(),
        rowset: output.meta(),
        next_rowset_id: tablet.peek_next_rowset_id(),
        clock: tablet.clock().now(),
    })?;

    tablet.swap_rowsets(&[duplicating], output.clone());
    hooks.common.post_swap_new_rowset()?;

    tracing::info!(
        tablet_id = %tablet.tablet_id(),
        mrs_id = frozen.id(),
        rowset_id,
        rows = output.row_count(),
        "Flushed MemRowSet"
    );
    Ok(())
}

/// Flush the delta memstore of one disk row set and commit the new file.
pub(crate) fn flush_rowset_deltas(tablet: &Tablet, rowset_id: u64) -> Result<Option<u64>> {
    tablet.check_open()?;
    let _maintenance = tablet.maintenance.lock();
    tablet.check_maintenance()?;

    let rowset = tablet
        .components()
        .disk_rowsets()
        .into_iter()
        .find(|rs| rs.id() == rowset_id)
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "Tablet {} has no row set {}",
                tablet.tablet_id(),
                rowset_id
            ))
        })?;

    let flushed = rowset.flush_deltas(&tablet.mvcc).and_then(|flushed| {
        let Some(delta_id) = flushed else {
            return Ok(None);
        };
        tablet.check_maintenance()?;
        tablet.metadata.commit(MetadataEdit::DeltaFlush {
            rowset_id,
            delta_id,
            next_dms_id: rowset.meta().next_dms_id,
            clock: tablet.clock().now(),
        })?;
        Ok(Some(delta_id))
    });

    match flushed {
        Ok(Some(delta_id)) => {
            tracing::info!(tablet_id = %tablet.tablet_id(), rowset_id, delta_id, "Flushed deltas");
            Ok(Some(delta_id))
        }
        Ok(None) => Ok(None),
        Err(e) => {
            tablet.fence_maintenance("delta flush", &e);
            Err(e)
        }
    }
}
