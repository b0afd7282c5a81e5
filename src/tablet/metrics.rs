use super::rowset::RowSet;
use super::Tablet;
use crate::error::Result;

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-tablet operation counters.
#[derive(Debug, Default)]
pub struct TabletMetrics {
    pub rows_inserted: AtomicU64,
    pub rows_updated: AtomicU64,
    pub flushes: AtomicU64,
    pub compactions: AtomicU64,
    pub scans_started: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub flushes: u64,
    pub compactions: u64,
    pub scans_started: u64,
}

impl TabletMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            rows_updated: self.rows_updated.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            scans_started: self.scans_started.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Log the tablet's counters and layout
pub fn collect_metrics(tablet: &Tablet) -> Result<()> {
    let metrics = tablet.metrics().snapshot();
    let components = tablet.components();
    let rowset_count = components.rowsets.len();
    let rowset_sizes: Vec<usize> = components
        .rowsets
        .iter()
        .map(|rs| rs.estimated_size())
        .collect();

    tracing::info!(
        tablet_id = %tablet.tablet_id(),
        rows_inserted = metrics.rows_inserted,
        rows_updated = metrics.rows_updated,
        flushes = metrics.flushes,
        compactions = metrics.compactions,
        scans_started = metrics.scans_started,
        mrs_id = components.mrs.id(),
        mrs_size = tablet.mrs_size(),
        rowset_count,
        ?rowset_sizes,
        clock = tablet.clock().now().value(),
        "Tablet metrics"
    );

    Ok(())
}
