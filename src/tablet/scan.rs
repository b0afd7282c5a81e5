//! Snapshot scans over a tablet.

use super::filter::{resolve_predicates, ColumnRangePredicate, PredicateFilter};
use super::iterator::MergeIterator;
use super::metrics::TabletMetrics;
use super::rowset::RowSet;
use super::{Tablet, TabletComponents};
use crate::error::Result;
use crate::mvcc::MvccSnapshot;
use crate::schema::{Schema, Value};

use std::iter::Peekable;
use std::sync::Arc;

/// What a scan reads: the client's projection and optional range
/// predicates on any tablet column.
#[derive(Debug, Clone)]
pub struct ScanSpec {
    pub projection: Schema,
    pub predicates: Vec<ColumnRangePredicate>,
}

impl ScanSpec {
    pub fn new(projection: Schema) -> Self {
        Self {
            projection,
            predicates: Vec::new(),
        }
    }

    pub fn predicate(mut self, predicate: ColumnRangePredicate) -> Self {
        self.predicates.push(predicate);
        self
    }
}

/// Cursor over the rows of a tablet as of one MVCC snapshot, in key order.
///
/// Holds the row sets it reads, so a concurrent compaction retiring them
/// does not affect the scan.
pub struct TabletScanIter {
    projection: Schema,
    snapshot: MvccSnapshot,
    rows: Peekable<PredicateFilter<MergeIterator>>,
    _components: Arc<TabletComponents>,
}

impl TabletScanIter {
    /// The projection resolved against the tablet schema.
    pub fn projection(&self) -> &Schema {
        &self.projection
    }

    pub fn snapshot(&self) -> &MvccSnapshot {
        &self.snapshot
    }

    pub fn has_more(&mut self) -> bool {
        self.rows.peek().is_some()
    }

    /// Up to roughly `max_bytes` of projected rows. At least one row is
    /// returned while any remain, unless `max_bytes` is zero.
    pub fn next_batch(&mut self, max_bytes: usize) -> Result<Vec<Vec<Value>>> {
        let mut batch = Vec::new();
        if max_bytes == 0 {
            return Ok(batch);
        }

        let mut bytes = 0;
        while bytes < max_bytes {
            let Some(item) = self.rows.next() else {
                break;
            };
            let (_, row) = item?;
            let projected = self.projection.project_row(&row);
            bytes += projected.iter().map(Value::estimated_size).sum::<usize>();
            batch.push(projected);
        }
        Ok(batch)
    }
}

impl Tablet {
    /// Start a scan of everything committed as of now.
    pub fn new_scan(&self, spec: ScanSpec) -> Result<TabletScanIter> {
        self.check_open()?;
        let schema = self.schema();
        let projection = schema.resolve_projection(&spec.projection)?;
        let predicates = resolve_predicates(&schema, &spec.predicates)?;

        let components = self.components();
        let snapshot = self.mvcc.take_snapshot();
        // A batch that failed to reach the WAL stops the tablet before it
        // commits, so a snapshot taken after that must not be served.
        self.check_open()?;

        let mut iterators = Vec::with_capacity(components.rowsets.len() + 1);
        iterators.push(components.mrs.clone().iter(snapshot.clone())?);
        for rs in &components.rowsets {
            iterators.push(rs.clone().iter(snapshot.clone())?);
        }
        let rows = PredicateFilter::new(MergeIterator::new(iterators), predicates).peekable();

        TabletMetrics::incr(&self.metrics.scans_started);
        tracing::debug!(
            tablet_id = %self.tablet_id(),
            %snapshot,
            columns = projection.num_columns(),
            "Started scan"
        );
        Ok(TabletScanIter {
            projection,
            snapshot,
            rows,
            _components: components,
        })
    }
}
