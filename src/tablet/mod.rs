//! Tablet storage engine.
//!
//! A tablet stores one key range of a table. New rows go to the active
//! MemRowSet; once it grows large enough it is flushed into an immutable
//! disk row set, and disk row sets are merged by compaction. Updates and
//! deletes of rows that already left the MemRowSet land in the delta stores
//! of the disk row set holding them.
//!
//! ```text
//!          write batch
//!               │
//!      ┌────────┴────────┐
//!      ▼                 ▼
//!  ┌────────┐     ┌─────────────┐   inserts   ┌──────────────────┐
//!  │  WAL   │     │ MvccManager │ ──────────► │ Active MemRowSet │
//!  └────────┘     └─────────────┘             └──────────────────┘
//!                        │ updates/deletes            │ flush
//!                        ▼                            ▼
//!                 ┌─────────────────────────────────────────────┐
//!                 │ DiskRowSets (base rows + delta stores)      │
//!                 └─────────────────────────────────────────────┘
//!                                      │ compaction
//!                                      ▼
//!                              merged DiskRowSet
//! ```
//!
//! # Timestamps and visibility
//!
//! Every write batch is stamped with one timestamp from the tablet's
//! [`MvccManager`]. Writers are serialized while they apply, so WAL order is
//! timestamp order. A batch becomes visible to new snapshots once its WAL
//! record is synced and the transaction commits.
//!
//! # Flush and compaction hand-off
//!
//! Flush and compaction read their inputs at an MVCC snapshot, write the
//! output, then swap in a [`DuplicatingRowSet`] that mirrors later
//! mutations into the output. Mutations committed between the snapshot and
//! the swap are replayed into the output before it replaces the inputs.
//! Every step is reported to the installed [`hooks`].
//!
//! # Durability
//!
//! Layout changes are committed to the tablet [`metadata`] log. On open the
//! WAL is replayed, skipping every operation whose targets are already
//! durable in committed row sets.

pub mod bootstrap;
pub mod compaction;
pub mod delta;
pub mod diskrowset;
pub mod duplicating;
pub mod filter;
pub mod flush;
pub mod hooks;
pub mod iterator;
pub mod memrowset;
pub mod metadata;
pub mod metrics;
pub mod rowset;
pub mod scan;
pub mod wal;
pub mod wal_cleanup;
pub mod write;

pub use compaction::CompactionMode;
pub use diskrowset::DiskRowSet;
pub use duplicating::DuplicatingRowSet;
pub use filter::ColumnRangePredicate;
pub use hooks::{CompactionFaultHooks, FlushCompactCommonHooks, FlushFaultHooks, TabletHooks};
pub use memrowset::MemRowSet;
pub use metadata::{MetadataEdit, TabletMetaState, TabletMetadata};
pub use metrics::{MetricsSnapshot, TabletMetrics};
pub use rowset::{MutationTarget, RowSet};
pub use scan::{ScanSpec, TabletScanIter};
pub use write::{RowOp, WriteResult};

use crate::config::TabletConfig;
use crate::error::Result;
use crate::mvcc::{Clock, MvccManager, Timestamp};
use crate::schema::Schema;
use crate::Error;
use wal::Log;

use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const ROWSET_DIR: &str = "rowsets";
const WAL_DIR: &str = "wal";
const WAL_RECOVERY_DIR: &str = "wal-recovery";

/// The row sets a reader or writer works against, swapped atomically as a
/// whole by flush and compaction.
pub struct TabletComponents {
    pub mrs: Arc<MemRowSet>,
    pub rowsets: Vec<Arc<dyn RowSet>>,
}

impl TabletComponents {
    fn disk_rowsets(&self) -> Vec<Arc<DiskRowSet>> {
        self.rowsets
            .iter()
            .filter_map(|rs| rs.clone().as_disk())
            .collect()
    }
}

/// Identity of a new tablet.
#[derive(Debug, Clone)]
pub struct TabletInfo {
    pub tablet_id: String,
    pub table_id: String,
    pub table_name: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub schema: Schema,
}

pub struct Tablet {
    pub(crate) config: TabletConfig,
    tablet_id: String,
    pub(crate) metadata: TabletMetadata,
    schema: RwLock<Arc<Schema>>,
    clock: Arc<Clock>,
    pub(crate) mvcc: MvccManager,
    components: RwLock<Arc<TabletComponents>>,
    pub(crate) wal: Log,

    /// Serializes writers and schema changes.
    apply_lock: Mutex<()>,
    /// At most one flush, compaction or delta flush at a time.
    maintenance: Mutex<()>,
    /// Set when a hand-off failed after swapping in new row sets. The
    /// in-memory layout can then no longer be committed; reopening the
    /// tablet recovers it from the WAL.
    maintenance_failed: AtomicBool,
    next_mrs_id: AtomicU64,
    next_rowset_id: AtomicU64,

    hooks: RwLock<TabletHooks>,
    metrics: TabletMetrics,
    shut_down: AtomicBool,
}

impl Tablet {
    /// Create a tablet in an empty directory and open it.
    pub fn create(config: TabletConfig, info: TabletInfo) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        if TabletMetadata::exists(&config.dir) {
            return Err(Error::TabletAlreadyExists(info.tablet_id));
        }

        let schema = if info.schema.has_column_ids() {
            info.schema
        } else {
            info.schema.assign_column_ids()?
        };
        TabletMetadata::create(
            &config.dir,
            MetadataEdit::Create {
                tablet_id: info.tablet_id,
                table_id: info.table_id,
                table_name: info.table_name,
                start_key: info.start_key,
                end_key: info.end_key,
                schema,
            },
        )?;
        Self::open(config)
    }

    /// Open an existing tablet, recovering it from its metadata and WAL.
    pub fn open(config: TabletConfig) -> Result<Self> {
        bootstrap::bootstrap(config)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        config: TabletConfig,
        metadata: TabletMetadata,
        clock: Arc<Clock>,
        mrs: Arc<MemRowSet>,
        rowsets: Vec<Arc<dyn RowSet>>,
        wal: Log,
    ) -> Self {
        let state = metadata.state();
        let next_mrs_id = mrs.id() + 1;
        Self {
            tablet_id: state.tablet_id.clone(),
            schema: RwLock::new(Arc::new(state.schema.clone())),
            mvcc: MvccManager::new(clock.clone()),
            clock,
            components: RwLock::new(Arc::new(TabletComponents { mrs, rowsets })),
            wal,
            apply_lock: Mutex::new(()),
            maintenance: Mutex::new(()),
            maintenance_failed: AtomicBool::new(false),
            next_mrs_id: AtomicU64::new(next_mrs_id),
            next_rowset_id: AtomicU64::new(state.next_rowset_id),
            hooks: RwLock::new(TabletHooks::default()),
            metrics: TabletMetrics::default(),
            shut_down: AtomicBool::new(false),
            metadata,
            config,
        }
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.config.dir
    }

    pub(crate) fn rowset_dir(&self) -> PathBuf {
        self.config.dir.join(ROWSET_DIR)
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.schema.read().clone()
    }

    pub fn schema_version(&self) -> u32 {
        self.metadata.state().schema_version
    }

    pub fn config_seqno(&self) -> i64 {
        self.metadata.state().config_seqno
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &TabletMetrics {
        &self.metrics
    }

    pub fn components(&self) -> Arc<TabletComponents> {
        self.components.read().clone()
    }

    pub fn mrs_size(&self) -> usize {
        self.components().mrs.estimated_size()
    }

    pub fn num_rowsets(&self) -> usize {
        self.components().rowsets.len()
    }

    pub fn hooks(&self) -> TabletHooks {
        self.hooks.read().clone()
    }

    pub fn set_common_hooks(&self, hooks: Arc<dyn FlushCompactCommonHooks>) {
        self.hooks.write().common = hooks;
    }

    pub fn set_flush_hooks(&self, hooks: Arc<dyn FlushFaultHooks>) {
        self.hooks.write().flush = hooks;
    }

    pub fn set_compaction_hooks(&self, hooks: Arc<dyn CompactionFaultHooks>) {
        self.hooks.write().compaction = hooks;
    }

    /// Install `next` if it is exactly one version past the current schema.
    pub fn alter_schema(&self, schema: &Schema, version: u32) -> Result<()> {
        self.check_open()?;
        let _apply = self.apply_lock.lock();

        let current_version = self.schema_version();
        if version != current_version + 1 {
            return Err(Error::InvalidSchema(format!(
                "Tablet {} has schema version {}, cannot alter to version {}",
                self.tablet_id, current_version, version
            )));
        }

        let altered = self.schema().alter_to(schema)?;
        self.metadata.commit(MetadataEdit::AlterSchema {
            schema: altered.clone(),
            version,
        })?;
        *self.schema.write() = Arc::new(altered);

        tracing::info!(
            tablet_id = %self.tablet_id,
            schema_version = version,
            "Altered tablet schema"
        );
        Ok(())
    }

    /// Store a new config sequence number; it must exceed the current one.
    pub fn change_config(&self, seqno: i64) -> Result<()> {
        self.check_open()?;
        let current = self.config_seqno();
        if seqno <= current {
            return Err(Error::InvalidConfig(format!(
                "New config sequence number {} must be greater than the current {}",
                seqno, current
            )));
        }
        self.metadata.commit(MetadataEdit::ChangeConfig { seqno })?;
        tracing::info!(tablet_id = %self.tablet_id, seqno, "Changed tablet config");
        Ok(())
    }

    /// Whether the MemRowSet has outgrown the flush threshold.
    pub fn needs_flush(&self) -> bool {
        self.mrs_size() >= self.config.flush_threshold_bytes
    }

    /// Whether enough disk row sets accumulated for a background compaction.
    pub fn needs_compaction(&self) -> bool {
        compaction::needs_compaction(self)
    }

    /// Flush the active MemRowSet into a new disk row set.
    pub fn flush(&self) -> Result<()> {
        flush::flush(self)
    }

    pub fn compact(&self, mode: CompactionMode) -> Result<()> {
        compaction::compact(self, mode)
    }

    /// Flush the delta memstore of one disk row set.
    pub fn flush_deltas(&self, rowset_id: u64) -> Result<Option<u64>> {
        flush::flush_rowset_deltas(self, rowset_id)
    }

    /// Closed WAL segments whose records are all durable elsewhere.
    pub fn deletable_wal_segments(&self) -> Vec<u64> {
        wal_cleanup::deletable_segments(self)
    }

    pub fn cleanup_wal(&self) -> Result<usize> {
        wal_cleanup::cleanup_segments(self)
    }

    pub fn collect_metrics(&self) -> Result<()> {
        metrics::collect_metrics(self)
    }

    /// Stop accepting requests and make the WAL durable.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _apply = self.apply_lock.lock();
        self.wal.sync()?;
        tracing::info!(tablet_id = %self.tablet_id, "Tablet shut down");
        Ok(())
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(Error::ShutDown)
        } else {
            Ok(())
        }
    }

    fn allocate_rowset_id(&self) -> u64 {
        self.next_rowset_id.fetch_add(1, Ordering::SeqCst)
    }

    fn peek_next_rowset_id(&self) -> u64 {
        self.next_rowset_id.load(Ordering::SeqCst)
    }

    fn check_maintenance(&self) -> Result<()> {
        if self.maintenance_failed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(format!(
                "Tablet {} must be reopened after a failed flush or compaction",
                self.tablet_id
            )));
        }
        Ok(())
    }

    /// Stop serving after a batch was applied in memory but could not be
    /// made durable. Readers must not observe it and no flush may persist
    /// it; reopening recovers the tablet from what the WAL holds.
    fn fence_failed_wal(&self, ts: Timestamp, error: &Error) {
        self.maintenance_failed.store(true, Ordering::SeqCst);
        self.shut_down.store(true, Ordering::SeqCst);
        tracing::error!(
            tablet_id = %self.tablet_id,
            ts = ts.value(),
            error = %error,
            "WAL write failed; tablet stopped until reopen"
        );
    }

    fn fence_maintenance(&self, operation: &str, error: &Error) {
        self.maintenance_failed.store(true, Ordering::SeqCst);
        tracing::error!(
            tablet_id = %self.tablet_id,
            operation,
            error = %error,
            "Row set hand-off failed; maintenance disabled until reopen"
        );
    }

    /// Freeze the active MemRowSet into the row set list and start a new
    /// one. Returns the frozen MemRowSet, or `None` if it was empty.
    fn swap_new_mem_rowset(&self) -> Option<Arc<MemRowSet>> {
        let mut components = self.components.write();
        if components.mrs.is_empty() {
            return None;
        }
        let frozen = components.mrs.clone();
        let mrs = Arc::new(MemRowSet::new(self.next_mrs_id.fetch_add(1, Ordering::SeqCst)));
        let mut rowsets = components.rowsets.clone();
        rowsets.push(frozen.clone());
        *components = Arc::new(TabletComponents { mrs, rowsets });
        Some(frozen)
    }

    /// Replace `old` with `new` in the row set list.
    ///
    /// Returns the MVCC boundary at the swap: every write applied against
    /// the previous layout has a lower timestamp, every later one does not.
    fn swap_rowsets(&self, old: &[Arc<dyn RowSet>], new: Arc<dyn RowSet>) -> Timestamp {
        let mut components = self.components.write();
        let rowsets = components
            .rowsets
            .iter()
            .filter(|rs| !old.iter().any(|o| rowset::same_rowset(rs, o)))
            .cloned()
            .chain(std::iter::once(new))
            .collect();
        *components = Arc::new(TabletComponents {
            mrs: components.mrs.clone(),
            rowsets,
        });
        self.mvcc.take_snapshot().boundary()
    }
}

impl std::fmt::Debug for Tablet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tablet")
            .field("tablet_id", &self.tablet_id)
            .field("dir", &self.config.dir)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::schema::{DataType, SchemaBuilder, Value};

    pub fn test_schema() -> Schema {
        SchemaBuilder::new()
            .add_key_column("key", DataType::UInt32)
            .add_column("int_val", DataType::UInt32, false)
            .add_column("string_val", DataType::String, true)
            .build()
            .unwrap()
    }

    pub fn create_test_tablet(dir: &std::path::Path) -> Result<Tablet> {
        Tablet::create(
            TabletConfig::new(dir),
            TabletInfo {
                tablet_id: "test-tablet".to_string(),
                table_id: "test-table".to_string(),
                table_name: "test".to_string(),
                start_key: Vec::new(),
                end_key: Vec::new(),
                schema: test_schema(),
            },
        )
    }

    pub fn insert(tablet: &Tablet, key: u32, val: u32) -> Result<WriteResult> {
        tablet.write(
            &test_schema(),
            vec![RowOp::Insert(vec![
                Value::UInt32(key),
                Value::UInt32(val),
                Value::Null,
            ])],
        )
    }

    pub fn update(tablet: &Tablet, key: u32, val: u32) -> Result<WriteResult> {
        tablet.write(
            &test_schema(),
            vec![RowOp::Mutate {
                key: vec![Value::UInt32(key)],
                mutation: crate::encoding::mutation::ClientMutation::Update(vec![(
                    1,
                    Value::UInt32(val),
                )]),
            }],
        )
    }

    /// `(key, int_val)` pairs visible to a fresh snapshot.
    pub fn scan_pairs(tablet: &Tablet) -> Result<Vec<(u32, u32)>> {
        let projection = SchemaBuilder::new()
            .add_key_column("key", DataType::UInt32)
            .add_column("int_val", DataType::UInt32, false)
            .build()?;
        let mut iter = tablet.new_scan(ScanSpec::new(projection))?;
        let rows = iter.next_batch(usize::MAX)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match (&row[0], &row[1]) {
                (Value::UInt32(k), Value::UInt32(v)) => Some((*k, *v)),
                _ => None,
            })
            .collect())
    }
}
