//! Tablet recovery.
//!
//! Opening a tablet rebuilds it from its metadata log and WAL:
//!
//! 1. Replay the metadata log and bump the config sequence number.
//! 2. Delete row set and delta files the metadata does not reference; they
//!    belong to flushes or compactions that never committed.
//! 3. Move the WAL aside to `wal-recovery/` and replay it into a fresh
//!    MemRowSet and the committed row sets, writing every replayed
//!    operation to a new WAL with its new targets.
//! 4. Sync the new WAL and delete `wal-recovery/`.
//!
//! If recovery crashes, `wal-recovery/` is still the authoritative log; the
//! partially written new WAL is discarded and replay starts over.

use super::diskrowset::DiskRowSet;
use super::memrowset::MemRowSet;
use super::metadata::{MetadataEdit, TabletMetaState, TabletMetadata};
use super::rowset::{MutationTarget, RowSet};
use super::wal::{self, Log, LogOptions, LoggedChange, LoggedOp, WalBatch};
use super::{Tablet, ROWSET_DIR, WAL_DIR, WAL_RECOVERY_DIR};
use crate::config::TabletConfig;
use crate::error::Result;
use crate::mvcc::Clock;
use crate::Error;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub(crate) fn bootstrap(config: TabletConfig) -> Result<Tablet> {
    let dir = config.dir.clone();
    let metadata = TabletMetadata::open(&dir)?;

    let seqno = metadata.state().config_seqno + 1;
    metadata.commit(MetadataEdit::ChangeConfig { seqno })?;
    let state = metadata.state();

    let rowset_dir = dir.join(ROWSET_DIR);
    fs::create_dir_all(&rowset_dir)?;
    remove_orphan_files(&rowset_dir, &state)?;

    let rowsets = state
        .rowsets
        .values()
        .map(|meta| DiskRowSet::open(&rowset_dir, meta).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;

    let clock = Arc::new(Clock::new());
    clock.update(state.clock);
    let mrs = Arc::new(MemRowSet::new(state.last_durable_mrs_id + 1));

    let wal = recover_wal(&dir, &config, &state, &clock, &mrs, &rowsets)?;

    tracing::info!(
        tablet_id = %state.tablet_id,
        config_seqno = seqno,
        schema_version = state.schema_version,
        rowsets = rowsets.len(),
        mrs_rows = mrs.entry_count(),
        clock = clock.now().value(),
        "Tablet bootstrap completed"
    );

    let rowsets = rowsets
        .into_iter()
        .map(|rs| rs as Arc<dyn RowSet>)
        .collect();
    Ok(Tablet::from_parts(config, metadata, clock, mrs, rowsets, wal))
}

/// Which row set a file in the row set directory belongs to, if it is one.
fn parse_rowset_file(name: &str) -> Option<(u64, Option<u64>)> {
    if let Some(stem) = name.strip_suffix(".base") {
        return stem.parse().ok().map(|id| (id, None));
    }
    let stem = name.strip_suffix(".delta")?;
    let (rowset, delta) = stem.split_once('-')?;
    Some((rowset.parse().ok()?, Some(delta.parse().ok()?)))
}

fn remove_orphan_files(rowset_dir: &Path, state: &TabletMetaState) -> Result<()> {
    for entry in fs::read_dir(rowset_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let referenced = match parse_rowset_file(name) {
            Some((rowset_id, None)) => state.rowsets.contains_key(&rowset_id),
            Some((rowset_id, Some(delta_id))) => state
                .rowsets
                .get(&rowset_id)
                .is_some_and(|rs| rs.delta_ids.contains(&delta_id)),
            None => {
                tracing::warn!(path = %path.display(), "Ignoring unexpected file in row set directory");
                continue;
            }
        };
        if !referenced {
            tracing::info!(path = %path.display(), "Removing orphaned row set file");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn recover_wal(
    dir: &Path,
    config: &TabletConfig,
    state: &TabletMetaState,
    clock: &Clock,
    mrs: &MemRowSet,
    rowsets: &[Arc<DiskRowSet>],
) -> Result<Log> {
    let wal_dir = dir.join(WAL_DIR);
    let recovery_dir = dir.join(WAL_RECOVERY_DIR);

    if recovery_dir.exists() {
        // A previous recovery did not finish; its output is incomplete.
        if wal_dir.exists() {
            fs::remove_dir_all(&wal_dir)?;
        }
    } else if wal_dir.exists() {
        fs::rename(&wal_dir, &recovery_dir)?;
    }

    let log = Log::create(
        &wal_dir,
        LogOptions {
            buffer_size: config.wal_buffer_size,
            segment_size: config.wal_segment_size,
        },
    )?;

    if recovery_dir.exists() {
        let mut replayer = Replayer {
            state,
            mrs,
            rowsets: rowsets.iter().map(|rs| (rs.id(), rs.clone())).collect(),
            log: &log,
            stats: ReplayStats::default(),
        };
        for (segment_id, path) in wal::list_segments(&recovery_dir)? {
            for batch in wal::read_segment(&path)? {
                clock.update(batch.ts);
                replayer.replay_batch(batch)?;
            }
            tracing::debug!(segment = segment_id, "Replayed WAL segment");
        }
        log.sync()?;
        fs::remove_dir_all(&recovery_dir)?;

        let stats = replayer.stats;
        tracing::info!(
            tablet_id = %state.tablet_id,
            batches = stats.batches,
            applied = stats.applied,
            already_durable = stats.already_durable,
            orphaned = stats.orphaned,
            "WAL replay completed"
        );
    }

    Ok(log)
}

#[derive(Debug, Default)]
struct ReplayStats {
    batches: usize,
    applied: usize,
    already_durable: usize,
    orphaned: usize,
}

struct Replayer<'a> {
    state: &'a TabletMetaState,
    mrs: &'a MemRowSet,
    rowsets: HashMap<u64, Arc<DiskRowSet>>,
    log: &'a Log,
    stats: ReplayStats,
}

impl Replayer<'_> {
    fn exists(&self, target: &MutationTarget) -> bool {
        match target {
            MutationTarget::MemRowSet(_) => true,
            MutationTarget::DiskRowSet { rowset_id, .. } => self.rowsets.contains_key(rowset_id),
        }
    }

    fn replay_batch(&mut self, batch: WalBatch) -> Result<()> {
        self.stats.batches += 1;
        let mut ops = Vec::with_capacity(batch.ops.len());

        for op in batch.ops {
            if op.targets.iter().all(|t| self.state.is_durable(t)) {
                self.stats.already_durable += 1;
                continue;
            }
            // Targets that are neither durable nor present belong to a row
            // set whose flush or compaction never committed; the operation
            // is then also recorded against one of its inputs.
            let Some(target) = op
                .targets
                .iter()
                .find(|t| !self.state.is_durable(t) && self.exists(t))
                .copied()
            else {
                self.stats.orphaned += 1;
                continue;
            };

            let targets = self.apply(target, &op, batch.ts)?;
            self.stats.applied += 1;
            ops.push(LoggedOp {
                key: op.key,
                change: op.change,
                targets,
            });
        }

        self.log.roll_if_full()?;
        self.log.append(&WalBatch { ts: batch.ts, ops })
    }

    fn apply(
        &self,
        target: MutationTarget,
        op: &LoggedOp,
        ts: crate::mvcc::Timestamp,
    ) -> Result<Vec<MutationTarget>> {
        let corrupt = || {
            Error::Corruption(format!(
                "Cannot replay {} of key {:?} at {} into {:?}",
                match &op.change {
                    LoggedChange::Insert(_) => "insert",
                    LoggedChange::Mutate(change) => change.kind(),
                },
                op.key,
                ts,
                target
            ))
        };

        match (target, &op.change) {
            (MutationTarget::MemRowSet(_), LoggedChange::Insert(row)) => {
                self.mrs
                    .insert(op.key.clone(), ts, row.clone())
                    .map_err(|_| corrupt())?;
                Ok(vec![MutationTarget::MemRowSet(self.mrs.id())])
            }
            (MutationTarget::MemRowSet(_), LoggedChange::Mutate(change)) => {
                self.mrs.mutate_row(&op.key, ts, change)?.ok_or_else(corrupt)
            }
            (MutationTarget::DiskRowSet { rowset_id, .. }, LoggedChange::Mutate(change)) => {
                let rowset = self.rowsets.get(&rowset_id).ok_or_else(corrupt)?;
                rowset.mutate_row(&op.key, ts, change)?.ok_or_else(corrupt)
            }
            (MutationTarget::DiskRowSet { .. }, LoggedChange::Insert(_)) => Err(corrupt()),
        }
    }
}
