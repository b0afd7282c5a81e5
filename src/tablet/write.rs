//! Write path: apply a batch of row operations under one timestamp.

use super::memrowset::InsertOutcome;
use super::metrics::TabletMetrics;
use super::rowset::{MutationTarget, RowSet};
use super::wal::{LoggedChange, LoggedOp, WalBatch};
use super::{Tablet, TabletComponents};
use crate::encoding::mutation::ClientMutation;
use crate::error::Result;
use crate::mvcc::Timestamp;
use crate::schema::{RowChange, Schema, Value};
use crate::Error;

/// One operation of a write batch, with values laid out by the client schema.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    Insert(Vec<Value>),
    /// Mutate the row whose key columns hold `key`, in key column order.
    Mutate {
        key: Vec<Value>,
        mutation: ClientMutation,
    },
}

#[derive(Debug)]
pub struct WriteResult {
    pub timestamp: Timestamp,
    /// Failed operations by position in the batch.
    pub row_errors: Vec<(usize, Error)>,
    pub rows_applied: usize,
}

impl WriteResult {
    pub fn is_ok(&self) -> bool {
        self.row_errors.is_empty()
    }
}

impl Tablet {
    /// Apply `ops` as one transaction.
    ///
    /// A client schema the tablet cannot accept fails the whole batch.
    /// Otherwise each operation succeeds or fails on its own, and the
    /// batch is durable in the WAL before this returns.
    ///
    /// If the batch cannot be logged the tablet stops serving requests
    /// until it is reopened.
    pub fn write(&self, client_schema: &Schema, ops: Vec<RowOp>) -> Result<WriteResult> {
        self.check_open()?;
        let apply = self.apply_lock.lock();
        let schema = self.schema();
        schema.validate_client_write_schema(client_schema)?;
        self.wal.roll_if_full()?;

        let components = self.components.read();
        let ts = self.mvcc.start_transaction();

        let mut logged = Vec::with_capacity(ops.len());
        let mut row_errors = Vec::new();
        for (idx, op) in ops.into_iter().enumerate() {
            match apply_op(&components, &schema, client_schema, ts, op) {
                Ok(op) => {
                    match &op.change {
                        LoggedChange::Insert(_) | LoggedChange::Mutate(RowChange::Reinsert(_)) => {
                            TabletMetrics::incr(&self.metrics.rows_inserted)
                        }
                        LoggedChange::Mutate(_) => TabletMetrics::incr(&self.metrics.rows_updated),
                    }
                    logged.push(op);
                }
                Err(e) => row_errors.push((idx, e)),
            }
        }

        // Batches with no surviving operation are still logged so their
        // timestamp is never handed out again after a restart.
        let rows_applied = logged.len();
        let appended = self.wal.append(&WalBatch { ts, ops: logged });
        drop(components);
        drop(apply);

        let durable = appended.and_then(|_| self.wal.sync());
        if let Err(e) = &durable {
            self.fence_failed_wal(ts, e);
        }
        self.mvcc.commit(ts);
        durable?;

        tracing::trace!(
            tablet_id = %self.tablet_id(),
            ts = ts.value(),
            rows_applied,
            row_errors = row_errors.len(),
            "Applied write batch"
        );
        Ok(WriteResult {
            timestamp: ts,
            row_errors,
            rows_applied,
        })
    }
}

fn apply_op(
    components: &TabletComponents,
    schema: &Schema,
    client_schema: &Schema,
    ts: Timestamp,
    op: RowOp,
) -> Result<LoggedOp> {
    match op {
        RowOp::Insert(values) => {
            let row = schema.row_from_client(client_schema, &values)?;
            let key = schema.encode_row_key(&row)?;
            let present = || Error::AlreadyPresent(format!("key already present: {}", schema.debug_key(&key)));

            for rs in &components.rowsets {
                if rs.check_row_present(&key)? {
                    return Err(present());
                }
            }
            let change = match components.mrs.insert(key.clone(), ts, row.clone()) {
                Ok(InsertOutcome::Inserted) => LoggedChange::Insert(row),
                Ok(InsertOutcome::Reinserted) => LoggedChange::Mutate(RowChange::Reinsert(row)),
                Err(Error::AlreadyPresent(_)) => return Err(present()),
                Err(e) => return Err(e),
            };
            Ok(LoggedOp {
                key,
                change,
                targets: vec![MutationTarget::MemRowSet(components.mrs.id())],
            })
        }
        RowOp::Mutate { key, mutation } => {
            let key = schema.encode_key(&key)?;
            let change = resolve_mutation(schema, client_schema, mutation)?;

            let targets = match components.mutate_row(&key, ts, &change)? {
                Some(targets) => targets,
                None => {
                    return Err(Error::NotFound(format!(
                        "key not found: {}",
                        schema.debug_key(&key)
                    )))
                }
            };
            Ok(LoggedOp {
                key,
                change: LoggedChange::Mutate(change),
                targets,
            })
        }
    }
}

/// Map a client mutation onto tablet column ids.
fn resolve_mutation(
    schema: &Schema,
    client_schema: &Schema,
    mutation: ClientMutation,
) -> Result<RowChange> {
    match mutation {
        ClientMutation::Delete => Ok(RowChange::Delete),
        ClientMutation::Update(cells) => {
            if cells.is_empty() {
                return Err(Error::InvalidMutation(
                    "Update must change at least one column".to_string(),
                ));
            }
            let mut resolved = Vec::with_capacity(cells.len());
            for (client_idx, value) in cells {
                let name = &client_schema
                    .columns()
                    .get(client_idx)
                    .ok_or_else(|| {
                        Error::InvalidMutation(format!(
                            "No column at index {} in a schema of {} columns",
                            client_idx,
                            client_schema.num_columns()
                        ))
                    })?
                    .name;
                let idx = schema.find_column(name).ok_or_else(|| {
                    Error::MismatchedSchema(format!("Column {} not present in tablet", name))
                })?;
                if idx < schema.num_key_columns() {
                    return Err(Error::InvalidMutation(format!(
                        "Cannot update key column {}",
                        name
                    )));
                }
                schema.column(idx).check_value(&value)?;
                let id = schema.column_id(idx).ok_or_else(|| {
                    Error::InvalidState("Tablet schema is missing column ids".to_string())
                })?;
                resolved.push((id, value));
            }
            Ok(RowChange::Update(resolved))
        }
    }
}

impl TabletComponents {
    /// Apply a mutation to whichever row set holds the live row.
    fn mutate_row(
        &self,
        key: &[u8],
        ts: Timestamp,
        change: &RowChange,
    ) -> Result<Option<Vec<MutationTarget>>> {
        if let Some(targets) = self.mrs.mutate_row(key, ts, change)? {
            return Ok(Some(targets));
        }
        for rs in &self.rowsets {
            if let Some(targets) = rs.mutate_row(key, ts, change)? {
                return Ok(Some(targets));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::super::{ScanSpec, TabletInfo};
    use super::*;
    use crate::config::TabletConfig;
    use crate::error::TabletServerErrorCode;
    use tempfile::TempDir;

    #[test]
    fn test_duplicate_insert_in_batch() -> Result<()> {
        let dir = TempDir::new()?;
        let tablet = create_test_tablet(dir.path())?;

        let row = |k: u32| RowOp::Insert(vec![Value::UInt32(k), Value::UInt32(k), Value::Null]);
        let result = tablet.write(&test_schema(), vec![row(1), row(2), row(1)])?;
        assert_eq!(result.rows_applied, 2);
        assert_eq!(result.row_errors.len(), 1);
        let (idx, err) = &result.row_errors[0];
        assert_eq!(*idx, 2);
        assert!(matches!(err, Error::AlreadyPresent(msg) if msg.contains("(1)")));
        assert_eq!(tablet.metrics().snapshot().rows_inserted, 2);
        Ok(())
    }

    #[test]
    fn test_update_delete_and_reinsert() -> Result<()> {
        let dir = TempDir::new()?;
        let tablet = create_test_tablet(dir.path())?;

        insert(&tablet, 1, 10)?;
        update(&tablet, 1, 11)?;
        assert_eq!(scan_pairs(&tablet)?, vec![(1, 11)]);

        let delete = RowOp::Mutate {
            key: vec![Value::UInt32(1)],
            mutation: ClientMutation::Delete,
        };
        assert!(tablet.write(&test_schema(), vec![delete.clone()])?.is_ok());
        assert!(scan_pairs(&tablet)?.is_empty());

        let again = tablet.write(&test_schema(), vec![delete])?;
        assert!(matches!(again.row_errors[0].1, Error::NotFound(_)));

        insert(&tablet, 1, 12)?;
        assert_eq!(scan_pairs(&tablet)?, vec![(1, 12)]);

        let metrics = tablet.metrics().snapshot();
        assert_eq!(metrics.rows_inserted, 2);
        assert_eq!(metrics.rows_updated, 2);
        Ok(())
    }

    #[test]
    fn test_update_key_column_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let tablet = create_test_tablet(dir.path())?;
        insert(&tablet, 1, 10)?;

        let result = tablet.write(
            &test_schema(),
            vec![RowOp::Mutate {
                key: vec![Value::UInt32(1)],
                mutation: ClientMutation::Update(vec![(0, Value::UInt32(2))]),
            }],
        )?;
        assert!(matches!(result.row_errors[0].1, Error::InvalidMutation(_)));
        Ok(())
    }

    #[test]
    fn test_update_unknown_column_index_is_row_error() -> Result<()> {
        let dir = TempDir::new()?;
        let tablet = create_test_tablet(dir.path())?;
        insert(&tablet, 1, 10)?;

        let result = tablet.write(
            &test_schema(),
            vec![RowOp::Mutate {
                key: vec![Value::UInt32(1)],
                mutation: ClientMutation::Update(vec![(9, Value::UInt32(5))]),
            }],
        )?;
        assert_eq!(result.rows_applied, 0);
        assert!(matches!(result.row_errors[0].1, Error::InvalidMutation(_)));

        // The batch committed, so maintenance is not left waiting on it.
        assert_eq!(tablet.mvcc.in_flight_count(), 0);
        tablet.flush()?;
        assert_eq!(scan_pairs(&tablet)?, vec![(1, 10)]);
        Ok(())
    }

    #[test]
    fn test_bad_values_fail_only_their_row() -> Result<()> {
        let dir = TempDir::new()?;
        let tablet = create_test_tablet(dir.path())?;

        let result = tablet.write(
            &test_schema(),
            vec![
                RowOp::Insert(vec![Value::UInt32(1), Value::UInt32(1), Value::Null]),
                RowOp::Insert(vec![Value::UInt32(2), Value::Null, Value::Null]),
                RowOp::Insert(vec![Value::UInt32(3), Value::String("x".into()), Value::Null]),
                RowOp::Insert(vec![Value::UInt32(4)]),
                RowOp::Mutate {
                    key: vec![Value::UInt32(1), Value::UInt32(1)],
                    mutation: ClientMutation::Delete,
                },
            ],
        )?;
        assert_eq!(result.rows_applied, 1);
        let errors: Vec<_> = result.row_errors.iter().map(|(idx, e)| (*idx, e.code())).collect();
        assert_eq!(
            errors,
            vec![
                (1, Some(TabletServerErrorCode::InvalidMutation)),
                (2, Some(TabletServerErrorCode::MismatchedSchema)),
                (3, Some(TabletServerErrorCode::MismatchedSchema)),
                (4, Some(TabletServerErrorCode::InvalidMutation)),
            ]
        );
        assert_eq!(scan_pairs(&tablet)?, vec![(1, 1)]);
        Ok(())
    }

    #[test]
    fn test_failed_wal_sync_stops_tablet() -> Result<()> {
        let dir = TempDir::new()?;
        let tablet = create_test_tablet(dir.path())?;
        insert(&tablet, 1, 10)?;

        tablet.wal.fail_syncs();
        assert!(matches!(insert(&tablet, 2, 20), Err(Error::Io(_))));
        assert_eq!(tablet.mvcc.in_flight_count(), 0);

        assert!(matches!(insert(&tablet, 3, 30), Err(Error::ShutDown)));
        assert!(matches!(tablet.flush(), Err(Error::ShutDown)));
        assert!(matches!(
            tablet.new_scan(ScanSpec::new(test_schema())),
            Err(Error::ShutDown)
        ));
        drop(tablet);

        let tablet = Tablet::open(TabletConfig::new(dir.path()))?;
        let pairs = scan_pairs(&tablet)?;
        assert_eq!(pairs[0], (1, 10));
        assert!(pairs.iter().all(|(key, _)| *key != 3));
        Ok(())
    }

    #[test]
    fn test_full_segment_rolls_before_batch() -> Result<()> {
        let dir = TempDir::new()?;
        let info = TabletInfo {
            tablet_id: "rolling".to_string(),
            table_id: "table".to_string(),
            table_name: "table".to_string(),
            start_key: Vec::new(),
            end_key: Vec::new(),
            schema: test_schema(),
        };
        let tablet = Tablet::create(TabletConfig::new(dir.path()).wal_segment_size(1), info)?;

        for key in 1..=3 {
            insert(&tablet, key, key)?;
        }
        let segments = tablet.wal.segment_ids();
        assert_eq!(segments.len(), 3);
        for (segment_id, path) in super::super::wal::list_segments(tablet.wal.dir())? {
            assert_eq!(super::super::wal::read_segment(&path)?.len(), 1, "segment {}", segment_id);
        }
        drop(tablet);

        let tablet = Tablet::open(TabletConfig::new(dir.path()).wal_segment_size(1))?;
        assert_eq!(scan_pairs(&tablet)?, vec![(1, 1), (2, 2), (3, 3)]);
        Ok(())
    }

    #[test]
    fn test_timestamps_increase() -> Result<()> {
        let dir = TempDir::new()?;
        let tablet = create_test_tablet(dir.path())?;
        let first = insert(&tablet, 1, 1)?.timestamp;
        let second = insert(&tablet, 2, 2)?.timestamp;
        assert!(second > first);
        assert_eq!(tablet.clock().now(), second);
        Ok(())
    }
}
