//! Tablet server request surface.
//!
//! [`TabletServer`] hosts the tablets of one data directory and serves the
//! already-decoded requests of the RPC layer: writes, scans, schema and
//! config changes, and tablet creation and deletion.

pub mod scanner;
pub mod tablet_manager;
pub mod tasks;
pub mod types;

pub use scanner::{Scanner, ScannerManager};
pub use tablet_manager::TabletManager;
pub use types::{
    AlterSchemaRequest, ChangeConfigRequest, CreateTabletRequest, DeleteTabletRequest,
    NewScanRequest, PerRowError, ScanRequest, ScanResponse, StatusResponse, TabletServerError,
    WriteRequest, WriteResponse,
};

use crate::config::ServerConfig;
use crate::encoding::mutation::decode_mutations;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::tablet::{RowOp, ScanSpec, TabletInfo};
use crate::Error;
use tasks::{CompactionTask, FlushTask, MetricsTask, ScannerGcTask, WalCleanupTask};

use std::sync::Arc;

/// Report an application failure inside the response built by `respond`;
/// internal failures stay errors of the call.
fn into_response<T>(result: Result<T>, respond: impl FnOnce(TabletServerError) -> T) -> Result<T> {
    match result {
        Ok(resp) => Ok(resp),
        Err(e) => Ok(respond(TabletServerError::from_error(e)?)),
    }
}

fn status(result: Result<()>) -> Result<StatusResponse> {
    into_response(result.map(|_| StatusResponse::default()), |error| StatusResponse {
        error: Some(error),
    })
}

pub struct TabletServer {
    config: ServerConfig,
    tablets: TabletManager,
    scanners: ScannerManager,
}

impl TabletServer {
    pub fn open(config: ServerConfig) -> Result<Self> {
        let tablets = TabletManager::open(config.clone())?;
        let scanners = ScannerManager::new(config.scanner_ttl);
        Ok(Self {
            config,
            tablets,
            scanners,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tablet_manager(&self) -> &TabletManager {
        &self.tablets
    }

    pub fn scanner_manager(&self) -> &ScannerManager {
        &self.scanners
    }

    /// Register the periodic flush, compaction, scanner GC, WAL cleanup and
    /// metrics tasks. The caller owns the returned scheduler and shuts it
    /// down before the server.
    pub fn start_background_tasks(self: &Arc<Self>) -> Scheduler {
        let scheduler = Scheduler::new();
        scheduler
            .register(Arc::new(FlushTask::new(self.clone())))
            .register(Arc::new(CompactionTask::new(self.clone())))
            .register(Arc::new(ScannerGcTask::new(self.clone())))
            .register(Arc::new(WalCleanupTask::new(self.clone())))
            .register(Arc::new(MetricsTask::new(self.clone())));
        scheduler
    }

    /// Apply the inserts and mutations of one request as one batch.
    ///
    /// Schema problems and a malformed mutation buffer fail the whole
    /// request before anything is applied. Row-level failures are reported
    /// by row index, inserts first and mutations after them.
    pub fn write(&self, req: WriteRequest) -> Result<WriteResponse> {
        into_response(self.try_write(req), |error| WriteResponse {
            error: Some(error),
            ..Default::default()
        })
    }

    fn try_write(&self, req: WriteRequest) -> Result<WriteResponse> {
        let tablet = self.tablets.lookup(&req.tablet_id)?;
        tablet.schema().validate_client_write_schema(&req.schema)?;

        let mutations = decode_mutations(&req.encoded_mutations, &req.schema)?;
        if mutations.len() != req.mutate_row_keys.len() {
            return Err(Error::InvalidMutation(format!(
                "Got {} mutations for {} row keys",
                mutations.len(),
                req.mutate_row_keys.len()
            )));
        }

        let num_inserts = req.insert_rows.len();
        let mut ops = Vec::with_capacity(num_inserts + mutations.len());
        // Request row index of each entry of `ops`.
        let mut row_indexes = Vec::with_capacity(ops.capacity());
        let mut per_row_errors = Vec::new();

        for (idx, row) in req.insert_rows.into_iter().enumerate() {
            ops.push(RowOp::Insert(row));
            row_indexes.push(idx);
        }
        for (i, (key, mutation)) in req.mutate_row_keys.into_iter().zip(mutations).enumerate() {
            let row_index = num_inserts + i;
            match mutation {
                Ok(mutation) => {
                    ops.push(RowOp::Mutate { key, mutation });
                    row_indexes.push(row_index);
                }
                Err(e) => per_row_errors.push(PerRowError {
                    row_index,
                    error: TabletServerError::from_error(e)?,
                }),
            }
        }

        let result = tablet.write(&req.schema, ops)?;
        for (op_idx, e) in result.row_errors {
            per_row_errors.push(PerRowError {
                row_index: row_indexes[op_idx],
                error: TabletServerError::from_error(e)?,
            });
        }
        per_row_errors.sort_by_key(|e| e.row_index);

        Ok(WriteResponse {
            error: None,
            per_row_errors,
            timestamp: Some(result.timestamp),
        })
    }

    /// Open a scan or continue one parked in the scanner registry.
    pub fn scan(&self, req: ScanRequest) -> Result<ScanResponse> {
        let batch_size = req
            .batch_size_bytes
            .unwrap_or(self.config.default_batch_size_bytes);
        let result = match (req.scanner_id, req.new_scan_request) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidArgument(
                    "Must not pass both a scanner_id and new_scan_request".to_string(),
                ))
            }
            (None, None) => {
                return Err(Error::InvalidArgument(
                    "Must pass either a scanner_id or new_scan_request".to_string(),
                ))
            }
            (None, Some(new_scan)) => self.open_scan(new_scan, batch_size),
            (Some(scanner_id), None) => self.continue_scan(&scanner_id, batch_size),
        };
        into_response(result, |error| ScanResponse {
            error: Some(error),
            ..Default::default()
        })
    }

    fn open_scan(&self, req: NewScanRequest, batch_size: usize) -> Result<ScanResponse> {
        let tablet = self.tablets.lookup(&req.tablet_id)?;
        let mut iter = tablet.new_scan(ScanSpec {
            projection: req.projection,
            predicates: req.predicates,
        })?;

        if !iter.has_more() {
            return Ok(ScanResponse::default());
        }
        let rows = iter.next_batch(batch_size)?;
        if !iter.has_more() {
            return Ok(ScanResponse {
                rows,
                ..Default::default()
            });
        }

        let scanner = self.scanners.register(tablet.tablet_id(), iter);
        Ok(ScanResponse {
            error: None,
            scanner_id: Some(scanner.id().to_string()),
            has_more_results: true,
            rows,
        })
    }

    fn continue_scan(&self, scanner_id: &str, batch_size: usize) -> Result<ScanResponse> {
        let scanner = self.scanners.lookup(scanner_id)?;
        let (rows, has_more_results) = scanner.next_batch(batch_size)?;
        if !has_more_results {
            self.scanners.unregister(scanner_id);
        }
        Ok(ScanResponse {
            error: None,
            scanner_id: has_more_results.then(|| scanner_id.to_string()),
            has_more_results,
            rows,
        })
    }

    pub fn alter_schema(&self, req: AlterSchemaRequest) -> Result<StatusResponse> {
        status(
            self.tablets
                .lookup(&req.tablet_id)
                .and_then(|tablet| tablet.alter_schema(&req.schema, req.schema_version)),
        )
    }

    pub fn create_tablet(&self, req: CreateTabletRequest) -> Result<StatusResponse> {
        status(
            self.tablets
                .create_tablet(TabletInfo {
                    tablet_id: req.tablet_id,
                    table_id: req.table_id,
                    table_name: req.table_name,
                    start_key: req.start_key,
                    end_key: req.end_key,
                    schema: req.schema,
                })
                .map(|_| ()),
        )
    }

    pub fn delete_tablet(&self, req: DeleteTabletRequest) -> Result<StatusResponse> {
        let result = self.tablets.delete_tablet(&req.tablet_id);
        if result.is_ok() {
            let dropped = self.scanners.remove_tablet_scanners(&req.tablet_id);
            tracing::debug!(tablet_id = %req.tablet_id, dropped, "Dropped scanners of deleted tablet");
        }
        status(result)
    }

    pub fn change_config(&self, req: ChangeConfigRequest) -> Result<StatusResponse> {
        status(
            self.tablets
                .lookup(&req.tablet_id)
                .and_then(|tablet| tablet.change_config(req.seqno)),
        )
    }

    /// Shut down every hosted tablet, syncing their WALs.
    pub fn shutdown(&self) -> Result<()> {
        self.tablets.shutdown()
    }
}
