//! Request and response types of the tablet server surface.
//!
//! Application failures travel inside responses as a [`TabletServerError`];
//! internal failures are returned as the call's `Err`.

use crate::error::{Error, Result, TabletServerErrorCode};
use crate::mvcc::Timestamp;
use crate::schema::{Schema, Value};
use crate::tablet::ColumnRangePredicate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletServerError {
    pub code: TabletServerErrorCode,
    pub message: String,
}

impl TabletServerError {
    /// The application error carried by `err`, or `err` itself when it is
    /// an internal failure without a client code.
    pub fn from_error(err: Error) -> Result<Self> {
        match err.code() {
            Some(code) => Ok(Self {
                code,
                message: err.to_string(),
            }),
            None => Err(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerRowError {
    /// Position of the row in the request: inserts first, then mutations.
    pub row_index: usize,
    pub error: TabletServerError,
}

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub tablet_id: String,
    /// Schema the client laid its rows out with. Must not carry column ids.
    pub schema: Schema,
    pub insert_rows: Vec<Vec<Value>>,
    /// Keys of the rows to mutate, one per record of `encoded_mutations`.
    pub mutate_row_keys: Vec<Vec<Value>>,
    pub encoded_mutations: Vec<u8>,
}

impl WriteRequest {
    pub fn new(tablet_id: impl Into<String>, schema: Schema) -> Self {
        Self {
            tablet_id: tablet_id.into(),
            schema,
            insert_rows: Vec::new(),
            mutate_row_keys: Vec::new(),
            encoded_mutations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteResponse {
    pub error: Option<TabletServerError>,
    pub per_row_errors: Vec<PerRowError>,
    pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone)]
pub struct NewScanRequest {
    pub tablet_id: String,
    pub projection: Schema,
    pub predicates: Vec<ColumnRangePredicate>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub scanner_id: Option<String>,
    pub new_scan_request: Option<NewScanRequest>,
    /// Rough byte budget for the returned rows; the server default if unset.
    pub batch_size_bytes: Option<usize>,
}

impl ScanRequest {
    pub fn open(new_scan_request: NewScanRequest) -> Self {
        Self {
            new_scan_request: Some(new_scan_request),
            ..Default::default()
        }
    }

    pub fn resume(scanner_id: impl Into<String>) -> Self {
        Self {
            scanner_id: Some(scanner_id.into()),
            ..Default::default()
        }
    }

    pub fn batch_size_bytes(mut self, size: usize) -> Self {
        self.batch_size_bytes = Some(size);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanResponse {
    pub error: Option<TabletServerError>,
    /// Set while the scanner has rows left.
    pub scanner_id: Option<String>,
    pub has_more_results: bool,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone)]
pub struct AlterSchemaRequest {
    pub tablet_id: String,
    pub schema: Schema,
    pub schema_version: u32,
}

#[derive(Debug, Clone)]
pub struct CreateTabletRequest {
    pub tablet_id: String,
    pub table_id: String,
    pub table_name: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub schema: Schema,
}

#[derive(Debug, Clone)]
pub struct DeleteTabletRequest {
    pub tablet_id: String,
}

#[derive(Debug, Clone)]
pub struct ChangeConfigRequest {
    pub tablet_id: String,
    pub seqno: i64,
}

/// Response of the calls that only report success or an application error.
#[derive(Debug, Clone, Default)]
pub struct StatusResponse {
    pub error: Option<TabletServerError>,
}

impl StatusResponse {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
