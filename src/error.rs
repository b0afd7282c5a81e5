use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the tablet engine and the tablet server surface.
///
/// The first group maps one-to-one onto the application error codes handed
/// back to clients (see [`Error::code`]). The second group covers internal
/// failures that surface as RPC-level errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Mismatched schema: {0}")]
    MismatchedSchema(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("Already present: {0}")]
    AlreadyPresent(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid mutation type: {0}")]
    InvalidMutationType(String),

    #[error("Illegal reinsert: {0}")]
    IllegalReinsert(String),

    #[error("Scanner expired: {0}")]
    ScannerExpired(String),

    #[error("Tablet already exists: {0}")]
    TabletAlreadyExists(String),

    #[error("Tablet not found: {0}")]
    TabletNotFound(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Tablet is shut down")]
    ShutDown,
}

/// Application error codes reported back to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TabletServerErrorCode {
    MismatchedSchema,
    InvalidSchema,
    InvalidMutation,
    AlreadyPresent,
    NotFound,
    InvalidMutationType,
    IllegalReinsert,
    ScannerExpired,
    TabletAlreadyExists,
    TabletNotFound,
    InvalidConfig,
}

impl Error {
    /// The client-facing error code, or `None` for internal failures.
    pub fn code(&self) -> Option<TabletServerErrorCode> {
        use TabletServerErrorCode as Code;
        match self {
            Error::MismatchedSchema(_) => Some(Code::MismatchedSchema),
            Error::InvalidSchema(_) => Some(Code::InvalidSchema),
            Error::InvalidMutation(_) => Some(Code::InvalidMutation),
            Error::AlreadyPresent(_) => Some(Code::AlreadyPresent),
            Error::NotFound(_) => Some(Code::NotFound),
            Error::InvalidMutationType(_) => Some(Code::InvalidMutationType),
            Error::IllegalReinsert(_) => Some(Code::IllegalReinsert),
            Error::ScannerExpired(_) => Some(Code::ScannerExpired),
            Error::TabletAlreadyExists(_) => Some(Code::TabletAlreadyExists),
            Error::TabletNotFound(_) => Some(Code::TabletNotFound),
            Error::InvalidConfig(_) => Some(Code::InvalidConfig),
            Error::Io(_)
            | Error::Corruption(_)
            | Error::InvalidData(_)
            | Error::InvalidState(_)
            | Error::InvalidArgument(_)
            | Error::Encoding(_)
            | Error::ShutDown => None,
        }
    }
}
