//! Multi-version tablet storage engine.
//!
//! A [`tablet::Tablet`] stores one key range of a table with snapshot
//! reads, a write-ahead log and background flush and compaction. A
//! [`server::TabletServer`] hosts the tablets of one data directory behind
//! a request/response surface.

pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod mvcc;
pub mod scheduler;
pub mod schema;
pub mod server;
pub mod tablet;

pub use error::{Error, Result};
