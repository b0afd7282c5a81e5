//! Registry of open scanners.
//!
//! A scan that does not fit in one response is parked here under a random
//! id until the client resumes it, it is drained, or it sits idle past the
//! TTL.

use crate::error::Result;
use crate::schema::Value;
use crate::tablet::TabletScanIter;
use crate::Error;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub struct Scanner {
    id: String,
    tablet_id: String,
    iter: Mutex<TabletScanIter>,
    last_access: Mutex<Instant>,
}

impl Scanner {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    /// The next batch, and whether rows remain after it.
    pub fn next_batch(&self, max_bytes: usize) -> Result<(Vec<Vec<Value>>, bool)> {
        let mut iter = self.iter.lock();
        *self.last_access.lock() = Instant::now();
        let rows = iter.next_batch(max_bytes)?;
        Ok((rows, iter.has_more()))
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_access.lock())
    }
}

pub struct ScannerManager {
    scanners: RwLock<HashMap<String, Arc<Scanner>>>,
    ttl: Duration,
}

impl ScannerManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            scanners: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn register(&self, tablet_id: &str, iter: TabletScanIter) -> Arc<Scanner> {
        let scanner = Arc::new(Scanner {
            id: Uuid::new_v4().simple().to_string(),
            tablet_id: tablet_id.to_string(),
            iter: Mutex::new(iter),
            last_access: Mutex::new(Instant::now()),
        });
        self.scanners
            .write()
            .insert(scanner.id.clone(), scanner.clone());
        tracing::debug!(scanner_id = %scanner.id, tablet_id, "Registered scanner");
        scanner
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<Scanner>> {
        self.scanners
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ScannerExpired(format!("Scanner {} not found (it may have expired)", id)))
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.scanners.write().remove(id).is_some()
    }

    /// Drop every scanner reading `tablet_id`.
    pub fn remove_tablet_scanners(&self, tablet_id: &str) -> usize {
        let mut scanners = self.scanners.write();
        let before = scanners.len();
        scanners.retain(|_, scanner| scanner.tablet_id != tablet_id);
        before - scanners.len()
    }

    /// Evict scanners idle for longer than the TTL.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut scanners = self.scanners.write();
        let before = scanners.len();
        scanners.retain(|id, scanner| {
            let idle = scanner.idle_for(now);
            let keep = idle <= self.ttl;
            if !keep {
                tracing::info!(scanner_id = %id, tablet_id = %scanner.tablet_id, ?idle, "Evicting idle scanner");
            }
            keep
        });
        before - scanners.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.scanners.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.scanners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
