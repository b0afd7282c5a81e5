//! Logical clock and multi-version concurrency control.
//!
//! Every write batch is stamped with one timestamp from the [`Clock`] and
//! registered as in flight with the [`MvccManager`] until it is durable.
//! Readers and the flush/compaction pipeline take [`MvccSnapshot`]s: a
//! boundary timestamp plus the set of transactions below it that had not
//! committed yet. A mutation is visible in a snapshot iff its timestamp is
//! below the boundary and not in that set.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const INITIAL: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Timestamp {
        Timestamp(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues strictly increasing timestamps.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently issued (or observed) timestamp.
    pub fn now(&self) -> Timestamp {
        Timestamp(self.last.load(Ordering::SeqCst))
    }

    /// Issue a timestamp later than every one issued or observed so far.
    pub fn next(&self) -> Timestamp {
        Timestamp(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Advance past a timestamp observed elsewhere (WAL replay, metadata).
    pub fn update(&self, ts: Timestamp) {
        self.last.fetch_max(ts.0, Ordering::SeqCst);
    }
}

/// Which committed mutations a reader may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvccSnapshot {
    all_committed_before: Timestamp,
    in_flight: BTreeSet<Timestamp>,
}

impl MvccSnapshot {
    /// Every timestamp below `ts` is committed.
    pub fn all_committed_before(ts: Timestamp) -> Self {
        Self {
            all_committed_before: ts,
            in_flight: BTreeSet::new(),
        }
    }

    /// Sees every applied mutation, committed or not.
    pub fn including_all() -> Self {
        Self::all_committed_before(Timestamp::MAX)
    }

    pub fn is_committed(&self, ts: Timestamp) -> bool {
        ts < self.all_committed_before && !self.in_flight.contains(&ts)
    }

    pub fn boundary(&self) -> Timestamp {
        self.all_committed_before
    }

    pub fn is_clean(&self) -> bool {
        self.in_flight.is_empty()
    }
}

impl fmt::Display for MvccSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MvccSnapshot[committed={{T|T < {}", self.all_committed_before)?;
        if !self.in_flight.is_empty() {
            write!(f, " and T not in {:?}", self.in_flight)?;
        }
        write!(f, "}}]")
    }
}

struct MvccState {
    in_flight: BTreeSet<Timestamp>,
}

/// Tracks in-flight transactions and hands out snapshots.
pub struct MvccManager {
    clock: Arc<Clock>,
    state: Mutex<MvccState>,
    committed: Condvar,
}

impl MvccManager {
    pub fn new(clock: Arc<Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(MvccState {
                in_flight: BTreeSet::new(),
            }),
            committed: Condvar::new(),
        }
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Assign a timestamp and mark it in flight.
    pub fn start_transaction(&self) -> Timestamp {
        let mut state = self.state.lock();
        let ts = self.clock.next();
        state.in_flight.insert(ts);
        ts
    }

    /// Mark a transaction committed and wake snapshot waiters.
    pub fn commit(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        if !state.in_flight.remove(&ts) {
            tracing::warn!(ts = ts.value(), "Committing a transaction that is not in flight");
        }
        drop(state);
        self.committed.notify_all();
    }

    /// Snapshot of what is committed right now.
    pub fn take_snapshot(&self) -> MvccSnapshot {
        let state = self.state.lock();
        MvccSnapshot {
            all_committed_before: self.clock.now().next(),
            in_flight: state.in_flight.clone(),
        }
    }

    /// Block until every transaction that was in flight below the current
    /// boundary has committed, then return a snapshot with no holes.
    pub fn wait_for_clean_snapshot(&self) -> MvccSnapshot {
        let boundary = {
            let state = self.state.lock();
            let boundary = self.clock.now().next();
            drop(state);
            boundary
        };
        self.wait_for_all_committed_before(boundary);
        MvccSnapshot::all_committed_before(boundary)
    }

    /// Block until no transaction below `boundary` is in flight.
    pub fn wait_for_all_committed_before(&self, boundary: Timestamp) {
        let mut state = self.state.lock();
        while state
            .in_flight
            .first()
            .is_some_and(|oldest| *oldest < boundary)
        {
            self.committed.wait(&mut state);
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}
