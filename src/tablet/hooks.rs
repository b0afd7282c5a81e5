//! Extension points invoked at fixed steps of the flush and compaction
//! pipelines.
//!
//! Each method runs exactly once per pipeline run, on the maintenance
//! thread, without any tablet lock held; it may issue writes against the
//! tablet. An error aborts the pipeline run.

use crate::error::Result;

use std::sync::Arc;

/// Steps shared by flush and compaction.
pub trait FlushCompactCommonHooks: Send + Sync {
    fn post_take_mvcc_snapshot(&self) -> Result<()> {
        Ok(())
    }

    fn post_write_snapshot(&self) -> Result<()> {
        Ok(())
    }

    fn post_swap_in_duplicating_rowset(&self) -> Result<()> {
        Ok(())
    }

    fn post_reupdate_missed_deltas(&self) -> Result<()> {
        Ok(())
    }

    fn post_swap_new_rowset(&self) -> Result<()> {
        Ok(())
    }
}

pub trait FlushFaultHooks: Send + Sync {
    fn post_swap_new_mem_rowset(&self) -> Result<()> {
        Ok(())
    }
}

pub trait CompactionFaultHooks: Send + Sync {
    fn post_select_iterators(&self) -> Result<()> {
        Ok(())
    }
}

/// No-op hooks installed by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl FlushCompactCommonHooks for NoopHooks {}
impl FlushFaultHooks for NoopHooks {}
impl CompactionFaultHooks for NoopHooks {}

#[derive(Clone)]
pub struct TabletHooks {
    pub common: Arc<dyn FlushCompactCommonHooks>,
    pub flush: Arc<dyn FlushFaultHooks>,
    pub compaction: Arc<dyn CompactionFaultHooks>,
}

impl Default for TabletHooks {
    fn default() -> Self {
        Self {
            common: Arc::new(NoopHooks),
            flush: Arc::new(NoopHooks),
            compaction: Arc::new(NoopHooks),
        }
    }
}
