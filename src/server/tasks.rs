use std::{sync::Arc, time::Duration};

use super::TabletServer;
use crate::{
    error::Result,
    scheduler::{BackgroundTask, Context},
    tablet::{CompactionMode, Tablet},
    Error,
};

/// Run `f` against every hosted tablet on the blocking pool. A failing
/// tablet is logged and does not stop the others.
async fn for_each_tablet<F>(server: &Arc<TabletServer>, task: &'static str, f: F) -> Result<()>
where
    F: Fn(&Tablet) -> Result<()> + Send + Sync + 'static,
{
    let server = server.clone();
    tokio::task::spawn_blocking(move || {
        for tablet in server.tablet_manager().tablets() {
            match f(&tablet) {
                Ok(()) | Err(Error::ShutDown) => {}
                Err(e) => {
                    tracing::warn!(task, tablet_id = %tablet.tablet_id(), error = %e, "Tablet maintenance failed");
                }
            }
        }
    })
    .await
    .map_err(|e| Error::InvalidState(format!("{} task panicked: {}", task, e)))
}

pub struct FlushTask {
    server: Arc<TabletServer>,
}

impl FlushTask {
    pub fn new(server: Arc<TabletServer>) -> Self {
        Self { server }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "mrs-flush"
    }

    fn interval(&self) -> Duration {
        self.server.config().scheduler.flush_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        for_each_tablet(&self.server, self.name(), |tablet| {
            if tablet.needs_flush() {
                tablet.flush()?;
            }
            Ok(())
        })
        .await
    }
}

pub struct CompactionTask {
    server: Arc<TabletServer>,
}

impl CompactionTask {
    pub fn new(server: Arc<TabletServer>) -> Self {
        Self { server }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.server.config().scheduler.compaction_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        for_each_tablet(&self.server, self.name(), |tablet| {
            if tablet.needs_compaction() {
                tablet.compact(CompactionMode::Normal)?;
            }
            Ok(())
        })
        .await
    }
}

pub struct ScannerGcTask {
    server: Arc<TabletServer>,
}

impl ScannerGcTask {
    pub fn new(server: Arc<TabletServer>) -> Self {
        Self { server }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for ScannerGcTask {
    fn name(&self) -> &'static str {
        "scanner-gc"
    }

    fn interval(&self) -> Duration {
        self.server.config().scheduler.scanner_gc_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let evicted = self.server.scanner_manager().remove_expired();
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted idle scanners");
        }
        Ok(())
    }
}

pub struct WalCleanupTask {
    server: Arc<TabletServer>,
}

impl WalCleanupTask {
    pub fn new(server: Arc<TabletServer>) -> Self {
        Self { server }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for WalCleanupTask {
    fn name(&self) -> &'static str {
        "wal-cleanup"
    }

    fn interval(&self) -> Duration {
        self.server.config().scheduler.wal_cleanup_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        for_each_tablet(&self.server, self.name(), |tablet| {
            tablet.cleanup_wal().map(|_| ())
        })
        .await
    }
}

pub struct MetricsTask {
    server: Arc<TabletServer>,
}

impl MetricsTask {
    pub fn new(server: Arc<TabletServer>) -> Self {
        Self { server }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.server.config().scheduler.metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        tracing::info!(
            tablets = self.server.tablet_manager().tablets().len(),
            scanners = self.server.scanner_manager().len(),
            "Tablet server metrics"
        );
        for_each_tablet(&self.server, self.name(), Tablet::collect_metrics).await
    }
}
