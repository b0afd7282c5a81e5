use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a single tablet
#[derive(Debug, Clone)]
pub struct TabletConfig {
    /// Directory holding the tablet's metadata, WAL and row set files
    pub dir: PathBuf,

    /// MemRowSet size that makes the background flush task kick in (default: 64MB)
    pub flush_threshold_bytes: usize,

    /// WAL writer buffer size (default: 64KB)
    pub wal_buffer_size: usize,

    /// WAL segment size that triggers a roll to a new segment (default: 64MB)
    pub wal_segment_size: u64,

    /// Compaction configuration
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Number of disk row sets needed before a background compaction runs (default: 4)
    pub min_rowsets: usize,

    /// Upper bound on the number of row sets merged by one compaction (default: 16)
    pub max_rowsets: usize,
}

/// Configuration for a tablet server hosting many tablets
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root data directory; tablets live under `<dir>/tablets/<tablet_id>`
    pub dir: PathBuf,

    /// Idle time after which an undrained scanner is evicted (default: 60s)
    pub scanner_ttl: Duration,

    /// Batch size used when a scan request does not carry one (default: 1MB)
    pub default_batch_size_bytes: usize,

    /// Per-tablet settings applied to every tablet this server opens
    pub tablet: TabletConfig,

    /// Background task intervals
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to check for flush opportunities (default: 3s)
    pub flush_interval: Duration,

    /// How often to check for compaction opportunities (default: 10s)
    pub compaction_interval: Duration,

    /// How often to sweep idle scanners (default: 5s)
    pub scanner_gc_interval: Duration,

    /// How often to delete superseded WAL segments (default: 30s)
    pub wal_cleanup_interval: Duration,

    /// How often to log tablet metrics (default: 60s)
    pub metrics_interval: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_rowsets: 4,
            max_rowsets: 16,
        }
    }
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tablet"),
            flush_threshold_bytes: 64 * 1024 * 1024, // 64MB
            wal_buffer_size: 64 * 1024,              // 64KB
            wal_segment_size: 64 * 1024 * 1024,      // 64MB
            compaction: CompactionConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(3),
            compaction_interval: Duration::from_secs(10),
            scanner_gc_interval: Duration::from_secs(5),
            wal_cleanup_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tserver"),
            scanner_ttl: Duration::from_secs(60),
            default_batch_size_bytes: 1024 * 1024, // 1MB
            tablet: TabletConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl TabletConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the MemRowSet flush threshold
    pub fn flush_threshold_bytes(mut self, size: usize) -> Self {
        self.flush_threshold_bytes = size;
        self
    }

    /// Set WAL buffer size
    pub fn wal_buffer_size(mut self, size: usize) -> Self {
        self.wal_buffer_size = size;
        self
    }

    /// Set the WAL segment roll threshold
    pub fn wal_segment_size(mut self, size: u64) -> Self {
        self.wal_segment_size = size;
        self
    }

    /// Configure compaction settings
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    /// Same settings rooted at another directory
    pub fn with_dir(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..self.clone()
        }
    }
}

impl CompactionConfig {
    /// Set the minimum number of row sets for a background compaction
    pub fn min_rowsets(mut self, count: usize) -> Self {
        self.min_rowsets = count;
        self
    }

    /// Set the maximum number of row sets merged at once
    pub fn max_rowsets(mut self, count: usize) -> Self {
        self.max_rowsets = count;
        self
    }
}

impl ServerConfig {
    /// Create a new config with the given data directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the idle scanner TTL
    pub fn scanner_ttl(mut self, ttl: Duration) -> Self {
        self.scanner_ttl = ttl;
        self
    }

    /// Set the default scan batch size
    pub fn default_batch_size_bytes(mut self, size: usize) -> Self {
        self.default_batch_size_bytes = size;
        self
    }

    /// Configure per-tablet settings
    pub fn tablet(mut self, config: TabletConfig) -> Self {
        self.tablet = config;
        self
    }

    /// Configure background task intervals
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub(crate) fn tablets_dir(&self) -> PathBuf {
        self.dir.join("tablets")
    }
}

impl SchedulerConfig {
    /// Set flush check interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set compaction check interval
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Set scanner sweep interval
    pub fn scanner_gc_interval(mut self, interval: Duration) -> Self {
        self.scanner_gc_interval = interval;
        self
    }

    /// Set WAL cleanup interval
    pub fn wal_cleanup_interval(mut self, interval: Duration) -> Self {
        self.wal_cleanup_interval = interval;
        self
    }

    /// Set metrics interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.dir, PathBuf::from("./tserver"));
        assert_eq!(config.scanner_ttl, Duration::from_secs(60));
        assert_eq!(config.default_batch_size_bytes, 1024 * 1024);

        assert_eq!(config.tablet.flush_threshold_bytes, 64 * 1024 * 1024);
        assert_eq!(config.tablet.wal_buffer_size, 64 * 1024);
        assert_eq!(config.tablet.compaction.min_rowsets, 4);
        assert_eq!(config.tablet.compaction.max_rowsets, 16);

        assert_eq!(config.scheduler.flush_interval, Duration::from_secs(3));
        assert_eq!(config.scheduler.wal_cleanup_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::new("/tmp/tserver")
            .scanner_ttl(Duration::from_millis(200))
            .default_batch_size_bytes(4096)
            .tablet(
                TabletConfig::default()
                    .flush_threshold_bytes(1024)
                    .wal_segment_size(8192)
                    .compaction(CompactionConfig::default().min_rowsets(2).max_rowsets(3)),
            )
            .scheduler(
                SchedulerConfig::default()
                    .flush_interval(Duration::from_millis(500))
                    .compaction_interval(Duration::from_secs(5))
                    .scanner_gc_interval(Duration::from_secs(1)),
            );

        assert_eq!(config.dir, PathBuf::from("/tmp/tserver"));
        assert_eq!(config.tablets_dir(), PathBuf::from("/tmp/tserver/tablets"));
        assert_eq!(config.scanner_ttl, Duration::from_millis(200));
        assert_eq!(config.default_batch_size_bytes, 4096);

        assert_eq!(config.tablet.flush_threshold_bytes, 1024);
        assert_eq!(config.tablet.wal_segment_size, 8192);
        assert_eq!(config.tablet.compaction.min_rowsets, 2);
        assert_eq!(config.tablet.compaction.max_rowsets, 3);

        assert_eq!(config.scheduler.flush_interval, Duration::from_millis(500));
        assert_eq!(config.scheduler.compaction_interval, Duration::from_secs(5));
        assert_eq!(config.scheduler.scanner_gc_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_with_dir_keeps_settings() {
        let base = TabletConfig::default().flush_threshold_bytes(77);
        let moved = base.with_dir("/tmp/elsewhere");
        assert_eq!(moved.dir, PathBuf::from("/tmp/elsewhere"));
        assert_eq!(moved.flush_threshold_bytes, 77);
    }
}
