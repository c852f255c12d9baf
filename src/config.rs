use std::path::PathBuf;

/// Configuration for a quilldb database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Maximum pending operations before an auto-commit (default: 1000)
    pub max_batch_size: usize,

    /// Commit automatically once the batch threshold is crossed (default: true)
    pub auto_commit: bool,

    /// Maximum number of documents held in the hot cache (default: 1000)
    pub max_cache_size: usize,

    /// Initial block size for point reads from the data file (default: 8KB)
    pub read_block_size: usize,

    /// Index mutations between snapshot writes of index.bin (default: 1000)
    pub index_snapshot_interval: usize,

    /// WAL configuration
    pub wal: WalConfig,
}

#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Pending entries at which the owning database forces a commit,
    /// and with it a flush. `Wal::log` itself never touches disk
    /// (default: 1000)
    pub max_batch_size: usize,

    /// Total live segment size that triggers rotation (default: 100MB)
    pub max_log_size: u64,

    /// Per-segment size cap; a flush that would cross it opens a new
    /// segment first (default: 64MB)
    pub segment_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./quilldb"),
            max_batch_size: 1000,
            auto_commit: true,
            max_cache_size: 1000,
            read_block_size: 8 * 1024, // 8KB
            index_snapshot_interval: 1000,
            wal: WalConfig::default(),
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_log_size: 100 * 1024 * 1024, // 100MB
            segment_size: 64 * 1024 * 1024,  // 64MB
        }
    }
}

impl Config {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the auto-commit batch threshold
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Enable or disable auto-commit
    pub fn auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    /// Set the document cache capacity
    pub fn max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = size;
        self
    }

    /// Set the initial read block size
    pub fn read_block_size(mut self, size: usize) -> Self {
        self.read_block_size = size;
        self
    }

    /// Set the index snapshot interval
    pub fn index_snapshot_interval(mut self, interval: usize) -> Self {
        self.index_snapshot_interval = interval;
        self
    }

    /// Configure WAL settings
    pub fn wal(mut self, config: WalConfig) -> Self {
        self.wal = config;
        self
    }
}

impl WalConfig {
    /// Set the flush threshold in entries
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Set the total-size rotation threshold
    pub fn max_log_size(mut self, size: u64) -> Self {
        self.max_log_size = size;
        self
    }

    /// Set the per-segment size cap
    pub fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }
}
