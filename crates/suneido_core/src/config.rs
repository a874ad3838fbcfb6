//! Database configuration.

use suneido_storage::DEFAULT_CHUNK_SIZE;

/// How a database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Open an existing file without write access.
    ReadOnly,
    /// Open an existing file, creating it if it does not exist.
    #[default]
    Open,
    /// Create a new, empty database, replacing any existing file.
    Create,
}

impl OpenMode {
    /// Returns true if the mode permits writes.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Open mode.
    pub mode: OpenMode,

    /// Byte budget for a packed B-tree node before it splits.
    pub node_size: usize,

    /// Whether to sync storage on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Worker threads used by the per-table index check.
    pub check_workers: usize,

    /// Number of index errors after which the check stops early.
    pub check_error_limit: usize,

    /// Growth increment for memory-mapped database files.
    pub mmap_chunk_size: u64,

    /// Whether an unclean, recoverable file is rebuilt when opened.
    pub auto_rebuild: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: OpenMode::Open,
            node_size: 4096,
            sync_on_commit: true,
            check_workers: 4,
            check_error_limit: 20,
            mmap_chunk_size: DEFAULT_CHUNK_SIZE,
            auto_rebuild: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the open mode.
    #[must_use]
    pub const fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the B-tree node byte budget.
    #[must_use]
    pub const fn node_size(mut self, size: usize) -> Self {
        self.node_size = size;
        self
    }

    /// Sets whether to sync storage on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the number of check worker threads.
    #[must_use]
    pub const fn check_workers(mut self, workers: usize) -> Self {
        self.check_workers = workers;
        self
    }

    /// Sets the index error ceiling for the check.
    #[must_use]
    pub const fn check_error_limit(mut self, limit: usize) -> Self {
        self.check_error_limit = limit;
        self
    }

    /// Sets the memory-map growth increment.
    #[must_use]
    pub const fn mmap_chunk_size(mut self, size: u64) -> Self {
        self.mmap_chunk_size = size;
        self
    }

    /// Sets whether unclean files are rebuilt on open.
    #[must_use]
    pub const fn auto_rebuild(mut self, value: bool) -> Self {
        self.auto_rebuild = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.mode, OpenMode::Open);
        assert_eq!(config.node_size, 4096);
        assert!(config.sync_on_commit);
        assert!(config.auto_rebuild);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .mode(OpenMode::ReadOnly)
            .node_size(512)
            .sync_on_commit(false)
            .check_workers(2);

        assert!(!config.mode.is_writable());
        assert_eq!(config.node_size, 512);
        assert!(!config.sync_on_commit);
        assert_eq!(config.check_workers, 2);
    }
}
