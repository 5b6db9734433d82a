use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub storage_path: PathBuf,

    /// Capacity of the formula memoization cache, in entries.
    pub cache_entries: usize,

    /// fsync the record log on every flush. Turning this off trades
    /// durability of the newest transactions for throughput.
    pub sync_on_flush: bool,

    /// Compaction is skipped while the log holds fewer superseded
    /// records than this.
    pub compaction_min_superseded: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: PathBuf::from("./data"),
            cache_entries: 4096,
            sync_on_flush: true,
            compaction_min_superseded: 64,
        }
    }
}
