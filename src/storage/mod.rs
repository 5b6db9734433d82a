pub mod compaction;
pub mod layout;
pub mod log;
pub mod memtable;

pub use compaction::CompactionStats;
pub use layout::StorageLayout;
pub use log::{LogEntry, RecordKey, RecordLog};
pub use memtable::{DirectoryEntry, MemTable, SnapshotPin};
