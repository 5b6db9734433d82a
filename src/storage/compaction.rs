use std::collections::HashMap;
use std::fs;

use chrono::Utc;
use tracing::{debug, info};

use crate::core::error::Result;
use crate::storage::log::{LogEntry, RecordKey, RecordLog};
use crate::storage::memtable::{DirectoryEntry, MemTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub kept: usize,
    pub reclaimed: usize,
    pub generation: u64,
}

impl MemTable {
    /// Rewrite live record versions into a fresh log generation and
    /// delete the old files, reclaiming superseded versions and
    /// rolled-back garbage.
    ///
    /// Runs out of band: the log mutex is held for the duration, so
    /// flushes queue behind it but reads stay unblocked. Returns
    /// `None` when there is nothing worth reclaiming, a snapshot pin
    /// still covers every superseded version, or a provisional write
    /// is in flight.
    pub fn compact(&self, min_superseded: usize) -> Result<Option<CompactionStats>> {
        let mut log = self.log.lock();

        let (old_generation, plan) = {
            let state = self.state.read();
            if !state.provisional.is_empty() {
                debug!("compaction skipped: provisional writes in flight");
                return Ok(None);
            }
            (state.generation, plan_survivors(&state.entries, &self.pinned_watermarks()))
        };

        let reclaimed: usize = plan.values().map(|(_, r)| *r).sum();
        if reclaimed < min_superseded.max(1) {
            return Ok(None);
        }

        let new_generation = old_generation + 1;
        let mut new_log = RecordLog::open(self.layout.log_path(new_generation))?;
        let mut new_entries: HashMap<RecordKey, Vec<DirectoryEntry>> = HashMap::new();
        let mut kept = 0usize;

        for (key, (survivors, _)) in &plan {
            for entry in survivors {
                let payload = match RecordLog::read_entry_at(
                    &self.layout.log_path(entry.generation),
                    entry.offset,
                )? {
                    LogEntry::Record { payload, .. } => payload,
                    LogEntry::Flush { .. } => continue,
                };
                let offset = new_log.append(&LogEntry::Record {
                    txn_id: 0,
                    key: key.clone(),
                    version: entry.version,
                    payload,
                    written_at: Utc::now(),
                })?;
                new_entries.entry(key.clone()).or_default().push(DirectoryEntry {
                    generation: new_generation,
                    offset,
                    version: entry.version,
                    seq: entry.seq,
                });
                kept += 1;
            }
        }
        new_log.append(&LogEntry::Flush { txn_id: 0 })?;
        new_log.sync()?;
        for versions in new_entries.values_mut() {
            versions.sort_by_key(|e| e.version);
        }

        {
            let mut state = self.state.write();
            state.entries = new_entries;
            state.generation = new_generation;
        }
        *log = new_log;

        for generation in self.layout.find_generations()? {
            if generation < new_generation {
                fs::remove_file(self.layout.log_path(generation))?;
            }
        }

        info!(
            generation = new_generation,
            kept, reclaimed, "compacted record log"
        );
        Ok(Some(CompactionStats {
            kept,
            reclaimed,
            generation: new_generation,
        }))
    }
}

/// For each key, split its versions into survivors and a reclaimed
/// count. The latest version always survives; a superseded version
/// survives while it is the newest one visible at any live pin
/// watermark, so every open reader keeps exactly the version its
/// snapshot resolves to.
fn plan_survivors(
    entries: &HashMap<RecordKey, Vec<DirectoryEntry>>,
    watermarks: &[u64],
) -> HashMap<RecordKey, (Vec<DirectoryEntry>, usize)> {
    entries
        .iter()
        .map(|(key, versions)| {
            let mut keep = vec![false; versions.len()];
            keep[versions.len() - 1] = true;
            for &w in watermarks {
                if let Some(idx) = versions.iter().rposition(|e| e.seq <= w) {
                    keep[idx] = true;
                }
            }
            let survivors: Vec<DirectoryEntry> = versions
                .iter()
                .zip(&keep)
                .filter_map(|(entry, keep)| keep.then_some(*entry))
                .collect();
            let reclaimed = versions.len() - survivors.len();
            (key.clone(), (survivors, reclaimed))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::StorageLayout;

    fn open_memtable(dir: &std::path::Path) -> MemTable {
        let layout = StorageLayout::new(dir.to_path_buf()).unwrap();
        MemTable::open(layout, true).unwrap()
    }

    fn put(table: &MemTable, txn_id: u64, key: &str, version: u64, payload: &[u8]) {
        table
            .write(txn_id, RecordKey::new(key), version, payload.to_vec())
            .unwrap();
        table.flush(txn_id).unwrap();
    }

    #[test]
    fn test_compaction_reclaims_superseded_versions() {
        let dir = tempfile::tempdir().unwrap();
        let table = open_memtable(dir.path());

        put(&table, 10, "entity/1", 1, b"old");
        put(&table, 11, "entity/1", 2, b"new");
        put(&table, 12, "entity/2", 3, b"only");

        let stats = table.compact(1).unwrap().unwrap();
        assert_eq!(stats.kept, 2);
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.generation, 1);

        assert_eq!(table.read(&RecordKey::new("entity/1")).unwrap(), b"new");
        assert_eq!(table.read(&RecordKey::new("entity/2")).unwrap(), b"only");
        assert_eq!(table.layout.find_generations().unwrap(), vec![1]);
    }

    #[test]
    fn test_compaction_below_threshold_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let table = open_memtable(dir.path());
        put(&table, 10, "entity/1", 1, b"only");

        assert!(table.compact(1).unwrap().is_none());
        assert_eq!(table.layout.find_generations().unwrap(), vec![0]);
    }

    #[test]
    fn test_pinned_snapshot_blocks_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let table = open_memtable(dir.path());

        put(&table, 10, "entity/1", 1, b"pinned");
        let pin = table.pin_snapshot();
        put(&table, 11, "entity/1", 2, b"new");

        // The pinned reader can still reach version 1.
        assert!(table.compact(1).unwrap().is_none());

        drop(pin);
        let stats = table.compact(1).unwrap().unwrap();
        assert_eq!(stats.reclaimed, 1);
    }

    #[test]
    fn test_every_pin_watermark_keeps_its_visible_version() {
        let dir = tempfile::tempdir().unwrap();
        let table = open_memtable(dir.path());

        put(&table, 10, "entity/1", 1, b"v1");
        let early = table.pin_snapshot();
        put(&table, 11, "entity/1", 2, b"v2");
        let late = table.pin_snapshot();
        put(&table, 12, "entity/1", 3, b"v3");

        // v1 is the newest visible at the early pin, v2 at the late one.
        assert!(table.compact(1).unwrap().is_none());

        drop(late);
        assert_eq!(table.compact(1).unwrap().unwrap().reclaimed, 1);

        drop(early);
        assert_eq!(table.compact(1).unwrap().unwrap().reclaimed, 1);
        assert_eq!(table.read(&RecordKey::new("entity/1")).unwrap(), b"v3");
    }

    #[test]
    fn test_reads_never_fail_while_compaction_runs() {
        let dir = tempfile::tempdir().unwrap();
        let table = open_memtable(dir.path());
        put(&table, 1, "entity/1", 1, b"seed");

        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..400 {
                    let payload = table.read(&RecordKey::new("entity/1")).unwrap();
                    assert!(!payload.is_empty());
                }
            });
            for i in 0..40u64 {
                let body = format!("v{}", i);
                put(&table, 10 + i, "entity/1", 2 + i, body.as_bytes());
                table.compact(1).unwrap();
            }
        });
    }

    #[test]
    fn test_compaction_skipped_with_inflight_write() {
        let dir = tempfile::tempdir().unwrap();
        let table = open_memtable(dir.path());

        put(&table, 10, "entity/1", 1, b"old");
        put(&table, 11, "entity/1", 2, b"new");
        table
            .write(12, RecordKey::new("entity/2"), 3, b"open".to_vec())
            .unwrap();

        assert!(table.compact(1).unwrap().is_none());
        table.flush(12).unwrap();
        assert!(table.compact(1).unwrap().is_some());
    }

    #[test]
    fn test_reopen_after_compaction() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = open_memtable(dir.path());
            put(&table, 10, "entity/1", 1, b"old");
            put(&table, 11, "entity/1", 2, b"new");
            table.compact(1).unwrap().unwrap();
            put(&table, 12, "entity/3", 3, b"later");
        }

        let table = open_memtable(dir.path());
        assert_eq!(table.read(&RecordKey::new("entity/1")).unwrap(), b"new");
        assert_eq!(table.read(&RecordKey::new("entity/3")).unwrap(), b"later");
    }
}
