use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::layout::StorageLayout;
use crate::storage::log::{LogEntry, RecordKey, RecordLog};

/// Where a durable record version lives.
///
/// `seq` is the promotion order stamp; snapshot pins hold a watermark
/// of it so compaction knows which superseded versions are still
/// reachable by an open reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub generation: u64,
    pub offset: u64,
    pub version: u64,
    pub seq: u64,
}

/// A journaled write that has not been flushed yet. Visible only to
/// its owning transaction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Provisional {
    pub txn_id: u64,
    pub offset: u64,
    pub version: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Directory {
    /// Durable versions per key, ascending by version.
    pub entries: HashMap<RecordKey, Vec<DirectoryEntry>>,
    pub provisional: HashMap<RecordKey, Provisional>,
    pub generation: u64,
    pub seq: u64,
    /// Highest transaction id ever journaled. Transaction sequences are
    /// re-seated past it after recovery so replay never conflates a new
    /// transaction's records with an abandoned one's.
    pub max_txn_id: u64,
}

/// Append-only record store. Writes are journaled immediately but
/// stay provisional until their transaction flushes; the in-memory
/// directory maps each key to its durable versions in the log.
///
/// Lock order: `log` before `state`. `pins` is a leaf lock.
pub struct MemTable {
    pub(crate) layout: StorageLayout,
    pub(crate) sync_on_flush: bool,
    pub(crate) log: Mutex<RecordLog>,
    pub(crate) state: RwLock<Directory>,
    pub(crate) pins: Arc<Mutex<HashMap<u64, u64>>>,
    next_pin: AtomicU64,
}

/// Holds superseded record versions alive for an open reader.
/// Dropping the pin releases them for compaction.
pub struct SnapshotPin {
    pins: Arc<Mutex<HashMap<u64, u64>>>,
    id: u64,
    watermark: u64,
}

impl SnapshotPin {
    pub fn watermark(&self) -> u64 {
        self.watermark
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        self.pins.lock().remove(&self.id);
    }
}

impl MemTable {
    /// Open the store, rebuilding the directory by replaying the
    /// newest log generation. Records whose transaction never reached
    /// its Flush marker are discarded.
    pub fn open(layout: StorageLayout, sync_on_flush: bool) -> Result<Self> {
        let generation = layout.find_generations()?.last().copied().unwrap_or(0);
        let log = RecordLog::open(layout.log_path(generation))?;

        let mut directory = Directory {
            generation,
            ..Directory::default()
        };

        let mut pending: HashMap<u64, Vec<(RecordKey, u64, u64)>> = HashMap::new();
        for (offset, entry) in RecordLog::replay(log.path())? {
            match entry {
                LogEntry::Record {
                    txn_id,
                    key,
                    version,
                    ..
                } => {
                    directory.max_txn_id = directory.max_txn_id.max(txn_id);
                    pending.entry(txn_id).or_default().push((key, offset, version));
                }
                LogEntry::Flush { txn_id } => {
                    for (key, offset, version) in pending.remove(&txn_id).unwrap_or_default() {
                        directory.seq += 1;
                        directory.entries.entry(key).or_default().push(DirectoryEntry {
                            generation,
                            offset,
                            version,
                            seq: directory.seq,
                        });
                    }
                }
            }
        }
        for versions in directory.entries.values_mut() {
            versions.sort_by_key(|e| e.version);
        }

        if !pending.is_empty() {
            let discarded: usize = pending.values().map(Vec::len).sum();
            warn!(discarded, "discarding journaled records with no flush marker");
        }
        debug!(
            generation,
            keys = directory.entries.len(),
            "record store opened"
        );

        Ok(MemTable {
            layout,
            sync_on_flush,
            log: Mutex::new(log),
            state: RwLock::new(directory),
            pins: Arc::new(Mutex::new(HashMap::new())),
            next_pin: AtomicU64::new(1),
        })
    }

    /// Journal one record version for a transaction. The write is
    /// invisible to readers until `flush` promotes it. At most one
    /// transaction may have an in-flight write per key.
    pub fn write(
        &self,
        txn_id: u64,
        key: RecordKey,
        version: u64,
        payload: Vec<u8>,
    ) -> Result<u64> {
        let mut log = self.log.lock();
        let mut state = self.state.write();
        state.max_txn_id = state.max_txn_id.max(txn_id);

        if let Some(existing) = state.provisional.get(&key) {
            if existing.txn_id != txn_id {
                return Err(Error::new(
                    ErrorKind::ConcurrentWriteConflict,
                    format!(
                        "key '{}' has an in-flight write from transaction {}",
                        key, existing.txn_id
                    ),
                ));
            }
        }

        let offset = log.append(&LogEntry::Record {
            txn_id,
            key: key.clone(),
            version,
            payload,
            written_at: Utc::now(),
        })?;
        state.provisional.insert(
            key,
            Provisional {
                txn_id,
                offset,
                version,
            },
        );
        Ok(offset)
    }

    /// Promote every provisional write of a transaction to the
    /// directory, making it durable and visible. Returns the number
    /// of records promoted.
    pub fn flush(&self, txn_id: u64) -> Result<usize> {
        let mut log = self.log.lock();
        let mut state = self.state.write();

        let keys: Vec<RecordKey> = state
            .provisional
            .iter()
            .filter(|(_, p)| p.txn_id == txn_id)
            .map(|(k, _)| k.clone())
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        log.append(&LogEntry::Flush { txn_id })?;
        if self.sync_on_flush {
            log.sync()?;
        }

        let generation = state.generation;
        for key in &keys {
            if let Some(p) = state.provisional.remove(key) {
                state.seq += 1;
                let seq = state.seq;
                let versions = state.entries.entry(key.clone()).or_default();
                versions.push(DirectoryEntry {
                    generation,
                    offset: p.offset,
                    version: p.version,
                    seq,
                });
                versions.sort_by_key(|e| e.version);
            }
        }

        debug!(txn_id, promoted = keys.len(), "flushed transaction records");
        Ok(keys.len())
    }

    /// Drop every provisional write of a transaction. The journaled
    /// frames stay in the log as garbage until compaction.
    pub fn rollback(&self, txn_id: u64) -> usize {
        let mut state = self.state.write();
        let before = state.provisional.len();
        state.provisional.retain(|_, p| p.txn_id != txn_id);
        before - state.provisional.len()
    }

    /// Read the latest durable payload for a key.
    ///
    /// A key that only has an unflushed write reports
    /// `RecordNotYetWritten`, which callers can retry after the owning
    /// transaction commits; an unknown key reports `NotFound`.
    pub fn read(&self, key: &RecordKey) -> Result<Vec<u8>> {
        // The directory lock stays held across the file read: compaction
        // swaps the directory and deletes the old generation under the
        // write lock, so releasing early would let the file vanish
        // between the lookup and the read.
        let state = self.state.read();
        match state.entries.get(key).and_then(|v| v.last()) {
            Some(entry) => self.payload_at(entry.generation, entry.offset),
            None if state.provisional.contains_key(key) => Err(Error::new(
                ErrorKind::RecordNotYetWritten,
                format!("key '{}' is journaled but not flushed", key),
            )),
            None => Err(Error::new(
                ErrorKind::NotFound,
                format!("no record for key '{}'", key),
            )),
        }
    }

    pub fn latest(&self, key: &RecordKey) -> Option<DirectoryEntry> {
        self.state.read().entries.get(key).and_then(|v| v.last().copied())
    }

    /// Latest durable payload of every key, sorted by key. Holds the
    /// directory lock for the whole scan so compaction cannot delete a
    /// generation mid-read.
    pub fn scan_latest(&self) -> Result<Vec<(RecordKey, Vec<u8>)>> {
        let state = self.state.read();
        let mut locations: Vec<(RecordKey, u64, u64)> = state
            .entries
            .iter()
            .filter_map(|(key, versions)| {
                versions
                    .last()
                    .map(|e| (key.clone(), e.generation, e.offset))
            })
            .collect();
        locations.sort_by(|a, b| a.0.cmp(&b.0));

        let mut records = Vec::with_capacity(locations.len());
        for (key, generation, offset) in locations {
            records.push((key, self.payload_at(generation, offset)?));
        }
        Ok(records)
    }

    /// Highest record version present in the directory. Used to
    /// re-seat version sequences after recovery.
    pub fn max_version(&self) -> u64 {
        self.state
            .read()
            .entries
            .values()
            .flat_map(|v| v.iter().map(|e| e.version))
            .max()
            .unwrap_or(0)
    }

    pub fn max_txn_id(&self) -> u64 {
        self.state.read().max_txn_id
    }

    pub fn key_count(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Durable versions beyond the latest one of each key.
    pub fn superseded_count(&self) -> usize {
        self.state
            .read()
            .entries
            .values()
            .map(|v| v.len().saturating_sub(1))
            .sum()
    }

    /// Pin the current promotion watermark so superseded versions a
    /// reader may still visit survive compaction.
    pub fn pin_snapshot(&self) -> SnapshotPin {
        let watermark = self.state.read().seq;
        let id = self.next_pin.fetch_add(1, Ordering::Relaxed);
        self.pins.lock().insert(id, watermark);
        SnapshotPin {
            pins: Arc::clone(&self.pins),
            id,
            watermark,
        }
    }

    /// Every distinct live pin watermark, ascending. Compaction must
    /// keep, per key, the newest version visible at each of them.
    pub(crate) fn pinned_watermarks(&self) -> Vec<u64> {
        let mut watermarks: Vec<u64> = self.pins.lock().values().copied().collect();
        watermarks.sort_unstable();
        watermarks.dedup();
        watermarks
    }

    fn payload_at(&self, generation: u64, offset: u64) -> Result<Vec<u8>> {
        match RecordLog::read_entry_at(&self.layout.log_path(generation), offset)? {
            LogEntry::Record { payload, .. } => Ok(payload),
            LogEntry::Flush { .. } => Err(Error::new(
                ErrorKind::Internal,
                format!(
                    "directory points at a flush marker (generation {}, offset {})",
                    generation, offset
                ),
            )),
        }
    }
}
