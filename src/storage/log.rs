use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::error::{Error, ErrorKind, Result};

/// Maximum accepted frame size; larger lengths indicate corruption.
const MAX_FRAME_LEN: usize = 16_000_000;

/// Stable identifier of a stored record, independent of where its
/// versions live in the log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey(pub String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        RecordKey(key.into())
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One frame in the append-only record log.
///
/// Record frames are provisional until a Flush frame for the same
/// transaction follows them. Recovery discards records whose
/// transaction never reached its Flush marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogEntry {
    Record {
        txn_id: u64,
        key: RecordKey,
        version: u64,
        payload: Vec<u8>,
        written_at: DateTime<Utc>,
    },
    Flush {
        txn_id: u64,
    },
}

/// Append-only log file. Frames are length-prefixed bincode followed
/// by a CRC32 of the serialized bytes.
pub struct RecordLog {
    file: File,
    path: PathBuf,
    position: u64,
}

impl RecordLog {
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let position = file.metadata()?.len();

        Ok(RecordLog {
            file,
            path,
            position,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Append one frame and return the offset it starts at.
    pub fn append(&mut self, entry: &LogEntry) -> Result<u64> {
        let offset = self.position;
        let data = bincode::serialize(entry)?;
        let len = data.len() as u32;
        let crc = crc32fast::hash(&data);

        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&data)?;
        self.file.write_all(&crc.to_le_bytes())?;

        self.position += 4 + data.len() as u64 + 4;
        Ok(offset)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Read one frame at a known offset, verifying its checksum.
    pub fn read_entry_at(path: &Path, offset: u64) -> Result<LogEntry> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::new(
                ErrorKind::Codec,
                format!("frame at offset {} has implausible length {}", offset, len),
            ));
        }

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)?;

        let mut crc_buf = [0u8; 4];
        file.read_exact(&mut crc_buf)?;
        let expected = u32::from_le_bytes(crc_buf);
        let actual = crc32fast::hash(&data);
        if actual != expected {
            return Err(Error::new(
                ErrorKind::Codec,
                format!(
                    "checksum mismatch at offset {}: expected {:08x}, got {:08x}",
                    offset, expected, actual
                ),
            ));
        }

        Ok(bincode::deserialize(&data)?)
    }

    /// Read every intact frame from the start of a log file, paired
    /// with its offset. A torn or corrupt tail ends the scan with a
    /// warning; everything before it is still returned.
    pub fn replay(path: &Path) -> Result<Vec<(u64, LogEntry)>> {
        let mut entries = Vec::new();
        let mut file = File::open(path)?;
        let mut offset = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_FRAME_LEN {
                warn!(offset, len, "implausible frame length, truncating replay");
                break;
            }

            let mut data = vec![0u8; len];
            if file.read_exact(&mut data).is_err() {
                warn!(offset, "torn frame at end of log, truncating replay");
                break;
            }

            let mut crc_buf = [0u8; 4];
            if file.read_exact(&mut crc_buf).is_err() {
                warn!(offset, "missing checksum at end of log, truncating replay");
                break;
            }
            if crc32fast::hash(&data) != u32::from_le_bytes(crc_buf) {
                warn!(offset, "checksum mismatch, truncating replay");
                break;
            }

            match bincode::deserialize::<LogEntry>(&data) {
                Ok(entry) => entries.push((offset, entry)),
                Err(e) => {
                    warn!(offset, error = %e, "undecodable frame, truncating replay");
                    break;
                }
            }

            offset += 4 + len as u64 + 4;
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(txn_id: u64, key: &str, version: u64, payload: &[u8]) -> LogEntry {
        LogEntry::Record {
            txn_id,
            key: RecordKey::new(key),
            version,
            payload: payload.to_vec(),
            written_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records_00000000.dat");
        let mut log = RecordLog::open(path.clone()).unwrap();

        let off_a = log.append(&record(1, "entity/1", 1, b"alpha")).unwrap();
        let off_b = log.append(&record(1, "entity/2", 2, b"beta")).unwrap();
        log.sync().unwrap();
        assert_eq!(off_a, 0);
        assert!(off_b > off_a);

        match RecordLog::read_entry_at(&path, off_b).unwrap() {
            LogEntry::Record { key, payload, .. } => {
                assert_eq!(key, RecordKey::new("entity/2"));
                assert_eq!(payload, b"beta");
            }
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn test_replay_returns_offsets_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records_00000000.dat");
        let mut log = RecordLog::open(path.clone()).unwrap();

        let offsets = vec![
            log.append(&record(7, "a", 1, b"x")).unwrap(),
            log.append(&record(7, "b", 1, b"y")).unwrap(),
            log.append(&LogEntry::Flush { txn_id: 7 }).unwrap(),
        ];
        drop(log);

        let replayed = RecordLog::replay(&path).unwrap();
        assert_eq!(replayed.len(), 3);
        let replayed_offsets: Vec<u64> = replayed.iter().map(|(o, _)| *o).collect();
        assert_eq!(replayed_offsets, offsets);
        assert!(matches!(replayed[2].1, LogEntry::Flush { txn_id: 7 }));
    }

    #[test]
    fn test_replay_tolerates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records_00000000.dat");
        let mut log = RecordLog::open(path.clone()).unwrap();
        log.append(&record(1, "a", 1, b"keep")).unwrap();
        log.append(&record(1, "b", 1, b"keep too")).unwrap();
        drop(log);

        // Simulate a crash mid-append: chop bytes off the last frame.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let replayed = RecordLog::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
    }

    #[test]
    fn test_read_entry_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records_00000000.dat");
        let mut log = RecordLog::open(path.clone()).unwrap();
        let offset = log.append(&record(1, "a", 1, b"payload")).unwrap();
        drop(log);

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let err = RecordLog::read_entry_at(&path, offset).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Codec);
    }
}
