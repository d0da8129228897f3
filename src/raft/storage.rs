//! Persistent storage for Raft state.
//!
//! On disk a node keeps two files in its data directory:
//!
//! - `raft.state`: the bincode-encoded [`PersistentState`], replaced
//!   atomically through a temp file and rename.
//! - `raft.log`: an append-only sequence of records
//!   `[u32 len][u32 crc32][bincode LogRecord]` (little endian). A
//!   truncation is itself appended as a record, so the file is never
//!   rewritten in place.
//!
//! Replay stops at the first torn or corrupt record and the file is cut
//! back to the last good record.

use super::{LogEntry, PersistentState};
use crate::error::{GeolockError, Result};
use crate::types::LogIndex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const STATE_FILE: &str = "raft.state";
const LOG_FILE: &str = "raft.log";
const HEADER_LEN: usize = 8;

/// A record in the append-only log file.
#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Entry(LogEntry),
    Truncate { from: LogIndex },
}

enum Backend {
    Memory {
        state: Option<PersistentState>,
        entries: Vec<LogEntry>,
    },
    File {
        dir: PathBuf,
        log: File,
        sync: bool,
    },
}

/// Durable term, vote and log for one node.
pub struct RaftStorage {
    backend: Backend,
}

impl RaftStorage {
    /// Open or create file-backed storage, syncing every write.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open_with_sync(dir, true)
    }

    pub fn open_with_sync<P: AsRef<Path>>(dir: P, sync: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let log = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;
        Ok(Self {
            backend: Backend::File { dir, log, sync },
        })
    }

    /// Storage that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory {
                state: None,
                entries: Vec::new(),
            },
        }
    }

    pub fn load_persistent_state(&self) -> Result<Option<PersistentState>> {
        match &self.backend {
            Backend::Memory { state, .. } => Ok(state.clone()),
            Backend::File { dir, .. } => {
                let path = dir.join(STATE_FILE);
                if !path.exists() {
                    return Ok(None);
                }
                let data = fs::read(path)?;
                let state: PersistentState = bincode::deserialize(&data)?;
                Ok(Some(state))
            }
        }
    }

    pub fn save_persistent_state(&mut self, state: &PersistentState) -> Result<()> {
        match &mut self.backend {
            Backend::Memory { state: slot, .. } => {
                *slot = Some(state.clone());
                Ok(())
            }
            Backend::File { dir, sync, .. } => {
                let data = bincode::serialize(state)?;
                let tmp = dir.join(format!("{}.tmp", STATE_FILE));
                {
                    let mut file = File::create(&tmp)?;
                    file.write_all(&data)?;
                    if *sync {
                        file.sync_all()?;
                    }
                }
                fs::rename(tmp, dir.join(STATE_FILE))?;
                Ok(())
            }
        }
    }

    /// Replay the log. A corrupt tail is dropped from the file.
    pub fn load_log_entries(&mut self) -> Result<Vec<LogEntry>> {
        match &mut self.backend {
            Backend::Memory { entries, .. } => Ok(entries.clone()),
            Backend::File { dir, log, .. } => {
                let mut raw = Vec::new();
                File::open(dir.join(LOG_FILE))?.read_to_end(&mut raw)?;

                let (entries, valid_len) = replay(&raw);
                if valid_len < raw.len() {
                    warn!(
                        valid_len,
                        file_len = raw.len(),
                        "Dropping torn or corrupt tail of raft log"
                    );
                    log.set_len(valid_len as u64)?;
                    log.sync_all()?;
                }
                debug!(entries = entries.len(), "Replayed raft log");
                Ok(entries)
            }
        }
    }

    pub fn append_log_entries(&mut self, new_entries: &[LogEntry]) -> Result<()> {
        match &mut self.backend {
            Backend::Memory { entries, .. } => {
                entries.extend_from_slice(new_entries);
                Ok(())
            }
            Backend::File { log, sync, .. } => {
                let mut buf = Vec::new();
                for entry in new_entries {
                    encode_record(&LogRecord::Entry(entry.clone()), &mut buf)?;
                }
                log.write_all(&buf)?;
                if *sync {
                    log.sync_data()?;
                }
                Ok(())
            }
        }
    }

    /// Drop entries from `from_index` onwards.
    pub fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<()> {
        match &mut self.backend {
            Backend::Memory { entries, .. } => {
                entries.truncate(from_index.saturating_sub(1) as usize);
                Ok(())
            }
            Backend::File { log, sync, .. } => {
                let mut buf = Vec::new();
                encode_record(&LogRecord::Truncate { from: from_index }, &mut buf)?;
                log.write_all(&buf)?;
                if *sync {
                    log.sync_data()?;
                }
                Ok(())
            }
        }
    }
}

fn encode_record(record: &LogRecord, buf: &mut Vec<u8>) -> Result<()> {
    let payload = bincode::serialize(record)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| {
            GeolockError::Storage(format!("log record too large: {} bytes", payload.len()))
        })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Rebuild the entry list from raw file bytes. Returns the entries and the
/// length of the valid prefix.
fn replay(raw: &[u8]) -> (Vec<LogEntry>, usize) {
    let mut entries: Vec<LogEntry> = Vec::new();
    let mut offset = 0usize;

    while raw.len() - offset >= HEADER_LEN {
        let len = u32::from_le_bytes([
            raw[offset],
            raw[offset + 1],
            raw[offset + 2],
            raw[offset + 3],
        ]) as usize;
        let checksum = u32::from_le_bytes([
            raw[offset + 4],
            raw[offset + 5],
            raw[offset + 6],
            raw[offset + 7],
        ]);
        let start = offset + HEADER_LEN;
        let end = match start.checked_add(len) {
            Some(end) if end <= raw.len() => end,
            _ => break,
        };

        let payload = &raw[start..end];
        let actual = crc32fast::hash(payload);
        if actual != checksum {
            warn!(
                offset,
                "{}",
                GeolockError::ChecksumMismatch { expected: checksum, actual }
            );
            break;
        }

        match bincode::deserialize::<LogRecord>(payload) {
            Ok(LogRecord::Entry(entry)) => {
                let expected = entries.len() as LogIndex + 1;
                if entry.index < expected {
                    entries.truncate(entry.index.saturating_sub(1) as usize);
                } else if entry.index > expected {
                    warn!(index = entry.index, expected, "Gap in raft log, stopping replay");
                    break;
                }
                entries.push(entry);
            }
            Ok(LogRecord::Truncate { from }) => {
                entries.truncate(from.saturating_sub(1) as usize);
            }
            Err(e) => {
                warn!(offset, error = %e, "Undecodable raft log record");
                break;
            }
        }
        offset = end;
    }

    (entries, offset)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
        range.map(|i| LogEntry::command(term, i, vec![i as u8])).collect()
    }

    #[test]
    fn test_persistent_state() {
        let dir = tempdir().unwrap();
        let mut storage = RaftStorage::open(dir.path()).unwrap();
        assert!(storage.load_persistent_state().unwrap().is_none());

        let state = PersistentState {
            current_term: 5,
            voted_for: Some(3),
        };
        storage.save_persistent_state(&state).unwrap();

        let reopened = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(reopened.load_persistent_state().unwrap(), Some(state));
    }

    #[test]
    fn test_log_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut storage = RaftStorage::open(dir.path()).unwrap();
            storage.append_log_entries(&entries(1..=3, 1)).unwrap();
            storage.append_log_entries(&[LogEntry::noop(2, 4)]).unwrap();
        }

        let mut storage = RaftStorage::open(dir.path()).unwrap();
        let loaded = storage.load_log_entries().unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded[1].data_bytes(), &[2]);
        assert!(loaded[3].is_noop());
    }

    #[test]
    fn test_truncation_is_replayed() {
        let dir = tempdir().unwrap();
        {
            let mut storage = RaftStorage::open(dir.path()).unwrap();
            storage.append_log_entries(&entries(1..=3, 1)).unwrap();
            storage.truncate_log_from(2).unwrap();
            storage.append_log_entries(&entries(2..=2, 3)).unwrap();
        }

        let mut storage = RaftStorage::open(dir.path()).unwrap();
        let loaded = storage.load_log_entries().unwrap();
        assert_eq!(
            loaded.iter().map(|e| (e.index, e.term)).collect::<Vec<_>>(),
            vec![(1, 1), (2, 3)]
        );
    }

    #[test]
    fn test_corrupt_tail_is_dropped() {
        let dir = tempdir().unwrap();
        {
            let mut storage = RaftStorage::open(dir.path()).unwrap();
            storage.append_log_entries(&entries(1..=2, 1)).unwrap();
        }

        let path = dir.path().join(LOG_FILE);
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[9, 0, 0, 0, 1, 2, 3, 4, 5]).unwrap();
        }

        let mut storage = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(storage.load_log_entries().unwrap().len(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        storage.append_log_entries(&entries(3..=3, 1)).unwrap();
        let mut storage = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(storage.load_log_entries().unwrap().len(), 3);
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let mut buf = Vec::new();
        for entry in entries(1..=2, 1) {
            encode_record(&LogRecord::Entry(entry), &mut buf).unwrap();
        }
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let (loaded, valid_len) = replay(&buf);
        assert_eq!(loaded.len(), 1);
        assert!(valid_len < buf.len());
    }

    #[test]
    fn test_in_memory_backend() {
        let mut storage = RaftStorage::in_memory();
        storage.append_log_entries(&entries(1..=3, 1)).unwrap();
        storage.truncate_log_from(3).unwrap();
        assert_eq!(storage.load_log_entries().unwrap().len(), 2);

        storage
            .save_persistent_state(&PersistentState { current_term: 2, voted_for: None })
            .unwrap();
        assert_eq!(storage.load_persistent_state().unwrap().unwrap().current_term, 2);
    }
}
