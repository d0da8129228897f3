//! Raft log implementation.

use crate::error::{GeolockError, Result};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Appended by a new leader so entries from earlier terms can commit.
    Noop,
    /// A state machine command.
    Command,
}

/// A single entry in the Raft log.
///
/// Uses Arc<Vec<u8>> for the data field so replication clones are cheap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when the entry was received.
    pub term: Term,
    /// The index of this entry in the log.
    pub index: LogIndex,
    pub entry_type: EntryType,
    /// The command payload, empty for no-ops.
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

impl LogEntry {
    pub fn command(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            entry_type: EntryType::Command,
            data: Arc::new(data),
        }
    }

    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            entry_type: EntryType::Noop,
            data: Arc::new(Vec::new()),
        }
    }

    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_noop(&self) -> bool {
        self.entry_type == EntryType::Noop
    }
}

/// Serde helper module for Arc<Vec<u8>> serialization.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// The in-memory Raft log. Durability is handled by `RaftStorage`.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the index of the last log entry, 0 when empty.
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    /// Get the term of the last log entry, 0 when empty.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry; its index must directly follow the last one.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected_index = self.last_index() + 1;
        if entry.index != expected_index {
            return Err(GeolockError::RaftLog(format!(
                "Expected index {}, got {}",
                expected_index, entry.index
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term at `index`. Index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// Up to `limit` entries starting at `start_index`.
    pub fn entries_from(&self, start_index: LogIndex, limit: usize) -> Vec<LogEntry> {
        let start = start_index.max(1);
        if start > self.last_index() {
            return Vec::new();
        }
        self.entries
            .iter()
            .skip((start - 1) as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Entries in the inclusive range [start, end].
    pub fn entries_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        if end < start {
            return Vec::new();
        }
        self.entries_from(start, (end - start + 1) as usize)
    }

    /// Truncate the log from the given index (inclusive).
    pub fn truncate_from(&mut self, index: LogIndex) {
        self.entries.truncate(index.saturating_sub(1) as usize);
    }

    /// Check if our log has an entry at `prev_log_index` with `prev_log_term`.
    pub fn matches(&self, prev_log_index: LogIndex, prev_log_term: Term) -> bool {
        match self.term_at(prev_log_index) {
            Some(term) => term == prev_log_term,
            None => false,
        }
    }

    /// First index of the run of entries sharing the term at `index`.
    pub fn first_index_of_term(&self, index: LogIndex) -> LogIndex {
        let term = match self.term_at(index) {
            Some(t) => t,
            None => return index,
        };
        let mut idx = index;
        while idx > 1 && self.term_at(idx - 1) == Some(term) {
            idx -= 1;
        }
        idx
    }

    /// Check if a candidate's log is at least as up-to-date as ours.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_last_term = self.last_term();
        if last_log_term != our_last_term {
            last_log_term > our_last_term
        } else {
            last_log_index >= self.last_index()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[Term]) -> RaftLog {
        let mut log = RaftLog::new();
        for (i, term) in terms.iter().enumerate() {
            log.append(LogEntry::command(*term, i as u64 + 1, vec![i as u8])).unwrap();
        }
        log
    }

    #[test]
    fn test_empty_log() {
        let log = RaftLog::new();
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
    }

    #[test]
    fn test_append_rejects_gaps() {
        let mut log = log_with_terms(&[1, 1]);
        assert!(log.append(LogEntry::noop(1, 4)).is_err());
        log.append(LogEntry::noop(2, 3)).unwrap();
        assert_eq!(log.last_term(), 2);
        assert!(log.get(3).unwrap().is_noop());
    }

    #[test]
    fn test_entries_from_respects_limit() {
        let log = log_with_terms(&[1, 1, 2, 2, 3]);
        assert_eq!(log.entries_from(2, 2).len(), 2);
        assert_eq!(log.entries_from(4, 100).len(), 2);
        assert!(log.entries_from(6, 100).is_empty());
        assert_eq!(
            log.entries_range(2, 4).iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert!(log.entries_range(4, 3).is_empty());
    }

    #[test]
    fn test_truncate() {
        let mut log = log_with_terms(&[1, 1, 1]);
        log.truncate_from(2);
        assert_eq!(log.last_index(), 1);
        log.truncate_from(0);
        assert!(log.is_empty());
    }

    #[test]
    fn test_matches() {
        let log = log_with_terms(&[1, 2]);
        assert!(log.matches(0, 0));
        assert!(log.matches(2, 2));
        assert!(!log.matches(2, 1));
        assert!(!log.matches(3, 2));
    }

    #[test]
    fn test_first_index_of_term() {
        let log = log_with_terms(&[1, 2, 2, 2, 3]);
        assert_eq!(log.first_index_of_term(4), 2);
        assert_eq!(log.first_index_of_term(1), 1);
        assert_eq!(log.first_index_of_term(5), 5);
    }

    #[test]
    fn test_is_up_to_date() {
        let log = log_with_terms(&[1, 2]);
        assert!(log.is_up_to_date(1, 3));
        assert!(log.is_up_to_date(3, 2));
        assert!(log.is_up_to_date(2, 2));
        assert!(!log.is_up_to_date(1, 2));
        assert!(!log.is_up_to_date(3, 1));
    }
}
