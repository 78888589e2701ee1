//! Bounded, cursor-readable event log for migration runs.
//!
//! Each entry gets a sequence number that increases for the whole process
//! lifetime, so a poller can remember the highest sequence it has seen and
//! ask only for newer entries. When the buffer exceeds its capacity the
//! oldest entries are evicted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};
use tracing::{error, info, warn};

/// Default number of entries retained.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationLogEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

struct Buffer {
    last_sequence: u64,
    entries: VecDeque<MigrationLogEntry>,
}

pub struct MigrationLog {
    capacity: usize,
    buffer: RwLock<Buffer>,
}

impl Default for MigrationLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl MigrationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: RwLock::new(Buffer {
                last_sequence: 0,
                entries: VecDeque::new(),
            }),
        }
    }

    /// Append an entry and mirror it to tracing. Returns its sequence.
    pub fn append(&self, level: LogLevel, message: impl Into<String>, detail: Option<Value>) -> u64 {
        let message = message.into();

        match level {
            LogLevel::Info => info!(detail = ?detail, "{}", message),
            LogLevel::Warning => warn!(detail = ?detail, "{}", message),
            LogLevel::Error => error!(detail = ?detail, "{}", message),
        }

        let mut buffer = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
        // Assigned under the lock so buffer order always matches sequence order
        buffer.last_sequence += 1;
        let sequence = buffer.last_sequence;
        buffer.entries.push_back(MigrationLogEntry {
            sequence,
            timestamp: Utc::now(),
            level,
            message,
            detail,
        });
        while buffer.entries.len() > self.capacity {
            buffer.entries.pop_front();
        }
        sequence
    }

    pub fn info(&self, message: impl Into<String>, detail: Option<Value>) -> u64 {
        self.append(LogLevel::Info, message, detail)
    }

    pub fn warning(&self, message: impl Into<String>, detail: Option<Value>) -> u64 {
        self.append(LogLevel::Warning, message, detail)
    }

    pub fn error(&self, message: impl Into<String>, detail: Option<Value>) -> u64 {
        self.append(LogLevel::Error, message, detail)
    }

    /// Entries with `sequence > since` in ascending order, or every retained
    /// entry when `since` is `None`.
    pub fn entries_since(&self, since: Option<u64>) -> Vec<MigrationLogEntry> {
        let buffer = self.buffer.read().unwrap_or_else(PoisonError::into_inner);
        let start = match since {
            Some(since) => buffer.entries.partition_point(|e| e.sequence <= since),
            None => 0,
        };
        buffer.entries.range(start..).cloned().collect()
    }

    /// Highest sequence handed out so far, 0 if none.
    pub fn last_sequence(&self) -> u64 {
        self.buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_sequence
    }

    /// Drop every entry. Sequence numbers keep counting up.
    pub fn clear(&self) {
        self.buffer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clear();
    }

    pub fn len(&self) -> usize {
        self.buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cursor_returns_only_newer_entries() {
        let log = MigrationLog::new(100);
        for i in 1..=5 {
            log.info(format!("entry {}", i), None);
        }

        let all = log.entries_since(None);
        assert_eq!(all.len(), 5);
        assert_eq!(
            all.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );

        let newer = log.entries_since(Some(3));
        assert_eq!(
            newer.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![4, 5]
        );

        assert!(log.entries_since(Some(5)).is_empty());
        assert!(log.entries_since(Some(99)).is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let log = MigrationLog::new(3);
        for i in 0..5 {
            log.info(format!("entry {}", i), None);
        }

        let seqs: Vec<u64> = log.entries_since(None).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        // A cursor older than the retained window gets everything still held
        assert_eq!(log.entries_since(Some(1)).len(), 3);
    }

    #[test]
    fn clear_keeps_sequence_counting() {
        let log = MigrationLog::new(10);
        log.info("first run", None);
        log.info("first run done", None);
        log.clear();
        assert!(log.is_empty());

        let seq = log.warning("second run", Some(json!({ "key": "a.bin" })));
        assert_eq!(seq, 3);
        assert_eq!(log.last_sequence(), 3);

        let entries = log.entries_since(None);
        assert_eq!(entries[0].level, LogLevel::Warning);
        assert_eq!(entries[0].detail, Some(json!({ "key": "a.bin" })));
    }

    #[test]
    fn entry_serializes_without_empty_detail() {
        let log = MigrationLog::new(10);
        log.error("boom", None);
        let json = serde_json::to_string(&log.entries_since(None)[0]).unwrap();
        assert!(json.contains(r#""level":"error""#));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn concurrent_appends_stay_ordered() {
        let log = std::sync::Arc::new(MigrationLog::new(10_000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        log.info(format!("thread {} entry {}", t, i), None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let seqs: Vec<u64> = log.entries_since(None).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs.len(), 1000);
        assert!(seqs.windows(2).all(|w| w[0] + 1 == w[1]));
    }
}
