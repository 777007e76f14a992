//! The in-memory replicated log.
//!
//! A log holds the contiguous entries `[log_start, log_end)` on top of a
//! snapshot prefix summarizing everything before `log_start`. A log entry
//! with index 1 never really exists; the initial snapshot for a cluster is
//! considered to include it, so the first real entry has index 2.
//!
//! A new cluster starts with an empty log: `log_start = 2, log_end = 2`.
//! Over time the log grows to `log_end = N`; taking a snapshot advances
//! `log_start` and folds the discarded prefix into the snapshot summary.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::membership::ServerConfig;
use crate::types::{LogIndex, Term};

/// Serde helper for `Arc<Vec<u8>>` payloads.
/// Serializes as raw bytes, deserializes into an Arc-wrapped Vec.
pub(crate) mod arc_bytes {
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

/// Payload of one log entry.
///
/// `Data` carries an opaque command for the application state machine plus
/// the entry id used for command prerequisites; `Servers` carries a new
/// cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryPayload {
    Data {
        #[serde(with = "arc_bytes")]
        data: Arc<Vec<u8>>,
        eid: Uuid,
    },
    Servers {
        servers: ServerConfig,
    },
}

impl EntryPayload {
    pub fn is_servers(&self) -> bool {
        matches!(self, EntryPayload::Servers { .. })
    }
}

/// A single entry in the replicated log.
///
/// Entries are immutable once appended and do not carry their own index:
/// indices are dense, so an entry's position in the log determines it.
/// The data is Arc-wrapped for O(1) cloning into outgoing RPCs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub payload: EntryPayload,
}

impl LogEntry {
    /// Create a command entry.
    pub fn data(term: Term, data: Vec<u8>, eid: Uuid) -> Self {
        Self {
            term,
            payload: EntryPayload::Data {
                data: Arc::new(data),
                eid,
            },
        }
    }

    /// Create a configuration entry.
    pub fn servers(term: Term, servers: ServerConfig) -> Self {
        Self {
            term,
            payload: EntryPayload::Servers { servers },
        }
    }
}

/// The replicated log plus its snapshot prefix.
#[derive(Debug)]
pub struct RaftLog {
    /// Entry at index `i` is `entries[i - log_start]`.
    entries: VecDeque<LogEntry>,
    /// Index of the first in-memory entry.
    log_start: LogIndex,
    /// Term of the entry at `log_start - 1`, established by snapshot.
    prev_term: Term,
    /// Entry id as of `log_start - 1`.
    prev_eid: Uuid,
    /// Committed membership as of `log_start - 1`.
    prev_servers: ServerConfig,
    /// State-machine bytes as of `log_start - 1`; may be empty.
    snapshot: Arc<Vec<u8>>,
    /// Whether `snapshot` is valid UTF-8, for chunking.
    snapshot_is_text: bool,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            log_start: 1,
            prev_term: 0,
            prev_eid: Uuid::nil(),
            prev_servers: ServerConfig::new(),
            snapshot: Arc::new(Vec::new()),
            snapshot_is_text: true,
        }
    }

    /// Reset the snapshot prefix, discarding any in-memory entries.
    /// Used when folding the snapshot record during replay.
    pub fn reset_snapshot(
        &mut self,
        prev_index: LogIndex,
        prev_term: Term,
        prev_eid: Uuid,
        prev_servers: ServerConfig,
        data: Arc<Vec<u8>>,
    ) {
        self.entries.clear();
        self.log_start = prev_index + 1;
        self.prev_term = prev_term;
        self.prev_eid = prev_eid;
        self.prev_servers = prev_servers;
        self.snapshot_is_text = std::str::from_utf8(&data).is_ok();
        self.snapshot = data;
    }

    pub fn log_start(&self) -> LogIndex {
        self.log_start
    }

    /// One past the last appended index.
    pub fn log_end(&self) -> LogIndex {
        self.log_start + self.entries.len() as u64
    }

    /// Index of the entry immediately before `log_start`.
    pub fn prev_index(&self) -> LogIndex {
        self.log_start - 1
    }

    pub fn prev_term(&self) -> Term {
        self.prev_term
    }

    pub fn prev_eid(&self) -> Uuid {
        self.prev_eid
    }

    pub fn prev_servers(&self) -> &ServerConfig {
        &self.prev_servers
    }

    pub fn snapshot(&self) -> &Arc<Vec<u8>> {
        &self.snapshot
    }

    pub fn snapshot_is_text(&self) -> bool {
        self.snapshot_is_text
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last appended entry (the snapshot sentinel if empty).
    pub fn last_index(&self) -> LogIndex {
        self.log_end() - 1
    }

    /// Term of the last appended entry, or `prev_term` if the log is empty.
    pub fn last_term(&self) -> Term {
        self.entries.back().map_or(self.prev_term, |e| e.term)
    }

    /// Entry id of the most recent command entry, falling back to the
    /// snapshot's entry id. Used to validate command prerequisites.
    pub fn last_eid(&self) -> Uuid {
        for entry in self.entries.iter().rev() {
            if let EntryPayload::Data { eid, .. } = &entry.payload {
                return *eid;
            }
        }
        self.prev_eid
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.log_start || index >= self.log_end() {
            return None;
        }
        self.entries.get((index - self.log_start) as usize)
    }

    /// Term at `index`. `term_at(log_start - 1)` is the snapshot's
    /// `prev_term`; anything earlier or past the end is unknown.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.prev_index() {
            return Some(self.prev_term);
        }
        self.entry(index).map(|e| e.term)
    }

    /// Push a new entry, returning its index.
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        let index = self.log_end();
        self.entries.push_back(entry);
        index
    }

    /// Drop the in-memory suffix so that `log_end` becomes `new_end`.
    ///
    /// Doesn't write anything to disk: at replay time a later record with
    /// `index < log_end` re-performs the truncation. Returns true if any
    /// removed entry was a configuration entry, so membership can be
    /// recomputed.
    pub fn truncate(&mut self, new_end: LogIndex) -> bool {
        debug_assert!(new_end >= self.log_start);
        let mut servers_changed = false;
        while self.log_end() > new_end {
            if let Some(entry) = self.entries.pop_back() {
                if entry.payload.is_servers() {
                    servers_changed = true;
                }
            }
        }
        servers_changed
    }

    /// Clone up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        if start < self.log_start || start >= self.log_end() {
            return Vec::new();
        }
        let offset = (start - self.log_start) as usize;
        self.entries.iter().skip(offset).take(max).cloned().collect()
    }

    /// The membership as of the latest configuration entry at or below
    /// `index`, or the snapshot's membership if there is none.
    pub fn config_at(&self, index: LogIndex) -> ServerConfig {
        let mut i = index.min(self.last_index());
        while i >= self.log_start {
            if let Some(LogEntry {
                payload: EntryPayload::Servers { servers },
                ..
            }) = self.entry(i)
            {
                return servers.clone();
            }
            i -= 1;
        }
        self.prev_servers.clone()
    }

    /// The most recent membership in the log, committed or not.
    pub fn latest_config(&self) -> ServerConfig {
        self.config_at(self.last_index())
    }

    /// True if a configuration entry sits above `commit_index`.
    pub fn has_uncommitted_config(&self, commit_index: LogIndex) -> bool {
        let mut i = (commit_index + 1).max(self.log_start);
        while i < self.log_end() {
            if self.entry(i).is_some_and(|e| e.payload.is_servers()) {
                return true;
            }
            i += 1;
        }
        false
    }

    /// Check that a candidate's log is at least as up-to-date as ours:
    /// compare `(last term, last index)` lexicographically.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        if last_log_term != self.last_term() {
            last_log_term > self.last_term()
        } else {
            last_log_index >= self.last_index()
        }
    }

    /// Advance the snapshot prefix to `new_start`, discarding entries
    /// strictly before it. Local compaction path.
    pub fn compact(
        &mut self,
        new_start: LogIndex,
        prev_term: Term,
        prev_eid: Uuid,
        prev_servers: ServerConfig,
        data: Arc<Vec<u8>>,
    ) {
        debug_assert!(new_start >= self.log_start && new_start <= self.log_end());
        while self.log_start < new_start {
            self.entries.pop_front();
            self.log_start += 1;
        }
        self.prev_term = prev_term;
        self.prev_eid = prev_eid;
        self.prev_servers = prev_servers;
        self.snapshot_is_text = std::str::from_utf8(&data).is_ok();
        self.snapshot = data;
    }

    /// Install a snapshot received from the leader, keeping any in-memory
    /// entries strictly above `last_index`. Returns false if the snapshot
    /// covers less than our current one and was discarded.
    pub fn install_snapshot(
        &mut self,
        last_index: LogIndex,
        last_term: Term,
        last_eid: Uuid,
        servers: ServerConfig,
        data: Vec<u8>,
    ) -> bool {
        let new_start = last_index + 1;
        if new_start < self.log_start {
            return false;
        }
        if new_start >= self.log_end() {
            self.entries.clear();
        } else {
            for _ in self.log_start..new_start {
                self.entries.pop_front();
            }
        }
        self.log_start = new_start;
        self.prev_term = last_term;
        self.prev_eid = last_eid;
        self.prev_servers = servers;
        self.snapshot_is_text = std::str::from_utf8(&data).is_ok();
        self.snapshot = Arc::new(data);
        true
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}
