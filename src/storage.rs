//! The on-disk cluster log.
//!
//! A cluster log is an append-only file: a magic first line identifying the
//! format, then a stream of newline-delimited JSON records. Three record
//! shapes exist:
//!
//! - header `{cluster_id, server_id}` — written once at cluster creation, or
//!   when a joining server first learns the cluster id;
//! - snapshot `{prev_term, prev_index, prev_eid, prev_servers, data}` —
//!   written on compaction and at the head of every log rewrite;
//! - log record `{term, index?, data?, eid?, servers?, vote?}` — an appended
//!   entry when `index` is present, otherwise a term/vote advance.
//!
//! Replay folds the records in order. A trailing truncated record is
//! treated as a crash during append and discarded; anything else malformed
//! is fatal for resuming the cluster.
//!
//! Durability is split: this module writes, the durability worker holds the
//! only handle that fsyncs (see [`crate::durability`]).

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{RegattaError, Result};
use crate::log::{arc_bytes, EntryPayload, LogEntry};
use crate::membership::ServerConfig;
use crate::types::{ClusterId, LogIndex, ServerId, Term};

/// Magic string identifying a cluster log file.
pub const LOG_MAGIC: &str = "REGATTA CLUSTER LOG 1";

/// The header record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub cluster_id: ClusterId,
    pub server_id: ServerId,
}

/// The snapshot record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub prev_term: Term,
    pub prev_index: LogIndex,
    pub prev_eid: Uuid,
    pub prev_servers: ServerConfig,
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

/// A log record: an entry append, or a term/vote advance when `index` is
/// absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub term: Term,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<LogIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_bytes::ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<ServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<ServerId>,
}

impl LogRecord {
    /// A term/vote advance.
    pub fn state(term: Term, vote: Option<ServerId>) -> Self {
        Self {
            term,
            index: None,
            data: None,
            eid: None,
            servers: None,
            vote,
        }
    }

    /// An appended entry.
    pub fn entry(index: LogIndex, entry: &LogEntry) -> Self {
        let mut record = Self::state(entry.term, None);
        record.index = Some(index);
        match &entry.payload {
            EntryPayload::Data { data, eid } => {
                record.data = Some(serde_bytes::ByteBuf::from(data.as_slice().to_vec()));
                record.eid = Some(*eid);
            }
            EntryPayload::Servers { servers } => {
                record.servers = Some(servers.clone());
            }
        }
        record
    }
}

/// Everything read back from a cluster log at open time.
#[derive(Debug, Default)]
pub struct Replay {
    pub header: Option<Header>,
    pub snapshot: Option<SnapshotRecord>,
    pub records: Vec<LogRecord>,
}

/// An open cluster log file.
///
/// All writes go through the owning task; the durability worker only ever
/// calls `sync_all` on the shared handle.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    file: Arc<File>,
}

impl LogFile {
    /// Create a new, empty cluster log. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)?;
        let mut log = Self {
            path,
            file: Arc::new(file),
        };
        log.write_line(LOG_MAGIC)?;
        Ok(log)
    }

    /// Open an existing cluster log and replay its records.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Replay)> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        let mut log = Self {
            path,
            file: Arc::new(file),
        };
        let replay = log.replay()?;
        Ok((log, replay))
    }

    /// Open a cluster log, creating an empty one if none exists.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<(Self, Replay)> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            Ok((Self::create(path)?, Replay::default()))
        }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handle for the durability worker to fsync.
    pub fn sync_handle(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }

    /// Append one record. The write is not durable until the durability
    /// worker commits it.
    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.write_line(&line)
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        (&*self.file).write_all(&buf)?;
        Ok(())
    }

    fn replay(&mut self) -> Result<Replay> {
        let mut content = String::new();
        (&*self.file).read_to_string(&mut content)?;

        let mut segments = content.split_inclusive('\n');
        match segments.next() {
            Some(first) if first.trim_end_matches('\n') == LOG_MAGIC => {}
            _ => {
                return Err(RegattaError::corrupt(&self.path, "bad magic"));
            }
        }

        let mut replay = Replay::default();
        let mut position = 0usize;
        let mut segments = segments.peekable();
        while let Some(segment) = segments.next() {
            let complete = segment.ends_with('\n');
            let line = segment.trim_end_matches('\n');
            if line.is_empty() {
                continue;
            }
            let last = segments.peek().is_none();

            let parsed: std::result::Result<(), serde_json::Error> = match position {
                0 => serde_json::from_str::<Header>(line).map(|h| {
                    replay.header = Some(h);
                }),
                1 => serde_json::from_str::<SnapshotRecord>(line).map(|s| {
                    replay.snapshot = Some(s);
                }),
                _ => serde_json::from_str::<LogRecord>(line).map(|r| {
                    replay.records.push(r);
                }),
            };

            match parsed {
                Ok(()) => {
                    if last && !complete {
                        // Complete JSON but the newline never made it out;
                        // keep the record, the next append supplies the
                        // terminator.
                        self.write_line("")?;
                    }
                    position += 1;
                }
                Err(err) if last => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "dropping truncated trailing record"
                    );
                    break;
                }
                Err(err) => {
                    return Err(RegattaError::corrupt(
                        &self.path,
                        format!("record {}: {}", position + 1, err),
                    ));
                }
            }
        }

        Ok(replay)
    }

    /// Atomically rewrite the log: `write` fills a fresh file, which then
    /// replaces this one. Used by snapshot compaction.
    pub fn replace<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce(&mut LogFile) -> Result<()>,
    {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        let _ = fs::remove_file(&tmp_path);

        let mut tmp = LogFile::create(&tmp_path)?;
        if let Err(err) = write(&mut tmp) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        tmp.file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        self.file = tmp.file;
        Ok(())
    }
}
