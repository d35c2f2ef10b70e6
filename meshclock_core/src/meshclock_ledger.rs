//! The causal log: an append-only record of every message a peer sends or
//! receives, with the logical and wall-clock times it was stamped with.
//!
//! Entries live in memory and can be mirrored to a `LogSink`. The file sink
//! writes one line per entry and flushes before returning, so a log on disk
//! is complete up to the last finished message even if the process dies.

use crate::meshclock_time::VectorClock;
use crate::meshclock_wire::Direction;
use meshclock_env::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("causal log I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Wall-clock instant as seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallTime {
    pub secs: u64,
    pub nanos: u32,
}

impl From<SystemTime> for WallTime {
    fn from(time: SystemTime) -> Self {
        // Pre-epoch clocks collapse to zero rather than failing the event.
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            secs: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        }
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// One send or receive, never mutated after append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub counterparty: PeerId,
    pub direction: Direction,
    /// Amount moved by this event; 0 when the message type was not understood
    pub amount: u32,
    pub lamport: u64,
    pub vector: VectorClock,
    pub wall: WallTime,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.counterparty, self.lamport, self.vector, self.wall
        )
    }
}

/// Destination that mirrors log entries as they are appended.
pub trait LogSink: Send {
    fn append(&mut self, entry: &LogEntry) -> Result<(), LedgerError>;
}

/// Line-oriented log file, flushed after every entry.
pub struct FileLogSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileLogSink {
    /// Creates (or truncates) the log file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| LedgerError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Creates `<dir>/peer_<id>.log`, creating `dir` if needed.
    pub fn for_peer(dir: impl AsRef<Path>, peer: PeerId) -> Result<Self, LedgerError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| LedgerError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Self::create(dir.join(format!("peer_{}.log", peer)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileLogSink {
    fn append(&mut self, entry: &LogEntry) -> Result<(), LedgerError> {
        writeln!(self.writer, "{}", entry)
            .and_then(|_| self.writer.flush())
            .map_err(|source| LedgerError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Append-only per-peer log.
#[derive(Default)]
pub struct CausalLog {
    entries: Vec<LogEntry>,
    sink: Option<Box<dyn LogSink>>,
}

impl CausalLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrors every future append to `sink`.
    pub fn with_sink(sink: Box<dyn LogSink>) -> Self {
        Self {
            entries: Vec::new(),
            sink: Some(sink),
        }
    }

    /// Appends an entry.
    ///
    /// The in-memory record always grows; a sink failure is reported to the
    /// caller after the fact.
    pub fn append(&mut self, entry: LogEntry) -> Result<(), LedgerError> {
        let mirrored = match self.sink.as_mut() {
            Some(sink) => sink.append(&entry),
            None => Ok(()),
        };
        self.entries.push(entry);
        mirrored
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    /// Entries in a given direction, in append order.
    pub fn by_direction(&self, direction: Direction) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.direction == direction)
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}

impl fmt::Debug for CausalLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CausalLog")
            .field("entries", &self.entries.len())
            .field("mirrored", &self.sink.is_some())
            .finish()
    }
}
