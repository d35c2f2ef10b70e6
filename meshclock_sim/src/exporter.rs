//! Run reports and JSON export.
//!
//! Every finished peer produces a `PeerReport`; the runner gathers them into
//! a `RunSummary` that can be printed or written to disk for later analysis.

use crate::audit::AuditReport;
use meshclock_core::{LogEntry, VectorClock};
use meshclock_env::PeerId;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Final state of one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerReport {
    pub id: PeerId,
    pub balance: i64,
    pub lamport_next: u64,
    pub vector: VectorClock,
    pub steps: u64,
    pub sent: u64,
    pub received: u64,
    pub unknown_messages: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    /// Sends skipped while the target's queue drained
    #[serde(default)]
    pub channel_full: u64,

    /// Full causal log, in append order
    pub log: Vec<LogEntry>,
}

/// A peer that did not finish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerFailure {
    pub id: PeerId,
    pub error: String,
}

/// Everything a bounded run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Base seed used
    pub seed: u64,

    pub num_peers: usize,

    /// Event-loop discipline name
    pub discipline: String,

    /// Reports of peers that finished, ordered by id
    pub peers: Vec<PeerReport>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failures: Vec<PeerFailure>,

    /// Cross-peer causality checks over the finished peers
    pub audit: AuditReport,
}

impl RunSummary {
    /// True when every peer finished and the audit found nothing.
    pub fn passed(&self) -> bool {
        self.failures.is_empty() && self.audit.passed()
    }

    /// Sum of all final balances.
    pub fn total_balance(&self) -> i64 {
        self.peers.iter().map(|p| p.balance).sum()
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
