//! The "TIME" Engine - Lamport and Vector Clocks
//!
//! Two independent logical clocks advance on every event a peer observes:
//! a Lamport scalar that totally orders events consistently with
//! happens-before, and a vector clock that captures the partial causal
//! order exactly.
//!
//! Both are expressed as pure step functions (`next_lamport`,
//! `next_vector`) plus thin stateful wrappers used by `PeerState`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised when a carried clock cannot be merged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    /// Received vector has a different number of slots than the local one
    #[error("vector length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Owner index does not address a slot
    #[error("owner slot {owner} out of range for vector of length {len}")]
    OwnerOutOfRange { owner: usize, len: usize },
}

/// Computes one Lamport step.
///
/// Returns `(event_timestamp, new_next)`.
/// - Send (`incoming == None`): the event takes `next`, then `next + 1`.
/// - Receive: the event takes `max(incoming, next) + 1` and the counter
///   moves one past it, so a receive is strictly after the send it observes.
pub fn next_lamport(next: u64, incoming: Option<u64>) -> (u64, u64) {
    match incoming {
        None => (next, next + 1),
        Some(received) => {
            let timestamp = received.max(next) + 1;
            (timestamp, timestamp + 1)
        }
    }
}

/// Computes one vector-clock step for the peer at `owner`.
///
/// - Send (`incoming == None`): increment the owner's slot.
/// - Receive: take the pointwise max over every foreign slot, then
///   increment the owner's slot. The received value of the owner's own slot
///   is ignored.
///
/// The returned vector is a fresh value; `local` is untouched.
pub fn next_vector(
    local: &VectorClock,
    owner: usize,
    incoming: Option<&VectorClock>,
) -> Result<VectorClock, ClockError> {
    if owner >= local.len() {
        return Err(ClockError::OwnerOutOfRange {
            owner,
            len: local.len(),
        });
    }

    let mut next = local.clone();
    if let Some(received) = incoming {
        if received.len() != local.len() {
            return Err(ClockError::LengthMismatch {
                expected: local.len(),
                actual: received.len(),
            });
        }
        for (slot, (mine, theirs)) in next
            .entries
            .iter_mut()
            .zip(received.entries.iter())
            .enumerate()
        {
            if slot != owner {
                *mine = (*mine).max(*theirs);
            }
        }
    }
    next.entries[owner] += 1;
    Ok(next)
}

/// Lamport scalar clock holding the timestamp the next local event will use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    next: u64,
}

impl LamportClock {
    /// Creates a clock whose first event gets timestamp 0.
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Timestamp the next send would carry.
    pub fn next(&self) -> u64 {
        self.next
    }

    /// Stamps a send event.
    pub fn on_send(&mut self) -> u64 {
        let (timestamp, next) = next_lamport(self.next, None);
        self.next = next;
        timestamp
    }

    /// Stamps a receive event carrying `received`.
    pub fn on_receive(&mut self, received: u64) -> u64 {
        let (timestamp, next) = next_lamport(self.next, Some(received));
        self.next = next;
        timestamp
    }
}

/// Per-peer vector of logical counters, indexed by peer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: Vec<u64>,
}

impl VectorClock {
    /// Creates an all-zero vector for a mesh of `num_peers`.
    pub fn new(num_peers: usize) -> Self {
        Self {
            entries: vec![0; num_peers],
        }
    }

    /// Wraps explicit slot values.
    pub fn from_entries(entries: Vec<u64>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns slot `index`, or `None` if out of range.
    pub fn get(&self, index: usize) -> Option<u64> {
        self.entries.get(index).copied()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.entries
    }

    /// Advances the owner's slot for a send and returns an owned snapshot to
    /// attach to the outgoing message.
    ///
    /// The snapshot is independent of `self`: later local events never
    /// rewrite a timestamp that has already been sent.
    pub fn on_send(&mut self, owner: usize) -> Result<VectorClock, ClockError> {
        *self = next_vector(self, owner, None)?;
        Ok(self.clone())
    }

    /// Merges a received vector and returns a snapshot of the result for the
    /// log entry. On error the local vector is left unchanged.
    pub fn on_receive(
        &mut self,
        owner: usize,
        received: &VectorClock,
    ) -> Result<VectorClock, ClockError> {
        *self = next_vector(self, owner, Some(received))?;
        Ok(self.clone())
    }

    /// Pointwise `self >= other`. Vectors of different lengths never dominate.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|(a, b)| a >= b)
    }

    /// `self` causally precedes `other`: pointwise `<=` and not equal.
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        other.dominates(self) && self != other
    }

    /// Neither vector precedes the other.
    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        self != other && !self.happened_before(other) && !other.happened_before(self)
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, value) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, "]")
    }
}
