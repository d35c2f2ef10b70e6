//! Wire protocol for transfer messages.
//!
//! A frame is a fixed sequence of fixed-width little-endian integers, with no
//! length prefix. Both ends know N, so both know the frame width:
//!
//! ```text
//! ┌──────────────┬───────────────────────┬──────────┬──────────┐
//! │ lamport: u64 │ vector: N x u64       │ tag: u32 │ amt: u32 │
//! └──────────────┴───────────────────────┴──────────┴──────────┘
//! ```

use crate::meshclock_ledger::WallTime;
use crate::meshclock_time::VectorClock;
use meshclock_env::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const LAMPORT_WIDTH: usize = 8;
const VECTOR_SLOT_WIDTH: usize = 8;
const TAG_WIDTH: usize = 4;
const AMOUNT_WIDTH: usize = 4;

/// Transfer amounts are drawn from `0..MAX_TRANSFER`.
pub const MAX_TRANSFER: u32 = 256;

/// Errors reading a frame off a channel.
#[derive(Debug, Error)]
pub enum WireError {
    /// Fewer bytes were available than the field needs
    #[error("short read on {field}: expected {expected} bytes, got {actual}")]
    ShortRead {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message type tag carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    MoneyTransfer,
}

impl MessageKind {
    pub fn tag(&self) -> u32 {
        match self {
            MessageKind::MoneyTransfer => 1,
        }
    }

    /// Returns `None` for tags this peer does not understand.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(MessageKind::MoneyTransfer),
            _ => None,
        }
    }
}

/// Whether a message was observed leaving or arriving. Never on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

/// The fields that actually cross a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub lamport: u64,
    pub vector: VectorClock,
    pub tag: u32,
    pub amount: u32,
}

impl WireFrame {
    /// Byte width of one frame in a mesh of `num_peers`.
    pub fn encoded_len(num_peers: usize) -> usize {
        LAMPORT_WIDTH + VECTOR_SLOT_WIDTH * num_peers + TAG_WIDTH + AMOUNT_WIDTH
    }

    /// Serializes the fields in wire order.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(self.vector.len()));
        out.extend_from_slice(&self.lamport.to_le_bytes());
        for slot in self.vector.as_slice() {
            out.extend_from_slice(&slot.to_le_bytes());
        }
        out.extend_from_slice(&self.tag.to_le_bytes());
        out.extend_from_slice(&self.amount.to_le_bytes());
        out
    }

    /// Reconstructs a frame field by field from the front of `bytes`.
    ///
    /// Bytes past the frame are ignored.
    pub fn decode(bytes: &[u8], num_peers: usize) -> Result<Self, WireError> {
        let mut reader = FieldReader { bytes };

        let lamport = u64::from_le_bytes(reader.take::<LAMPORT_WIDTH>("lamport timestamp")?);
        let mut slots = Vec::with_capacity(num_peers);
        for _ in 0..num_peers {
            slots.push(u64::from_le_bytes(
                reader.take::<VECTOR_SLOT_WIDTH>("vector timestamp")?,
            ));
        }
        let tag = u32::from_le_bytes(reader.take::<TAG_WIDTH>("message type")?);
        let amount = u32::from_le_bytes(reader.take::<AMOUNT_WIDTH>("transfer amount")?);

        Ok(Self {
            lamport,
            vector: VectorClock::from_entries(slots),
            tag,
            amount,
        })
    }
}

struct FieldReader<'a> {
    bytes: &'a [u8],
}

impl<'a> FieldReader<'a> {
    fn take<const W: usize>(&mut self, field: &'static str) -> Result<[u8; W], WireError> {
        if self.bytes.len() < W {
            return Err(WireError::ShortRead {
                field,
                expected: W,
                actual: self.bytes.len(),
            });
        }
        let (head, rest) = self.bytes.split_at(W);
        self.bytes = rest;
        let mut field_bytes = [0u8; W];
        field_bytes.copy_from_slice(head);
        Ok(field_bytes)
    }
}

/// A transfer as observed by one peer, on either side of the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMessage {
    pub kind: MessageKind,
    pub direction: Direction,
    pub lamport: u64,
    pub vector: VectorClock,
    pub wall: WallTime,
    pub from: PeerId,
    pub to: PeerId,
    pub amount: u32,
}

impl TransferMessage {
    /// The part of the message that goes on the wire.
    pub fn to_frame(&self) -> WireFrame {
        WireFrame {
            lamport: self.lamport,
            vector: self.vector.clone(),
            tag: self.kind.tag(),
            amount: self.amount,
        }
    }
}
