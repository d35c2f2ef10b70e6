//! MeshClock Core - Logical Clocks over a Full-Mesh Money-Transfer Ledger
//!
//! Pure, I/O-free building blocks for a peer in the mesh:
//! 1. **Time**: Lamport scalar and vector clock update rules
//! 2. **Wire**: Fixed-width frame layout for transfer messages
//! 3. **Ledger**: Append-only causal log of every send and receive
//! 4. **Peer state**: Balance, clocks and log advanced together per event

pub mod meshclock_time;
pub mod meshclock_wire;
pub mod meshclock_ledger;
pub mod peer_state;

// Re-export key types for convenience
pub use meshclock_time::{ClockError, LamportClock, VectorClock};
pub use meshclock_wire::{Direction, MessageKind, TransferMessage, WireError, WireFrame, MAX_TRANSFER};
pub use meshclock_ledger::{CausalLog, FileLogSink, LedgerError, LogEntry, LogSink, WallTime};
pub use peer_state::{PeerState, TransferError, INITIAL_BALANCE};
