//! Peer State - balance, clocks and causal log advanced together.
//!
//! `PeerState` is owned by exactly one peer task. Every send or receive goes
//! through one of two methods, each of which stamps both clocks, adjusts the
//! balance and appends exactly one log entry. Neither touches a channel; the
//! event loop moves the resulting frames.
//!
//! ```text
//!   prepare_send(to, amt)                     apply_receive(from, frame)
//!        │                                            │
//!        ├─ lamport: ts = next++                      ├─ vector: merge foreign slots, own += 1
//!        ├─ vector: own += 1, snapshot                ├─ lamport: ts = max(rx, next) + 1
//!        ├─ balance -= amt                            ├─ balance += amt (known kinds only)
//!        └─ log.append(Send)                          └─ log.append(Receive)
//! ```

use crate::meshclock_ledger::{CausalLog, LogEntry, WallTime};
use crate::meshclock_time::{ClockError, LamportClock, VectorClock};
use crate::meshclock_wire::{Direction, MessageKind, TransferMessage, WireFrame};
use meshclock_env::PeerId;
use thiserror::Error;
use tracing::{debug, warn};

/// Starting balance of every peer.
pub const INITIAL_BALANCE: i64 = 100;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error("peer {0} cannot transfer to itself")]
    SelfTransfer(PeerId),

    #[error("peer {peer} is not part of a mesh of {num_peers}")]
    UnknownPeer { peer: PeerId, num_peers: usize },
}

/// The complete mutable state of one peer.
#[derive(Debug)]
pub struct PeerState {
    id: PeerId,
    num_peers: usize,
    /// Never clamped; transfers may drive it negative
    balance: i64,
    lamport: LamportClock,
    vector: VectorClock,
    log: CausalLog,
}

impl PeerState {
    /// Creates a peer with the default balance and an in-memory log.
    pub fn new(id: PeerId, num_peers: usize) -> Self {
        Self::with_log(id, num_peers, INITIAL_BALANCE, CausalLog::new())
    }

    pub fn with_log(id: PeerId, num_peers: usize, balance: i64, log: CausalLog) -> Self {
        Self {
            id,
            num_peers,
            balance,
            lamport: LamportClock::new(),
            vector: VectorClock::new(num_peers),
            log,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn num_peers(&self) -> usize {
        self.num_peers
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn lamport(&self) -> &LamportClock {
        &self.lamport
    }

    pub fn vector(&self) -> &VectorClock {
        &self.vector
    }

    pub fn log(&self) -> &CausalLog {
        &self.log
    }

    pub fn into_log(self) -> CausalLog {
        self.log
    }

    fn check_counterparty(&self, peer: PeerId) -> Result<(), TransferError> {
        if peer == self.id {
            return Err(TransferError::SelfTransfer(peer));
        }
        if peer.0 >= self.num_peers {
            return Err(TransferError::UnknownPeer {
                peer,
                num_peers: self.num_peers,
            });
        }
        Ok(())
    }

    /// Records a transfer of `amount` to `to` and returns the message to put
    /// on the wire.
    pub fn prepare_send(
        &mut self,
        to: PeerId,
        amount: u32,
        wall: WallTime,
    ) -> Result<TransferMessage, TransferError> {
        self.check_counterparty(to)?;

        let vector = self.vector.on_send(self.id.index())?;
        let lamport = self.lamport.on_send();
        self.balance -= i64::from(amount);

        let message = TransferMessage {
            kind: MessageKind::MoneyTransfer,
            direction: Direction::Send,
            lamport,
            vector,
            wall,
            from: self.id,
            to,
            amount,
        };
        self.record(&message, amount);
        Ok(message)
    }

    /// Applies a frame received from `from`.
    ///
    /// Clocks are merged and the event is logged whatever the type tag says.
    /// Returns `Ok(None)` when the tag is unknown: the amount is not applied.
    /// On `Err` nothing has changed.
    pub fn apply_receive(
        &mut self,
        from: PeerId,
        frame: WireFrame,
        wall: WallTime,
    ) -> Result<Option<TransferMessage>, TransferError> {
        self.check_counterparty(from)?;

        // Merge first: it is the only step that can fail.
        let vector = self.vector.on_receive(self.id.index(), &frame.vector)?;
        let lamport = self.lamport.on_receive(frame.lamport);

        let kind = MessageKind::from_tag(frame.tag);
        let applied = match kind {
            Some(MessageKind::MoneyTransfer) => {
                self.balance += i64::from(frame.amount);
                frame.amount
            }
            None => {
                warn!(peer = %self.id, from = %from, tag = frame.tag, "Undefined message type, amount not applied");
                0
            }
        };

        let message = TransferMessage {
            kind: kind.unwrap_or(MessageKind::MoneyTransfer),
            direction: Direction::Receive,
            lamport,
            vector,
            wall,
            from,
            to: self.id,
            amount: frame.amount,
        };
        self.record(&message, applied);
        Ok(kind.map(|_| message))
    }

    fn record(&mut self, message: &TransferMessage, applied: u32) {
        let counterparty = match message.direction {
            Direction::Send => message.to,
            Direction::Receive => message.from,
        };
        let entry = LogEntry {
            counterparty,
            direction: message.direction,
            amount: applied,
            lamport: message.lamport,
            vector: message.vector.clone(),
            wall: message.wall,
        };
        if let Err(e) = self.log.append(entry) {
            warn!(peer = %self.id, error = %e, "Failed to mirror causal log entry");
        }
        debug!(
            peer = %self.id,
            lamport = message.lamport,
            vector = %message.vector,
            "Stored a {:?} message",
            message.direction
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wall() -> WallTime {
        WallTime { secs: 1704067200, nanos: 0 }
    }

    #[test]
    fn test_two_peer_transfer_scenario() {
        let mut p0 = PeerState::new(PeerId(0), 2);
        let mut p1 = PeerState::new(PeerId(1), 2);

        let sent = p0.prepare_send(PeerId(1), 50, wall()).unwrap();
        assert_eq!(sent.lamport, 0);
        assert_eq!(p0.balance(), 50);

        let received = p1
            .apply_receive(PeerId(0), sent.to_frame(), wall())
            .unwrap()
            .unwrap();

        assert_eq!(received.lamport, 1);
        assert_eq!(p1.lamport().next(), 2);
        assert_eq!(p1.balance(), 150);
        assert_eq!(p1.vector().as_slice(), &[1, 1]);
    }

    #[test]
    fn test_send_logs_snapshot_not_live_vector() {
        let mut p = PeerState::new(PeerId(0), 3);
        let first = p.prepare_send(PeerId(1), 1, wall()).unwrap();
        p.prepare_send(PeerId(2), 1, wall()).unwrap();

        assert_eq!(first.vector.as_slice(), &[1, 0, 0]);
        assert_eq!(p.log().entries()[0].vector.as_slice(), &[1, 0, 0]);
        assert_eq!(p.log().entries()[1].vector.as_slice(), &[2, 0, 0]);
        assert_eq!(p.vector().as_slice(), &[2, 0, 0]);
    }

    #[test]
    fn test_balance_may_go_negative() {
        let mut p = PeerState::new(PeerId(0), 2);
        p.prepare_send(PeerId(1), 255, wall()).unwrap();
        assert_eq!(p.balance(), 100 - 255);
    }

    #[test]
    fn test_unknown_tag_merges_clock_but_not_amount() {
        let mut p = PeerState::new(PeerId(1), 2);
        let frame = WireFrame {
            lamport: 4,
            vector: VectorClock::from_entries(vec![3, 0]),
            tag: 7,
            amount: 80,
        };

        let outcome = p.apply_receive(PeerId(0), frame, wall()).unwrap();

        assert!(outcome.is_none());
        assert_eq!(p.balance(), 100);
        assert_eq!(p.vector().as_slice(), &[3, 1]);
        assert_eq!(p.lamport().next(), 6);
        assert_eq!(p.log().len(), 1);
        assert_eq!(p.log().entries()[0].amount, 0);
    }

    #[test]
    fn test_bad_vector_leaves_state_untouched() {
        let mut p = PeerState::new(PeerId(1), 3);
        p.prepare_send(PeerId(0), 10, wall()).unwrap();

        let frame = WireFrame {
            lamport: 9,
            vector: VectorClock::new(2),
            tag: 1,
            amount: 10,
        };
        assert!(matches!(
            p.apply_receive(PeerId(0), frame, wall()),
            Err(TransferError::Clock(ClockError::LengthMismatch { .. }))
        ));

        assert_eq!(p.balance(), 90);
        assert_eq!(p.lamport().next(), 1);
        assert_eq!(p.vector().as_slice(), &[0, 1, 0]);
        assert_eq!(p.log().len(), 1);
    }

    #[test]
    fn test_rejects_self_and_unknown_counterparties() {
        let mut p = PeerState::new(PeerId(0), 2);
        assert!(matches!(
            p.prepare_send(PeerId(0), 1, wall()),
            Err(TransferError::SelfTransfer(_))
        ));
        assert!(matches!(
            p.prepare_send(PeerId(5), 1, wall()),
            Err(TransferError::UnknownPeer { .. })
        ));
        assert_eq!(p.log().len(), 0);
    }

    #[test]
    fn test_log_entries_carry_counterparty_and_direction() {
        let mut p0 = PeerState::new(PeerId(0), 3);
        let mut p2 = PeerState::new(PeerId(2), 3);

        let sent = p0.prepare_send(PeerId(2), 30, wall()).unwrap();
        p2.apply_receive(PeerId(0), sent.to_frame(), wall()).unwrap();

        let send_entry = &p0.log().entries()[0];
        assert_eq!(send_entry.counterparty, PeerId(2));
        assert_eq!(send_entry.direction, Direction::Send);
        assert_eq!(send_entry.amount, 30);

        let recv_entry = &p2.log().entries()[0];
        assert_eq!(recv_entry.counterparty, PeerId(0));
        assert_eq!(recv_entry.direction, Direction::Receive);
        assert!(recv_entry.vector.dominates(&send_entry.vector));
        assert!(recv_entry.lamport > send_entry.lamport);
    }
}
