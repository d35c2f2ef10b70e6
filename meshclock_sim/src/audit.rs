//! Causality audit over finished peers.
//!
//! The audit has the "god's eye view" no peer has: every causal log at once.
//! Channels are FIFO, so the k-th receive peer `j` logged from peer `i` is
//! the k-th send peer `i` logged to `j`. Matching them pairwise lets us check
//! the clock guarantees end to end:
//! - a receive's Lamport time is greater than its send's
//! - a receive's vector dominates its send's vector
//! - each peer's own slot grows by exactly one per logged event
//! - balances agree with the ledger, and money is conserved once in-flight
//!   transfers are counted

use crate::exporter::PeerReport;
use meshclock_core::{Direction, LogEntry};
use meshclock_env::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Findings of one audit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Send/receive pairs matched across channels
    pub matched_messages: usize,

    /// Sends with no matching receive (unread, or lost to a closed peer)
    pub in_flight: usize,

    /// Sum of in-flight amounts
    pub in_flight_amount: i64,

    /// Human-readable description of every failed check
    pub violations: Vec<String>,
}

impl AuditReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Audits the logs of `reports`.
///
/// Channels touching a peer missing from `reports` are skipped; the
/// conservation check runs only when all `num_peers` reports are present.
pub fn audit(reports: &[PeerReport], num_peers: usize, initial_balance: i64) -> AuditReport {
    let mut report = AuditReport::default();
    let by_id: BTreeMap<PeerId, &PeerReport> = reports.iter().map(|r| (r.id, r)).collect();

    for peer in reports {
        check_local_history(peer, initial_balance, &mut report.violations);
    }

    for (&from, sender) in &by_id {
        for (&to, receiver) in &by_id {
            if from == to {
                continue;
            }
            check_channel(from, sender, to, receiver, &mut report);
        }
    }

    if by_id.len() == num_peers {
        let total: i64 = reports.iter().map(|r| r.balance).sum();
        let expected = initial_balance * num_peers as i64;
        if total + report.in_flight_amount != expected {
            report.violations.push(format!(
                "money not conserved: balances {} + in flight {} != {}",
                total, report.in_flight_amount, expected
            ));
        }
    }

    report
}

fn check_local_history(peer: &PeerReport, initial_balance: i64, violations: &mut Vec<String>) {
    let own = peer.id.index();
    let mut balance = initial_balance;
    let mut last_lamport: Option<u64> = None;

    for (k, entry) in peer.log.iter().enumerate() {
        let slot = entry.vector.get(own).unwrap_or(0);
        if slot != k as u64 + 1 {
            violations.push(format!(
                "peer {} entry {}: own slot is {}, expected {}",
                peer.id,
                k,
                slot,
                k + 1
            ));
        }
        if let Some(prev) = last_lamport {
            if entry.lamport <= prev {
                violations.push(format!(
                    "peer {} entry {}: lamport {} does not follow {}",
                    peer.id, k, entry.lamport, prev
                ));
            }
        }
        last_lamport = Some(entry.lamport);

        match entry.direction {
            Direction::Send => balance -= i64::from(entry.amount),
            Direction::Receive => balance += i64::from(entry.amount),
        }
    }

    if peer.vector.get(own).unwrap_or(0) != peer.log.len() as u64 {
        violations.push(format!(
            "peer {}: own slot {} disagrees with {} logged events",
            peer.id,
            peer.vector.get(own).unwrap_or(0),
            peer.log.len()
        ));
    }
    if balance != peer.balance {
        violations.push(format!(
            "peer {}: balance {} disagrees with ledger total {}",
            peer.id, peer.balance, balance
        ));
    }
}

fn entries_with(peer: &PeerReport, counterparty: PeerId, direction: Direction) -> Vec<&LogEntry> {
    peer.log
        .iter()
        .filter(|e| e.counterparty == counterparty && e.direction == direction)
        .collect()
}

fn check_channel(
    from: PeerId,
    sender: &PeerReport,
    to: PeerId,
    receiver: &PeerReport,
    report: &mut AuditReport,
) {
    let sends = entries_with(sender, to, Direction::Send);
    let receives = entries_with(receiver, from, Direction::Receive);

    if receives.len() > sends.len() {
        report.violations.push(format!(
            "channel ({}, {}): {} receives but only {} sends",
            from,
            to,
            receives.len(),
            sends.len()
        ));
        return;
    }

    for (k, (send, recv)) in sends.iter().zip(receives.iter()).enumerate() {
        if recv.lamport <= send.lamport {
            report.violations.push(format!(
                "channel ({}, {}) message {}: receive lamport {} not after send {}",
                from, to, k, recv.lamport, send.lamport
            ));
        }
        if !recv.vector.dominates(&send.vector) {
            report.violations.push(format!(
                "channel ({}, {}) message {}: receive vector {} does not dominate send {}",
                from, to, k, recv.vector, send.vector
            ));
        }
        if recv.amount != send.amount {
            report.violations.push(format!(
                "channel ({}, {}) message {}: received {} but sent {}",
                from, to, k, recv.amount, send.amount
            ));
        }
    }

    report.matched_messages += receives.len();
    for send in &sends[receives.len()..] {
        report.in_flight += 1;
        report.in_flight_amount += i64::from(send.amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshclock_core::{PeerState, WallTime};

    fn report_of(state: PeerState) -> PeerReport {
        PeerReport {
            id: state.id(),
            balance: state.balance(),
            lamport_next: state.lamport().next(),
            vector: state.vector().clone(),
            steps: 0,
            sent: 0,
            received: 0,
            unknown_messages: 0,
            read_errors: 0,
            write_errors: 0,
            channel_full: 0,
            log: state.into_log().into_entries(),
        }
    }

    fn exchange() -> (PeerState, PeerState) {
        let wall = WallTime::default();
        let mut p0 = PeerState::new(PeerId(0), 2);
        let mut p1 = PeerState::new(PeerId(1), 2);

        let a = p0.prepare_send(PeerId(1), 40, wall).unwrap();
        // Still in flight when the logs are audited.
        let _in_flight = p0.prepare_send(PeerId(1), 7, wall).unwrap();
        p1.apply_receive(PeerId(0), a.to_frame(), wall).unwrap();
        let c = p1.prepare_send(PeerId(0), 90, wall).unwrap();
        p0.apply_receive(PeerId(1), c.to_frame(), wall).unwrap();
        (p0, p1)
    }

    #[test]
    fn test_clean_exchange_passes() {
        let (p0, p1) = exchange();
        let reports = vec![report_of(p0), report_of(p1)];

        let audit = audit(&reports, 2, 100);
        assert!(audit.passed(), "{:?}", audit.violations);
        assert_eq!(audit.matched_messages, 2);
        assert_eq!(audit.in_flight, 1);
        assert_eq!(audit.in_flight_amount, 7);
    }

    #[test]
    fn test_detects_receive_without_send() {
        let (p0, p1) = exchange();
        let mut reports = vec![report_of(p0), report_of(p1)];
        // Forget peer 1's only send.
        reports[1].log.retain(|e| e.direction == Direction::Receive);

        let audit = audit(&reports, 2, 100);
        assert!(!audit.passed());
        assert!(audit
            .violations
            .iter()
            .any(|v| v.starts_with("channel (1, 0)")));
    }

    #[test]
    fn test_detects_tampered_balance() {
        let (p0, p1) = exchange();
        let mut reports = vec![report_of(p0), report_of(p1)];
        reports[0].balance += 1;

        let audit = audit(&reports, 2, 100);
        assert!(audit.violations.iter().any(|v| v.contains("ledger total")));
        assert!(audit.violations.iter().any(|v| v.contains("not conserved")));
    }

    #[test]
    fn test_detects_lamport_regression() {
        let (p0, p1) = exchange();
        let mut reports = vec![report_of(p0), report_of(p1)];
        let last = reports[1].log.len() - 1;
        reports[1].log[last].lamport = 0;

        let audit = audit(&reports, 2, 100);
        assert!(audit.violations.iter().any(|v| v.contains("does not follow")));
    }

    #[test]
    fn test_missing_peer_skips_conservation() {
        let (p0, _p1) = exchange();
        let reports = vec![report_of(p0)];

        let audit = audit(&reports, 2, 100);
        assert!(audit.passed(), "{:?}", audit.violations);
        assert_eq!(audit.matched_messages, 0);
    }
}
