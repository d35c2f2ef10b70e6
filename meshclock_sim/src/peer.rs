//! MeshPeer - the per-peer event loop.
//!
//! Each step draws an action from the policy and turns it into channel
//! activity according to the configured `Discipline`:
//!
//! ```text
//!              ┌──────────── policy.next_action() ────────────┐
//!              │                                              │
//!            Send                                          Receive
//!              │                                              │
//!   random-target: uniform peer                wait_readable(random 1..=300ms
//!   readiness: wait_writable(fixed)              or fixed under readiness)
//!              │                                              │
//!   can_send? → state.prepare_send            per ready endpoint: read_frame
//!     → encode → queued write                     → state.apply_receive
//!              └──────────── ctx.sleep(step_interval) ────────┘
//! ```
//!
//! Every step starts by flushing bytes left queued by earlier sends. A send
//! to a peer whose queue is still non-empty is skipped before anything is
//! recorded, so the ledger only holds sends whose frames are in the queue.
//!
//! Only a readiness failure ends the loop early. Everything else is logged
//! and the next step proceeds.

use crate::channels::{ChannelSet, InboundRead, PeerChannels, Readiness};
use crate::config::{Discipline, MeshConfig};
use crate::exporter::PeerReport;
use crate::policy::{Action, ActionPolicy, RandomPolicy};

use meshclock_core::{
    CausalLog, FileLogSink, LedgerError, PeerState, TransferError, WallTime, MAX_TRANSFER,
};
use meshclock_env::{MeshContext, PeerEndpoints, PeerId};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that stop a peer.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer {peer}: failed to register channels: {source}")]
    Setup {
        peer: PeerId,
        #[source]
        source: std::io::Error,
    },

    #[error("peer {peer}: causal log unavailable: {source}")]
    Log {
        peer: PeerId,
        #[source]
        source: LedgerError,
    },

    /// Readiness could not be determined; channel state is unknown.
    #[error("peer {peer}: readiness wait failed: {source}")]
    Readiness {
        peer: PeerId,
        #[source]
        source: std::io::Error,
    },
}

/// Counters kept alongside the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub steps: u64,
    pub sent: u64,
    pub received: u64,
    pub unknown_messages: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    /// Sends skipped because the target's queue was still draining
    pub channel_full: u64,
    pub timeouts: u64,
}

/// What one step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Sent { to: PeerId, amount: u32 },
    /// Frames applied from the endpoints that were ready
    Received(usize),
    TimedOut,
    /// A send was attempted but could not be completed
    SendFailed { to: PeerId },
    /// The target had not drained the previous frame; nothing was sent
    ChannelFull { to: PeerId },
}

/// A single peer: its state, its channels and its randomness.
pub struct MeshPeer<Ctx: MeshContext> {
    context: Arc<Ctx>,
    config: MeshConfig,
    state: PeerState,
    channels: Box<dyn ChannelSet>,
    rng: ChaCha8Rng,
    policy: Box<dyn ActionPolicy>,
    stats: PeerStats,
}

impl<Ctx: MeshContext> MeshPeer<Ctx> {
    /// Builds a peer from the endpoints it owns.
    ///
    /// Must be called on the runtime the peer will run on. Opens
    /// `peer_<id>.log` when the config names a log directory.
    pub fn new(
        context: Arc<Ctx>,
        config: MeshConfig,
        endpoints: PeerEndpoints,
    ) -> Result<Self, PeerError> {
        let id = endpoints.id;
        let num_peers = endpoints.num_peers;

        let log = match &config.log_dir {
            Some(dir) => {
                let sink = FileLogSink::for_peer(dir, id)
                    .map_err(|source| PeerError::Log { peer: id, source })?;
                CausalLog::with_sink(Box::new(sink))
            }
            None => CausalLog::new(),
        };
        let state = PeerState::with_log(id, num_peers, config.initial_balance, log);

        let channels = PeerChannels::from_endpoints(endpoints)
            .map_err(|source| PeerError::Setup { peer: id, source })?;

        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(config.peer_seed(id.index())),
            policy: Box::new(RandomPolicy::from_config(&config)),
            context,
            config,
            state,
            channels: Box::new(channels),
            stats: PeerStats::default(),
        })
    }

    /// Replaces the action policy.
    pub fn with_policy(mut self, policy: Box<dyn ActionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the channel set the loop reads and writes through.
    pub fn with_channels(mut self, channels: Box<dyn ChannelSet>) -> Self {
        self.channels = channels;
        self
    }

    pub fn id(&self) -> PeerId {
        self.state.id()
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn stats(&self) -> PeerStats {
        self.stats
    }

    /// Runs until `max_steps` (forever when unset) or a fatal error.
    pub async fn run(mut self) -> Result<PeerReport, PeerError> {
        info!(
            peer = %self.id(),
            discipline = self.config.discipline.name(),
            "Peer started"
        );

        loop {
            if let Err(e) = self.step().await {
                error!(peer = %self.id(), error = %e, "Peer stopping");
                return Err(e);
            }
            if self
                .config
                .max_steps
                .is_some_and(|max| self.stats.steps >= max)
            {
                break;
            }
            self.context.sleep(self.config.step_interval()).await;
        }

        self.drain_queues().await;
        info!(
            peer = %self.id(),
            steps = self.stats.steps,
            balance = self.state.balance(),
            "Peer finished"
        );
        Ok(self.into_report())
    }

    /// Executes one iteration of the event loop, without the trailing sleep.
    pub async fn step(&mut self) -> Result<StepOutcome, PeerError> {
        self.stats.steps += 1;
        self.flush_queued().await;
        let action = self.policy.next_action(&mut self.rng);

        let outcome = match (self.config.discipline, action) {
            (Discipline::RandomTarget, Action::Send) => {
                let to = self.random_target();
                self.send_to(to).await
            }
            (Discipline::RandomTarget, Action::Receive) => {
                let wait_ms = self.rng.gen_range(self.config.receive_wait_range_ms());
                self.receive(Duration::from_millis(wait_ms)).await?
            }
            (Discipline::Readiness, Action::Send) => {
                let wait = self.config.fixed_wait();
                let writable = self.channels.wait_writable(wait).await;
                match self.readiness(writable)? {
                    Readiness::Ready(writable) => {
                        let to = writable[self.rng.gen_range(0..writable.len())];
                        self.send_to(to).await
                    }
                    Readiness::TimedOut => {
                        self.stats.timeouts += 1;
                        StepOutcome::TimedOut
                    }
                }
            }
            (Discipline::Readiness, Action::Receive) => {
                self.receive(self.config.fixed_wait()).await?
            }
        };

        Ok(outcome)
    }

    /// Uniform over the other N-1 peers.
    fn random_target(&mut self) -> PeerId {
        let me = self.id().index();
        let pick = self.rng.gen_range(0..self.state.num_peers() - 1);
        PeerId(if pick >= me { pick + 1 } else { pick })
    }

    fn readiness(&self, result: std::io::Result<Readiness>) -> Result<Readiness, PeerError> {
        result.map_err(|source| PeerError::Readiness {
            peer: self.id(),
            source,
        })
    }

    /// Pushes queued bytes without waiting; a failing endpoint loses its queue.
    async fn flush_queued(&mut self) {
        for (to, e) in self.channels.flush_all().await {
            warn!(peer = %self.id(), to = %to, error = %e, "Queued write failed");
            self.stats.write_errors += 1;
        }
    }

    /// Gives queued frames up to one write wait to leave before shutdown.
    async fn drain_queues(&mut self) {
        let deadline = tokio::time::Instant::now() + self.config.write_wait();
        let others: Vec<PeerId> = PeerId::all(self.state.num_peers())
            .filter(|peer| *peer != self.id())
            .collect();
        loop {
            let mut queued = false;
            for &to in &others {
                match self.channels.can_send(to).await {
                    Ok(true) => {}
                    Ok(false) => queued = true,
                    Err(e) => {
                        warn!(peer = %self.id(), to = %to, error = %e, "Queued write failed");
                        self.stats.write_errors += 1;
                    }
                }
            }
            if !queued {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(peer = %self.id(), "Stopping with frames still queued");
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn send_to(&mut self, to: PeerId) -> StepOutcome {
        match self.channels.can_send(to).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(peer = %self.id(), to = %to, "Channel full, send skipped");
                self.stats.channel_full += 1;
                return StepOutcome::ChannelFull { to };
            }
            Err(e) => {
                warn!(peer = %self.id(), to = %to, error = %e, "Queued write failed");
                self.stats.write_errors += 1;
                return StepOutcome::SendFailed { to };
            }
        }

        let amount = self.rng.gen_range(0..MAX_TRANSFER);
        let wall = WallTime::from(self.context.system_time());

        let message = match self.state.prepare_send(to, amount, wall) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %self.id(), to = %to, error = %e, "Transfer rejected");
                return StepOutcome::SendFailed { to };
            }
        };

        let frame = message.to_frame().encode();
        match self.channels.send(to, &frame, self.config.write_wait()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(peer = %self.id(), to = %to, "Frame partly queued");
            }
            Err(e) => {
                // The ledger already recorded the send; the money is lost in transit.
                warn!(peer = %self.id(), to = %to, error = %e, "Write failed");
                self.stats.write_errors += 1;
                return StepOutcome::SendFailed { to };
            }
        }

        self.stats.sent += 1;
        debug!(
            peer = %self.id(),
            to = %to,
            amount,
            lamport = message.lamport,
            vector = %message.vector,
            "Sent transfer"
        );
        StepOutcome::Sent { to, amount }
    }

    async fn receive(&mut self, wait: Duration) -> Result<StepOutcome, PeerError> {
        let readable = self.channels.wait_readable(wait).await;
        let ready = match self.readiness(readable)? {
            Readiness::TimedOut => {
                self.stats.timeouts += 1;
                return Ok(StepOutcome::TimedOut);
            }
            Readiness::Ready(ready) => ready,
        };

        let mut applied = 0;
        for from in ready {
            if self.receive_from(from) {
                applied += 1;
            }
        }
        Ok(StepOutcome::Received(applied))
    }

    /// Reads and applies at most one frame from `from`.
    fn receive_from(&mut self, from: PeerId) -> bool {
        let frame = match self.channels.read_frame(from) {
            Ok(InboundRead::Frame(frame)) => frame,
            Ok(InboundRead::Incomplete) => return false,
            Ok(InboundRead::Closed) => {
                info!(peer = %self.id(), from = %from, "Inbound channel closed");
                return false;
            }
            Err(e) => {
                warn!(peer = %self.id(), from = %from, error = %e, "Read error");
                self.stats.read_errors += 1;
                return false;
            }
        };

        let wall = WallTime::from(self.context.system_time());
        match self.state.apply_receive(from, frame, wall) {
            Ok(Some(message)) => {
                self.stats.received += 1;
                debug!(
                    peer = %self.id(),
                    from = %from,
                    amount = message.amount,
                    lamport = message.lamport,
                    vector = %message.vector,
                    "Received transfer"
                );
                true
            }
            Ok(None) => {
                self.stats.unknown_messages += 1;
                true
            }
            Err(TransferError::Clock(e)) => {
                warn!(peer = %self.id(), from = %from, error = %e, "Dropped message with bad clock");
                self.stats.read_errors += 1;
                false
            }
            Err(e) => {
                warn!(peer = %self.id(), from = %from, error = %e, "Dropped message");
                self.stats.read_errors += 1;
                false
            }
        }
    }

    /// Consumes the peer into its final report.
    pub fn into_report(self) -> PeerReport {
        let stats = self.stats;
        let id = self.state.id();
        let balance = self.state.balance();
        let lamport_next = self.state.lamport().next();
        let vector = self.state.vector().clone();
        let log = self.state.into_log().into_entries();

        PeerReport {
            id,
            balance,
            lamport_next,
            vector,
            steps: stats.steps,
            sent: stats.sent,
            received: stats.received,
            unknown_messages: stats.unknown_messages,
            read_errors: stats.read_errors,
            write_errors: stats.write_errors,
            channel_full: stats.channel_full,
            log,
        }
    }
}
