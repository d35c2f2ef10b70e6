//! Mesh runner - builds the topology, spawns one task per peer and gathers
//! the results.

use crate::audit::audit;
use crate::config::{ConfigError, MeshConfig};
use crate::exporter::{PeerFailure, PeerReport, RunSummary};
use crate::peer::MeshPeer;

use meshclock_env::{ChannelTopology, EnvError, MeshContext, PeerId};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Errors that prevent a run from starting.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Topology(#[from] EnvError),
}

/// Runs a full mesh of peers.
pub struct MeshRunner<Ctx: MeshContext> {
    config: MeshConfig,
    context: Arc<Ctx>,
}

impl<Ctx: MeshContext> MeshRunner<Ctx> {
    pub fn new(config: MeshConfig, context: Arc<Ctx>) -> Self {
        Self { config, context }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Spawns every peer and waits for all of them.
    ///
    /// Without `max_steps` peers never finish, so this only returns once
    /// every peer has failed.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        self.config.validate()?;

        let topology = ChannelTopology::new(self.config.num_peers)?;
        // Every endpoint a peer does not own is dropped here.
        let endpoints = topology.distribute()?;

        info!(
            peers = self.config.num_peers,
            seed = self.config.seed,
            discipline = self.config.discipline.name(),
            "Starting mesh"
        );

        let handles: Vec<(PeerId, JoinHandle<_>)> = endpoints
            .into_iter()
            .map(|endpoints| {
                let id = endpoints.id;
                let context = self.context.clone();
                let config = self.config.clone();
                let handle = tokio::spawn(async move {
                    MeshPeer::new(context, config, endpoints)?.run().await
                });
                (id, handle)
            })
            .collect();

        let mut peers: Vec<PeerReport> = Vec::with_capacity(handles.len());
        let mut failures = Vec::new();
        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(report)) => peers.push(report),
                Ok(Err(e)) => {
                    error!(peer = %id, error = %e, "Peer failed");
                    failures.push(PeerFailure {
                        id,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(peer = %id, error = %e, "Peer task aborted");
                    failures.push(PeerFailure {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }
        peers.sort_by_key(|p| p.id);

        let audit = audit(&peers, self.config.num_peers, self.config.initial_balance);
        info!(
            finished = peers.len(),
            failed = failures.len(),
            matched = audit.matched_messages,
            in_flight = audit.in_flight,
            violations = audit.violations.len(),
            "Mesh finished"
        );

        Ok(RunSummary {
            seed: self.config.seed,
            num_peers: self.config.num_peers,
            discipline: self.config.discipline.name().to_string(),
            peers,
            failures,
            audit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Discipline;
    use crate::context::SimContext;
    use std::time::Duration;

    fn bounded(num_peers: usize, steps: u64) -> MeshConfig {
        MeshConfig::default()
            .with_peers(num_peers)
            .with_max_steps(steps)
            .with_step_interval_ms(0)
            .with_wait_range_ms(1, 3)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bounded_run_passes_audit() {
        let runner = MeshRunner::new(bounded(3, 30), SimContext::shared());

        let summary = runner.run().await.unwrap();
        assert!(summary.passed(), "{:?}", summary.audit.violations);
        assert_eq!(
            summary.peers.iter().map(|p| p.id).collect::<Vec<_>>(),
            PeerId::all(3).collect::<Vec<_>>()
        );
        for peer in &summary.peers {
            assert_eq!(peer.steps, 30);
        }
        assert_eq!(
            summary.total_balance() + summary.audit.in_flight_amount,
            300
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readiness_run_passes_audit() {
        let config = bounded(4, 20).with_discipline(Discipline::Readiness);
        let runner = MeshRunner::new(config, SimContext::shared());

        let summary = runner.run().await.unwrap();
        assert!(summary.passed(), "{:?}", summary.audit.violations);
        assert_eq!(summary.discipline, "readiness");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_long_run_does_not_stall() {
        // Four sends per receive fills the socket buffers well before the end.
        let runner = MeshRunner::new(bounded(3, 10_000), SimContext::shared());

        let summary = tokio::time::timeout(Duration::from_secs(120), runner.run())
            .await
            .expect("mesh stalled")
            .unwrap();
        assert!(summary.passed(), "{:?}", summary.audit.violations);
        for peer in &summary.peers {
            assert_eq!(peer.steps, 10_000);
        }
        assert_eq!(
            summary.total_balance() + summary.audit.in_flight_amount,
            300
        );
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let runner = MeshRunner::new(bounded(1, 5), SimContext::shared());
        assert!(matches!(
            runner.run().await,
            Err(RunError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writes_peer_logs() {
        let dir = tempfile::tempdir().unwrap();
        let config = bounded(2, 10).with_log_dir(dir.path());
        let summary = MeshRunner::new(config, SimContext::shared())
            .run()
            .await
            .unwrap();

        for peer in &summary.peers {
            let path = dir.path().join(format!("peer_{}.log", peer.id));
            let text = std::fs::read_to_string(path).unwrap();
            assert_eq!(text.lines().count(), peer.log.len());
        }
    }
}
