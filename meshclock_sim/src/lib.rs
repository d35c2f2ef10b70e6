//! MeshClock simulation harness
//!
//! Runs a full mesh of peers exchanging money transfers over point-to-point
//! channels, each peer keeping Lamport and vector clocks and a causal log.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        MeshRunner                           │
//! │  ChannelTopology::distribute() → one PeerEndpoints per peer │
//! │       │                        │                            │
//! │  ┌────▼────┐              ┌────▼────┐                       │
//! │  │MeshPeer │◄────────────►│MeshPeer │     ...  (tokio tasks)│
//! │  │   #0    │  UnixStream  │   #1    │                       │
//! │  └────┬────┘   channels   └────┬────┘                       │
//! │       │ PeerReport             │ PeerReport                 │
//! │  ┌────▼────────────────────────▼────┐                       │
//! │  │              audit                │                       │
//! │  │  (FIFO-matched causality checks)  │                       │
//! │  └───────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use meshclock_sim::{MeshConfig, MeshRunner, SimContext};
//!
//! let config = MeshConfig::default().with_peers(4).with_max_steps(50);
//! let summary = MeshRunner::new(config, SimContext::shared()).run().await?;
//! assert!(summary.passed());
//! ```

mod audit;
mod channels;
mod config;
mod context;
mod exporter;
mod peer;
mod policy;
mod runner;

pub use audit::{audit, AuditReport};
pub use channels::{ChannelSet, InboundRead, PeerChannels, Readiness};
pub use config::{ConfigError, Discipline, MeshConfig};
pub use context::SimContext;
pub use exporter::{PeerFailure, PeerReport, RunSummary};
pub use peer::{MeshPeer, PeerError, PeerStats, StepOutcome};
pub use policy::{Action, ActionPolicy, RandomPolicy, ScriptedPolicy};
pub use runner::{MeshRunner, RunError};
