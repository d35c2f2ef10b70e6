//! MeshClock Environment Layer
//!
//! This crate provides the pieces of the "outside world" that every
//! MeshClock peer depends on, kept separate so the clock engine and the
//! peer loop can run against real or virtual time:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Channels (the full-mesh socket-pair arena and per-peer ownership)
//!
//! # Topology
//!
//! ```text
//!            channel(0,1)
//!   Peer 0 ───────────────► Peer 1
//!     ▲  ◄─────────────────   │
//!     │      channel(1,0)     │
//!     │                       │
//!     └──── channel(2,0) ─── Peer 2 ...
//! ```
//!
//! Each peer keeps the write end of every `channel(self, j)` and the read
//! end of every `channel(i, self)`. Everything else is dropped (closed).
//!
//! # Example
//!
//! ```ignore
//! use meshclock_env::{ChannelTopology, PeerId};
//!
//! let topology = ChannelTopology::new(4)?;
//! for endpoints in topology.distribute()? {
//!     spawn_peer(endpoints);
//! }
//! ```

mod context;
mod topology;
mod types;
mod error;
mod tokio_impl;

pub use context::MeshContext;
pub use topology::{Channel, ChannelTopology, InboundEndpoint, OutboundEndpoint, PeerEndpoints};
pub use types::PeerId;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
