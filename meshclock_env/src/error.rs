//! Error types for the MeshClock environment layer.

use thiserror::Error;

/// Errors that can occur while building or handing out channels.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Creating a socket pair failed
    #[error("Channel setup failed for ({from}, {to}): {source}")]
    ChannelSetup {
        from: usize,
        to: usize,
        #[source]
        source: std::io::Error,
    },
    
    /// A mesh needs at least one peer
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),
    
    /// Peer id outside `0..num_peers`
    #[error("Unknown peer: {0}")]
    UnknownPeer(usize),
    
    /// Endpoint was already handed to its owner
    #[error("Endpoint already taken: channel ({from}, {to})")]
    EndpointTaken { from: usize, to: usize },
}

impl EnvError {
    /// Creates an invalid topology error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidTopology(msg.into())
    }
}
