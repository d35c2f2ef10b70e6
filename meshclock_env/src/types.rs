//! Common types for the MeshClock environment layer.

use serde::{Deserialize, Serialize};

/// Identity of a peer in the mesh, `0..num_peers`.
///
/// Doubles as the peer's slot index in every vector clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub usize);

impl PeerId {
    /// Returns the vector-clock slot for this peer.
    pub fn index(&self) -> usize {
        self.0
    }
    
    /// Iterates over every peer id in a mesh of `num_peers`.
    pub fn all(num_peers: usize) -> impl Iterator<Item = PeerId> {
        (0..num_peers).map(PeerId)
    }
}

impl From<usize> for PeerId {
    fn from(id: usize) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_peer_id_all() {
        let ids: Vec<PeerId> = PeerId::all(3).collect();
        assert_eq!(ids, vec![PeerId(0), PeerId(1), PeerId(2)]);
    }
    
    #[test]
    fn test_peer_id_display() {
        assert_eq!(PeerId(7).to_string(), "7");
        assert_eq!(PeerId::from(2).index(), 2);
    }
}
