//! Full-mesh channel topology with explicit endpoint ownership.
//!
//! The topology is an arena of N² socket pairs created once, up front.
//! `channel(i, j)` carries bytes from peer `i` to peer `j`: peer `i` owns its
//! write end, peer `j` owns its read end. Ownership leaves the arena by move;
//! whatever is left behind (the diagonal, or every foreign endpoint when a
//! single peer is extracted) is closed when the arena drops.
//!
//! A peer must never hold a foreign write end. If it did, the matching reader
//! would never see end-of-stream and readiness polling would hang on it.

use crate::error::EnvError;
use crate::types::PeerId;
use std::collections::BTreeMap;
use std::os::unix::net::UnixStream;

/// One bidirectional socket pair, used in a single direction.
#[derive(Debug)]
pub struct Channel {
    from: PeerId,
    to: PeerId,
    /// Written by `from`
    sender_end: Option<UnixStream>,
    /// Read by `to`
    receiver_end: Option<UnixStream>,
}

impl Channel {
    fn open(from: PeerId, to: PeerId) -> Result<Self, EnvError> {
        let (sender_end, receiver_end) =
            UnixStream::pair().map_err(|source| EnvError::ChannelSetup {
                from: from.0,
                to: to.0,
                source,
            })?;
        Ok(Self {
            from,
            to,
            sender_end: Some(sender_end),
            receiver_end: Some(receiver_end),
        })
    }

    /// Sending peer.
    pub fn from(&self) -> PeerId {
        self.from
    }

    /// Receiving peer.
    pub fn to(&self) -> PeerId {
        self.to
    }

    /// True for `channel(i, i)`, which carries nothing.
    pub fn is_diagonal(&self) -> bool {
        self.from == self.to
    }

    /// Returns true while both halves are still held by the arena.
    pub fn is_intact(&self) -> bool {
        self.sender_end.is_some() && self.receiver_end.is_some()
    }
}

/// Write end of `channel(owner, to)`.
#[derive(Debug)]
pub struct OutboundEndpoint {
    to: PeerId,
    stream: UnixStream,
}

impl OutboundEndpoint {
    /// Destination peer.
    pub fn peer(&self) -> PeerId {
        self.to
    }

    /// Releases the underlying stream.
    pub fn into_stream(self) -> UnixStream {
        self.stream
    }
}

/// Read end of `channel(from, owner)`.
#[derive(Debug)]
pub struct InboundEndpoint {
    from: PeerId,
    stream: UnixStream,
}

impl InboundEndpoint {
    /// Source peer.
    pub fn peer(&self) -> PeerId {
        self.from
    }

    /// Releases the underlying stream.
    pub fn into_stream(self) -> UnixStream {
        self.stream
    }
}

/// Everything a single peer owns after setup: N-1 outbound and N-1 inbound
/// endpoints, keyed by the peer on the other side.
#[derive(Debug)]
pub struct PeerEndpoints {
    pub id: PeerId,
    pub num_peers: usize,
    pub outbound: BTreeMap<PeerId, OutboundEndpoint>,
    pub inbound: BTreeMap<PeerId, InboundEndpoint>,
}

impl PeerEndpoints {
    /// Peers this endpoint set can send to.
    pub fn targets(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.outbound.keys().copied()
    }

    /// Peers this endpoint set can receive from.
    pub fn sources(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.inbound.keys().copied()
    }
}

/// Arena of N² channels indexed `(from, to)`.
#[derive(Debug)]
pub struct ChannelTopology {
    num_peers: usize,
    channels: Vec<Channel>,
}

impl ChannelTopology {
    /// Creates all N² channels, diagonal included.
    pub fn new(num_peers: usize) -> Result<Self, EnvError> {
        if num_peers == 0 {
            return Err(EnvError::invalid("a mesh needs at least one peer"));
        }

        let mut channels = Vec::with_capacity(num_peers * num_peers);
        for from in PeerId::all(num_peers) {
            for to in PeerId::all(num_peers) {
                channels.push(Channel::open(from, to)?);
            }
        }

        Ok(Self { num_peers, channels })
    }

    /// Number of peers in the mesh.
    pub fn num_peers(&self) -> usize {
        self.num_peers
    }

    /// Returns `channel(from, to)` if both ids are in range.
    pub fn channel(&self, from: PeerId, to: PeerId) -> Option<&Channel> {
        if from.0 >= self.num_peers || to.0 >= self.num_peers {
            return None;
        }
        self.channels.get(from.0 * self.num_peers + to.0)
    }

    fn channel_mut(&mut self, from: PeerId, to: PeerId) -> &mut Channel {
        &mut self.channels[from.0 * self.num_peers + to.0]
    }

    /// Moves a peer's endpoints out of the arena.
    ///
    /// Takes the write end of `channel(peer, j)` and the read end of
    /// `channel(i, peer)` for every other peer. Fails if any of them was
    /// already taken.
    pub fn take_endpoints(&mut self, peer: PeerId) -> Result<PeerEndpoints, EnvError> {
        if peer.0 >= self.num_peers {
            return Err(EnvError::UnknownPeer(peer.0));
        }

        let mut outbound = BTreeMap::new();
        let mut inbound = BTreeMap::new();

        for other in PeerId::all(self.num_peers).filter(|p| *p != peer) {
            let stream = self
                .channel_mut(peer, other)
                .sender_end
                .take()
                .ok_or(EnvError::EndpointTaken { from: peer.0, to: other.0 })?;
            outbound.insert(other, OutboundEndpoint { to: other, stream });

            let stream = self
                .channel_mut(other, peer)
                .receiver_end
                .take()
                .ok_or(EnvError::EndpointTaken { from: other.0, to: peer.0 })?;
            inbound.insert(other, InboundEndpoint { from: other, stream });
        }

        Ok(PeerEndpoints {
            id: peer,
            num_peers: self.num_peers,
            outbound,
            inbound,
        })
    }

    /// Extracts one peer's endpoints and closes everything else.
    pub fn into_peer(mut self, peer: PeerId) -> Result<PeerEndpoints, EnvError> {
        self.take_endpoints(peer)
        // `self` drops here, closing the diagonal and all foreign endpoints.
    }

    /// Hands every peer its endpoints. The diagonal is closed on return.
    pub fn distribute(mut self) -> Result<Vec<PeerEndpoints>, EnvError> {
        PeerId::all(self.num_peers)
            .map(|peer| self.take_endpoints(peer))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_topology_creates_full_arena() {
        let topology = ChannelTopology::new(3).unwrap();
        assert_eq!(topology.num_peers(), 3);

        for from in PeerId::all(3) {
            for to in PeerId::all(3) {
                let channel = topology.channel(from, to).unwrap();
                assert_eq!(channel.from(), from);
                assert_eq!(channel.to(), to);
                assert_eq!(channel.is_diagonal(), from == to);
                assert!(channel.is_intact());
            }
        }

        assert!(topology.channel(PeerId(3), PeerId(0)).is_none());
    }

    #[test]
    fn test_topology_rejects_empty_mesh() {
        assert!(matches!(
            ChannelTopology::new(0),
            Err(EnvError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_each_peer_owns_exactly_its_endpoints() {
        let peers = ChannelTopology::new(4).unwrap().distribute().unwrap();
        assert_eq!(peers.len(), 4);

        for endpoints in &peers {
            assert_eq!(endpoints.outbound.len(), 3);
            assert_eq!(endpoints.inbound.len(), 3);
            assert!(!endpoints.outbound.contains_key(&endpoints.id));
            assert!(!endpoints.inbound.contains_key(&endpoints.id));

            for (peer, out) in &endpoints.outbound {
                assert_eq!(out.peer(), *peer);
            }
        }
    }

    #[test]
    fn test_bytes_flow_from_writer_to_reader() {
        let mut peers = ChannelTopology::new(2).unwrap().distribute().unwrap();
        let p1 = peers.pop().unwrap();
        let p0 = peers.pop().unwrap();

        let mut tx = p0.outbound.into_iter().next().unwrap().1.into_stream();
        let mut rx = p1.inbound.into_iter().next().unwrap().1.into_stream();

        tx.write_all(&[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        rx.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_into_peer_closes_foreign_write_ends() {
        let topology = ChannelTopology::new(3).unwrap();
        let endpoints = topology.into_peer(PeerId(0)).unwrap();

        // Peers 1 and 2 never took their write ends, so the arena closed
        // them. Peer 0 must observe end-of-stream, not block.
        for (_, inbound) in endpoints.inbound {
            let mut stream = inbound.into_stream();
            let mut buf = [0u8; 8];
            assert_eq!(stream.read(&mut buf).unwrap(), 0);
        }
    }

    #[test]
    fn test_take_endpoints_twice_fails() {
        let mut topology = ChannelTopology::new(2).unwrap();
        topology.take_endpoints(PeerId(1)).unwrap();

        assert!(matches!(
            topology.take_endpoints(PeerId(1)),
            Err(EnvError::EndpointTaken { .. })
        ));
        assert!(matches!(
            topology.take_endpoints(PeerId(5)),
            Err(EnvError::UnknownPeer(5))
        ));
    }
}
