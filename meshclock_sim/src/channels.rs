//! A peer's live channel set with readiness multiplexing.
//!
//! Converts the std endpoints handed out by the topology into tokio streams
//! registered with the current runtime, then offers what the event loop
//! needs: wait for readiness across many endpoints with a timeout, read one
//! frame from a ready endpoint, and write a frame.
//!
//! Nothing here blocks outside a bounded readiness wait. Reads pull bytes
//! with `try_read` into a per-endpoint buffer and surface a frame only once
//! it is complete. Writes go through a per-endpoint queue: whatever the
//! socket does not take within the write wait stays queued and is flushed on
//! later steps, and a peer whose queue is still non-empty is not handed a
//! new frame.

use async_trait::async_trait;
use meshclock_core::{WireError, WireFrame};
use meshclock_env::{PeerEndpoints, PeerId};
use std::collections::BTreeMap;
use std::future::poll_fn;
use std::io;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::Instant;

/// Result of waiting on a set of endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    TimedOut,
    /// Every endpoint that was ready when the wait returned, in id order
    Ready(Vec<PeerId>),
}

/// Result of one non-blocking read attempt on an inbound endpoint.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundRead {
    Frame(WireFrame),
    /// Part of a frame (or nothing) is buffered; more bytes are needed
    Incomplete,
    /// The sender hung up cleanly; the endpoint has been retired
    Closed,
}

/// Channel operations the peer event loop is written against.
#[async_trait]
pub trait ChannelSet: Send + Sync {
    /// Waits until at least one inbound endpoint is readable, or `timeout`.
    ///
    /// An error means channel state is unknown; the caller treats it as
    /// fatal.
    async fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness>;

    /// Waits until at least one outbound endpoint is writable, or `timeout`.
    async fn wait_writable(&self, timeout: Duration) -> io::Result<Readiness>;

    /// True when nothing is queued for `to`, after a non-blocking flush.
    async fn can_send(&mut self, to: PeerId) -> io::Result<bool>;

    /// Queues one encoded frame for `to` and writes as much as the socket
    /// takes within `wait`. Returns true when the frame went out in full.
    async fn send(&mut self, to: PeerId, bytes: &[u8], wait: Duration) -> io::Result<bool>;

    /// Pushes queued bytes without waiting. Returns the endpoints that
    /// failed; their queues are discarded.
    async fn flush_all(&mut self) -> Vec<(PeerId, io::Error)>;

    /// Pulls whatever `from` has buffered, up to one frame, without blocking.
    fn read_frame(&mut self, from: PeerId) -> Result<InboundRead, WireError>;
}

struct Inbound {
    stream: UnixStream,
    pending: Vec<u8>,
}

struct Outbound {
    stream: UnixStream,
    pending: Vec<u8>,
}

impl Outbound {
    /// Writes queued bytes until the queue is empty or `deadline` passes.
    /// Any error discards the queue.
    async fn flush_until(&mut self, deadline: Instant) -> io::Result<()> {
        let result = self.try_flush_until(deadline).await;
        if result.is_err() {
            self.pending.clear();
        }
        result
    }

    async fn try_flush_until(&mut self, deadline: Instant) -> io::Result<()> {
        while !self.pending.is_empty() {
            match tokio::time::timeout_at(deadline, self.stream.writable()).await {
                Err(_) => return Ok(()),
                Ok(ready) => ready?,
            }
            match self.stream.try_write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// The endpoints one peer owns, live on the tokio runtime.
pub struct PeerChannels {
    id: PeerId,
    num_peers: usize,
    frame_len: usize,
    outbound: BTreeMap<PeerId, Outbound>,
    inbound: BTreeMap<PeerId, Inbound>,
}

fn into_tokio(stream: std::os::unix::net::UnixStream) -> io::Result<UnixStream> {
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

fn no_endpoint(peer: PeerId) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no outbound endpoint to peer {}", peer),
    )
}

impl PeerChannels {
    /// Registers every endpoint with the current tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn from_endpoints(endpoints: PeerEndpoints) -> io::Result<Self> {
        let mut outbound = BTreeMap::new();
        for (peer, endpoint) in endpoints.outbound {
            outbound.insert(
                peer,
                Outbound {
                    stream: into_tokio(endpoint.into_stream())?,
                    pending: Vec::new(),
                },
            );
        }

        let mut inbound = BTreeMap::new();
        for (peer, endpoint) in endpoints.inbound {
            inbound.insert(
                peer,
                Inbound {
                    stream: into_tokio(endpoint.into_stream())?,
                    pending: Vec::new(),
                },
            );
        }

        Ok(Self {
            id: endpoints.id,
            num_peers: endpoints.num_peers,
            frame_len: WireFrame::encoded_len(endpoints.num_peers),
            outbound,
            inbound,
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Peers with a live inbound endpoint.
    pub fn sources(&self) -> Vec<PeerId> {
        self.inbound.keys().copied().collect()
    }

    pub fn has_outbound(&self, peer: PeerId) -> bool {
        self.outbound.contains_key(&peer)
    }

    /// Bytes still waiting to be written to `peer`.
    pub fn queued_bytes(&self, peer: PeerId) -> usize {
        self.outbound.get(&peer).map_or(0, |out| out.pending.len())
    }
}

#[async_trait]
impl ChannelSet for PeerChannels {
    async fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        let streams: Vec<(PeerId, &UnixStream)> = self
            .inbound
            .iter()
            .map(|(peer, inbound)| (*peer, &inbound.stream))
            .collect();
        wait_ready(&streams, timeout, |stream, cx| stream.poll_read_ready(cx)).await
    }

    async fn wait_writable(&self, timeout: Duration) -> io::Result<Readiness> {
        let streams: Vec<(PeerId, &UnixStream)> = self
            .outbound
            .iter()
            .map(|(peer, out)| (*peer, &out.stream))
            .collect();
        wait_ready(&streams, timeout, |stream, cx| stream.poll_write_ready(cx)).await
    }

    async fn can_send(&mut self, to: PeerId) -> io::Result<bool> {
        let out = self.outbound.get_mut(&to).ok_or_else(|| no_endpoint(to))?;
        out.flush_until(Instant::now()).await?;
        Ok(out.pending.is_empty())
    }

    async fn send(&mut self, to: PeerId, bytes: &[u8], wait: Duration) -> io::Result<bool> {
        let out = self.outbound.get_mut(&to).ok_or_else(|| no_endpoint(to))?;
        out.pending.extend_from_slice(bytes);
        out.flush_until(Instant::now() + wait).await?;
        Ok(out.pending.is_empty())
    }

    async fn flush_all(&mut self) -> Vec<(PeerId, io::Error)> {
        let now = Instant::now();
        let mut failed = Vec::new();
        for (peer, out) in self.outbound.iter_mut() {
            if let Err(e) = out.flush_until(now).await {
                failed.push((*peer, e));
            }
        }
        failed
    }

    /// End of stream retires the endpoint. If it arrives mid-frame the
    /// partial frame is reported as a short read.
    fn read_frame(&mut self, from: PeerId) -> Result<InboundRead, WireError> {
        let frame_len = self.frame_len;
        let num_peers = self.num_peers;
        let Some(inbound) = self.inbound.get_mut(&from) else {
            return Ok(InboundRead::Closed);
        };

        let mut chunk = vec![0u8; frame_len];
        loop {
            let need = frame_len - inbound.pending.len();
            match inbound.stream.try_read(&mut chunk[..need]) {
                Ok(0) => {
                    let leftover = std::mem::take(&mut inbound.pending);
                    self.inbound.remove(&from);
                    if leftover.is_empty() {
                        return Ok(InboundRead::Closed);
                    }
                    // Decoding the truncated buffer names the missing field.
                    return WireFrame::decode(&leftover, num_peers).map(InboundRead::Frame);
                }
                Ok(n) => {
                    inbound.pending.extend_from_slice(&chunk[..n]);
                    if inbound.pending.len() == frame_len {
                        let bytes = std::mem::take(&mut inbound.pending);
                        return WireFrame::decode(&bytes, num_peers).map(InboundRead::Frame);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(InboundRead::Incomplete);
                }
                Err(e) => {
                    self.inbound.remove(&from);
                    return Err(WireError::Io(e));
                }
            }
        }
    }
}

async fn wait_ready<F>(
    streams: &[(PeerId, &UnixStream)],
    timeout: Duration,
    poll_ready: F,
) -> io::Result<Readiness>
where
    F: Fn(&UnixStream, &mut Context<'_>) -> Poll<io::Result<()>>,
{
    let all_ready = poll_fn(|cx| {
        let mut ready = Vec::new();
        for (peer, stream) in streams {
            match poll_ready(stream, cx) {
                Poll::Ready(Ok(())) => ready.push(*peer),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {}
            }
        }
        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(Ok(ready))
        }
    });

    match tokio::time::timeout(timeout, all_ready).await {
        Ok(Ok(ready)) => Ok(Readiness::Ready(ready)),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(Readiness::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshclock_core::{MessageKind, VectorClock};
    use meshclock_env::ChannelTopology;
    use std::io::Write;

    const WAIT: Duration = Duration::from_secs(1);

    fn frame(lamport: u64) -> WireFrame {
        WireFrame {
            lamport,
            vector: VectorClock::from_entries(vec![lamport, 0]),
            tag: MessageKind::MoneyTransfer.tag(),
            amount: 12,
        }
    }

    async fn pair() -> (PeerChannels, PeerChannels) {
        let mut peers = ChannelTopology::new(2).unwrap().distribute().unwrap();
        let p1 = PeerChannels::from_endpoints(peers.pop().unwrap()).unwrap();
        let p0 = PeerChannels::from_endpoints(peers.pop().unwrap()).unwrap();
        (p0, p1)
    }

    #[tokio::test]
    async fn test_wait_readable_times_out_when_idle() {
        let (_p0, p1) = pair().await;
        let readiness = p1.wait_readable(Duration::from_millis(5)).await.unwrap();
        assert_eq!(readiness, Readiness::TimedOut);
    }

    #[tokio::test]
    async fn test_send_then_read_one_frame() {
        let (mut p0, mut p1) = pair().await;
        assert!(p0.send(PeerId(1), &frame(3).encode(), WAIT).await.unwrap());
        assert!(p0.send(PeerId(1), &frame(4).encode(), WAIT).await.unwrap());
        assert_eq!(p0.queued_bytes(PeerId(1)), 0);

        let readiness = p1.wait_readable(WAIT).await.unwrap();
        assert_eq!(readiness, Readiness::Ready(vec![PeerId(0)]));

        // One frame per call, in order.
        assert_eq!(p1.read_frame(PeerId(0)).unwrap(), InboundRead::Frame(frame(3)));
        assert_eq!(p1.read_frame(PeerId(0)).unwrap(), InboundRead::Frame(frame(4)));
        assert_eq!(p1.read_frame(PeerId(0)).unwrap(), InboundRead::Incomplete);
    }

    #[tokio::test]
    async fn test_writable_reports_all_outbound() {
        let mut peers = ChannelTopology::new(3).unwrap().distribute().unwrap();
        let p0 = PeerChannels::from_endpoints(peers.remove(0)).unwrap();

        let readiness = p0.wait_writable(WAIT).await.unwrap();
        assert_eq!(readiness, Readiness::Ready(vec![PeerId(1), PeerId(2)]));
    }

    #[tokio::test]
    async fn test_full_channel_queues_instead_of_blocking() {
        let (mut p0, mut p1) = pair().await;

        // Nobody reads, so the socket eventually refuses more bytes.
        let mut sent = 0u64;
        loop {
            let complete = p0
                .send(PeerId(1), &frame(sent).encode(), Duration::from_millis(20))
                .await
                .unwrap();
            sent += 1;
            if !complete {
                break;
            }
            assert!(sent < 1_000_000, "socket never filled");
        }
        assert!(p0.queued_bytes(PeerId(1)) > 0);
        assert!(!p0.can_send(PeerId(1)).await.unwrap());

        // Draining the reader lets the queue through, intact and in order.
        let mut next = 0u64;
        while next < sent {
            assert!(p0.flush_all().await.is_empty());
            let readiness = p1.wait_readable(WAIT).await.unwrap();
            assert_ne!(readiness, Readiness::TimedOut, "stalled at frame {}", next);
            loop {
                match p1.read_frame(PeerId(0)).unwrap() {
                    InboundRead::Frame(f) => {
                        assert_eq!(f, frame(next));
                        next += 1;
                    }
                    InboundRead::Incomplete => break,
                    InboundRead::Closed => panic!("sender hung up"),
                }
            }
        }
        assert_eq!(p0.queued_bytes(PeerId(1)), 0);
        assert!(p0.can_send(PeerId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_send_to_departed_peer_fails_and_clears_queue() {
        let (mut p0, p1) = pair().await;
        drop(p1);

        assert!(p0.send(PeerId(1), &frame(0).encode(), WAIT).await.is_err());
        assert_eq!(p0.queued_bytes(PeerId(1)), 0);
        assert!(p0.send(PeerId(7), &frame(0).encode(), WAIT).await.is_err());
    }

    #[tokio::test]
    async fn test_hangup_retires_endpoint() {
        let (p0, mut p1) = pair().await;
        drop(p0);

        let readiness = p1.wait_readable(WAIT).await.unwrap();
        assert_eq!(readiness, Readiness::Ready(vec![PeerId(0)]));
        assert_eq!(p1.read_frame(PeerId(0)).unwrap(), InboundRead::Closed);
        assert!(p1.sources().is_empty());

        let readiness = p1.wait_readable(Duration::from_millis(5)).await.unwrap();
        assert_eq!(readiness, Readiness::TimedOut);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_short_read() {
        let mut topology = ChannelTopology::new(2).unwrap();
        let raw = topology.take_endpoints(PeerId(0)).unwrap();
        let mut p1 = PeerChannels::from_endpoints(topology.into_peer(PeerId(1)).unwrap()).unwrap();

        let mut writer = raw.outbound.into_values().next().unwrap().into_stream();
        writer.write_all(&frame(1).encode()[..10]).unwrap();
        drop(writer);

        p1.wait_readable(WAIT).await.unwrap();
        match p1.read_frame(PeerId(0)) {
            Err(WireError::ShortRead { field, .. }) => assert_eq!(field, "vector timestamp"),
            other => panic!("expected short read, got {:?}", other),
        }
        assert!(p1.sources().is_empty());
    }
}
