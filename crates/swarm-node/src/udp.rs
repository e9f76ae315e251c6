//! UDP broadcast link.
//!
//! Every node binds the same port with address reuse and broadcasts each
//! envelope to the subnet. UDP has no notion of sender identity, so each
//! datagram is prefixed with the sender's node id:
//!
//! ```text
//! ┌──────────────┬───────────────────────────┐
//! │ node id (BE) │ JSON envelope             │
//! │   4 bytes    │   {"t":..,"n":..,"d":..}  │
//! └──────────────┴───────────────────────────┘
//! ```
//!
//! Broadcasts loop back to the sender; datagrams carrying our own id are
//! dropped here. There are no connections either, so the first datagram from
//! an id we have not heard before is reported to the engine as a join. An id
//! that stays silent longer than the peer timeout is forgotten, and its next
//! datagram is a join again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use swarm_proto::NodeId;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::SwarmConfig;
use crate::error::Result;
use crate::service::{Link, SwarmHandle};
use crate::transport::MembershipEvent;

/// Length of the sender-id prefix.
pub const ID_PREFIX_LEN: usize = 4;

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Pause after a failed receive before trying the socket again.
const RECV_BACKOFF: Duration = Duration::from_millis(200);

/// Prefix an encoded envelope with the sender id.
pub fn frame(from: NodeId, envelope: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ID_PREFIX_LEN + envelope.len());
    buf.extend_from_slice(&from.to_be_bytes());
    buf.extend_from_slice(envelope);
    buf
}

/// Split a datagram into sender id and envelope bytes.
pub fn unframe(datagram: &[u8]) -> Option<(NodeId, &[u8])> {
    if datagram.len() < ID_PREFIX_LEN {
        return None;
    }
    let (prefix, body) = datagram.split_at(ID_PREFIX_LEN);
    let id = NodeId::from_be_bytes(prefix.try_into().ok()?);
    Some((id, body))
}

/// Last time each sender was heard, for spotting joins and rejoins.
#[derive(Debug)]
struct Arrivals {
    timeout: Duration,
    last_heard: HashMap<NodeId, Instant>,
}

impl Arrivals {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_heard: HashMap::new(),
        }
    }

    /// Record a datagram from `id`. Returns true if `id` was unknown or had
    /// been silent for longer than the timeout.
    fn heard(&mut self, id: NodeId, now: Instant) -> bool {
        let timeout = self.timeout;
        let fresh = self
            .last_heard
            .get(&id)
            .map_or(true, |&last| now.duration_since(last) > timeout);

        if fresh {
            self.last_heard
                .retain(|_, last| now.duration_since(*last) <= timeout);
        }
        self.last_heard.insert(id, now);
        fresh
    }
}

/// Broadcast-capable UDP socket bound for one node.
#[derive(Debug)]
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    self_id: NodeId,
    broadcast_addr: SocketAddr,
    peer_timeout: Duration,
}

impl UdpLink {
    pub async fn bind(config: &SwarmConfig, self_id: NodeId) -> Result<Self> {
        let socket = bind_broadcast(config.bind_addr)?;
        info!(
            id = self_id,
            bind = %config.bind_addr,
            broadcast = %config.broadcast_addr,
            "UDP link bound"
        );

        Ok(Self {
            socket: Arc::new(socket),
            self_id,
            broadcast_addr: config.broadcast_addr,
            peer_timeout: config.peer_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Start the receive and send loops. Both end when the service goes away.
    pub fn spawn(self, link: Link, handle: SwarmHandle) -> (JoinHandle<()>, JoinHandle<()>) {
        let Link {
            inbound,
            mut outbound,
        } = link;

        let socket = Arc::clone(&self.socket);
        let self_id = self.self_id;
        let mut arrivals = Arrivals::new(self.peer_timeout);
        let recv = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];

            loop {
                let (len, addr) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed");
                        tokio::time::sleep(RECV_BACKOFF).await;
                        continue;
                    }
                };

                let Some((from, body)) = unframe(&buf[..len]) else {
                    trace!(%addr, len, "Dropping runt datagram");
                    continue;
                };
                if from == self_id {
                    continue;
                }

                if arrivals.heard(from, Instant::now()) {
                    debug!(peer = from, %addr, "New datagram source");
                    if handle.membership(MembershipEvent::Joined(from)).await.is_err() {
                        break;
                    }
                }
                if inbound.send((from, body.to_vec())).await.is_err() {
                    break;
                }
            }
            debug!("UDP receive loop stopped");
        });

        let socket = Arc::clone(&self.socket);
        let send = tokio::spawn(async move {
            while let Some(envelope) = outbound.recv().await {
                let datagram = frame(self.self_id, &envelope);
                if let Err(e) = socket.send_to(&datagram, self.broadcast_addr).await {
                    warn!(error = %e, to = %self.broadcast_addr, "UDP broadcast failed");
                }
            }
            debug!("UDP send loop stopped");
        });

        (recv, send)
    }
}

fn bind_broadcast(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    // Several nodes on one host share the mesh port.
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::SwarmService;
    use swarm_proto::{Envelope, Heartbeat, Payload, StateUpdate};

    #[test]
    fn frame_prefixes_big_endian_id() {
        let datagram = frame(0x0102_0304, b"{}");
        assert_eq!(datagram, vec![1, 2, 3, 4, b'{', b'}']);
        assert_eq!(unframe(&datagram), Some((0x0102_0304, &b"{}"[..])));
    }

    #[test]
    fn unframe_rejects_runts() {
        assert_eq!(unframe(&[1, 2, 3]), None);
        assert_eq!(unframe(&[0, 0, 0, 9]), Some((9, &b""[..])));
    }

    #[tokio::test]
    async fn bind_reports_local_addr() {
        let config = SwarmConfig::default().with_bind_addr("127.0.0.1:0".parse().unwrap());
        let link = UdpLink::bind(&config, 1).await.unwrap();
        let addr = link.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn arrivals_flag_first_contact_and_rejoin() {
        let mut arrivals = Arrivals::new(Duration::from_secs(15));
        let t0 = Instant::now();

        assert!(arrivals.heard(7, t0));
        assert!(!arrivals.heard(7, t0 + Duration::from_secs(10)));
        assert!(!arrivals.heard(7, t0 + Duration::from_secs(20)));
        assert!(arrivals.heard(7, t0 + Duration::from_secs(40)));
    }

    #[test]
    fn arrivals_forget_silent_ids() {
        let mut arrivals = Arrivals::new(Duration::from_secs(15));
        let t0 = Instant::now();
        arrivals.heard(1, t0);
        arrivals.heard(2, t0);

        assert!(arrivals.heard(3, t0 + Duration::from_secs(30)));
        assert_eq!(arrivals.last_heard.len(), 1);
    }

    fn datagram(from: NodeId, payload: Payload) -> Vec<u8> {
        frame(from, &Envelope::new("peer", payload).encode().unwrap())
    }

    /// Next datagram on `socket`, split into sender and payload.
    async fn next_payload(socket: &UdpSocket) -> (NodeId, Payload) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a datagram")
            .unwrap();
        let (from, body) = unframe(&buf[..len]).unwrap();
        (from, Envelope::decode(body).unwrap().payload)
    }

    #[tokio::test]
    async fn loopback_link_frames_filters_and_announces() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = SwarmConfig::default()
            .with_bind_addr("127.0.0.1:0".parse().unwrap())
            .with_broadcast_addr(peer.local_addr().unwrap())
            .with_tick_interval(Duration::from_millis(5));

        let (service, handle, link) = SwarmService::new(&config, 1);
        let udp = UdpLink::bind(&config, 1).await.unwrap();
        let node_addr = udp.local_addr().unwrap();
        let service_task = tokio::spawn(service.run());
        let (recv_task, send_task) = udp.spawn(link, handle.clone());

        // Outgoing frames carry our id.
        assert!(handle.set_local("a", "1").await.unwrap());
        loop {
            let (from, payload) = next_payload(&peer).await;
            assert_eq!(from, 1);
            if matches!(payload, Payload::StateSet(ref u) if u.key == "a") {
                break;
            }
        }

        // A frame claiming our own id is dropped; a new sender is announced to.
        let own = datagram(1, Payload::StateSet(StateUpdate::new("x", "echo", 1, 1)));
        peer.send_to(&own, node_addr).await.unwrap();
        let hello = datagram(7, Payload::Heartbeat(Heartbeat::default()));
        peer.send_to(&hello, node_addr).await.unwrap();
        let write = datagram(7, Payload::StateSet(StateUpdate::new("y", "2", 1, 7)));
        peer.send_to(&write, node_addr).await.unwrap();

        loop {
            let (from, payload) = next_payload(&peer).await;
            assert_eq!(from, 1);
            if let Payload::StateSync(sync) = payload {
                assert_eq!(sync.entries[0].key, "a");
                break;
            }
        }

        let mut synced = false;
        for _ in 0..200 {
            if handle.get("y").await.unwrap().is_some() {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(synced);
        assert_eq!(handle.get("x").await.unwrap(), None);
        assert_eq!(handle.peer_count().await.unwrap(), 1);

        handle.shutdown().await.unwrap();
        service_task.await.unwrap();
        recv_task.abort();
        send_task.abort();
    }
}
