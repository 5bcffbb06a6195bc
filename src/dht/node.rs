use super::error::DhtError;
use crate::constants::{DHT_MAX_FAILURES, DHT_NODE_GOOD_WINDOW};
use bytes::Bytes;
use rand::Rng as _;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::time::Instant;

pub const COMPACT_NODE_LEN: usize = 26;
pub const COMPACT_PEER_LEN: usize = 6;

/// A 160-bit DHT identifier, compared as a big-endian unsigned integer.
///
/// The XOR of two ids is their Kademlia distance: the smaller the result,
/// the closer the ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub const MIN: NodeId = NodeId([0u8; 20]);
    pub const MAX: NodeId = NodeId([0xFF; 20]);

    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; 20] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to `other`.
    pub fn xor(&self, other: &NodeId) -> NodeId {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        NodeId(dist)
    }

    /// Number of leading bits shared with `other`, capped at 159.
    ///
    /// This is the index of the routing table bucket `other` belongs to when
    /// `self` is the local id.
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        let dist = self.xor(other);

        for (i, &byte) in dist.0.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        159
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<[u8; 20]> for NodeId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

/// Liveness of a remote node, derived from its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Never answered us.
    Unknown,
    /// Answered within the last 15 minutes.
    Good,
    /// Answered once, but not recently.
    Questionable,
    /// Failed too many queries in a row.
    Bad,
}

/// A remote DHT participant.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Option<Instant>,
    pub failed_count: u32,
    /// Write token handed out by this node in a `get_peers` reply.
    pub token: Option<Bytes>,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: None,
            failed_count: 0,
            token: None,
        }
    }

    /// Records a successful exchange with the node.
    pub fn seen(&mut self) {
        self.last_seen = Some(Instant::now());
        self.failed_count = 0;
    }

    /// Records a query that went unanswered.
    pub fn failed(&mut self) {
        self.failed_count = self.failed_count.saturating_add(1);
    }

    pub fn state(&self) -> NodeState {
        if self.failed_count >= DHT_MAX_FAILURES {
            return NodeState::Bad;
        }
        match self.last_seen {
            None => NodeState::Unknown,
            Some(at) if at.elapsed() < DHT_NODE_GOOD_WINDOW => NodeState::Good,
            Some(_) => NodeState::Questionable,
        }
    }

    pub fn is_good(&self) -> bool {
        self.state() == NodeState::Good
    }

    pub fn is_bad(&self) -> bool {
        self.state() == NodeState::Bad
    }

    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_LEN {
            return None;
        }

        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let addr = parse_compact_peer(&data[20..])?;

        Some(Self::new(id, addr))
    }

    /// Compact node info: 20 byte id, 4 byte IPv4 address, 2 byte port.
    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let mut compact = [0u8; COMPACT_NODE_LEN];
        compact[..20].copy_from_slice(&self.id.0);
        compact[20..].copy_from_slice(&compact_peer(&self.addr)?);
        Some(compact)
    }
}

/// Packs IPv4 nodes into the compact `nodes` string. IPv6 nodes are skipped.
pub fn encode_compact_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Vec<u8> {
    nodes
        .into_iter()
        .filter_map(Node::to_compact)
        .flatten()
        .collect()
}

/// Unpacks a compact `nodes` string. Returns `None` if the length is not a
/// multiple of 26 bytes.
pub fn parse_compact_nodes(data: &[u8]) -> Option<Vec<Node>> {
    if data.len() % COMPACT_NODE_LEN != 0 {
        return None;
    }
    data.chunks_exact(COMPACT_NODE_LEN)
        .map(Node::from_compact)
        .collect()
}

/// Compact peer info: 4 byte IPv4 address followed by a 2 byte port.
pub fn compact_peer(addr: &SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut compact = [0u8; COMPACT_PEER_LEN];
            compact[..4].copy_from_slice(&v4.ip().octets());
            compact[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(compact)
        }
        SocketAddr::V6(_) => None,
    }
}

pub fn parse_compact_peer(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}
