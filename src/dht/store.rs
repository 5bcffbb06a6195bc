use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use super::node::NodeId;

struct AnnouncedPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

/// Peers that announced themselves to us, keyed by info hash.
///
/// Both dimensions are bounded: at most `max_torrents` info hashes with at
/// most `max_peers` peers each.
pub(crate) struct PeerStore {
    torrents: HashMap<NodeId, Vec<AnnouncedPeer>>,
    max_peers: usize,
    max_torrents: usize,
    lifetime: Duration,
}

impl PeerStore {
    pub fn new(max_peers: usize, max_torrents: usize, lifetime: Duration) -> Self {
        Self {
            torrents: HashMap::new(),
            max_peers,
            max_torrents,
            lifetime,
        }
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.len()
    }

    pub fn add_peer(&mut self, info_hash: NodeId, addr: SocketAddr) {
        if !self.torrents.contains_key(&info_hash) && self.torrents.len() >= self.max_torrents {
            self.prune();
            if self.torrents.len() >= self.max_torrents {
                trace!("Peer store full, dropping announce for {}", info_hash);
                return;
            }
        }

        let lifetime = self.lifetime;
        let peers = self.torrents.entry(info_hash).or_default();

        peers.retain(|p| p.announced_at.elapsed() < lifetime && p.addr != addr);

        if peers.len() < self.max_peers {
            peers.push(AnnouncedPeer {
                addr,
                announced_at: Instant::now(),
            });
        }
    }

    /// Up to `limit` live peers for `info_hash`, most recent first.
    pub fn get_peers(&mut self, info_hash: &NodeId, limit: usize) -> Vec<SocketAddr> {
        let lifetime = self.lifetime;
        let Some(peers) = self.torrents.get_mut(info_hash) else {
            return Vec::new();
        };

        peers.retain(|p| p.announced_at.elapsed() < lifetime);
        let found = peers.iter().rev().take(limit).map(|p| p.addr).collect();

        if peers.is_empty() {
            self.torrents.remove(info_hash);
        }
        found
    }

    /// Drops expired peers and every info hash left without any.
    pub fn prune(&mut self) {
        let lifetime = self.lifetime;
        self.torrents.retain(|_, peers| {
            peers.retain(|p| p.announced_at.elapsed() < lifetime);
            !peers.is_empty()
        });
    }
}
