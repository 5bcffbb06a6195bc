use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tracing::info;

use super::error::DhtError;
use super::message_loop::{Command, LoopHandle, MessageLoop};
use super::node::{encode_compact_nodes, parse_compact_nodes, Node, NodeId};
use super::tasks::{AnnounceTask, GetPeersTask, InitialiseTask};
use super::transport::DhtTransport;
use crate::settings::DhtSettings;

/// Lifecycle of a [`DhtEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtState {
    NotReady,
    Initialising,
    Ready,
}

/// Notifications published by a running engine.
#[derive(Debug, Clone)]
pub enum DhtEvent {
    StateChanged(DhtState),
    /// A lookup learned new peers for a torrent.
    PeersFound {
        info_hash: NodeId,
        peers: Vec<SocketAddr>,
    },
}

/// A DHT node ([BEP-5]).
///
/// The engine owns a background message loop holding the routing table,
/// token manager and announced-peer store. All methods are cheap requests to
/// that loop, so the engine can be shared behind an `Arc`.
///
/// # Examples
///
/// ```no_run
/// use swarmline::dht::DhtEngine;
/// use swarmline::settings::DhtSettings;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dht = DhtEngine::bind(DhtSettings::default()).await?;
///
/// // Join the network through the default routers
/// dht.start(&[]).await?;
///
/// let info_hash = [0u8; 20];
/// let peers = dht.get_peers(info_hash).await?;
/// # Ok(())
/// # }
/// ```
///
/// [BEP-5]: http://bittorrent.org/beps/bep_0005.html
pub struct DhtEngine {
    handle: LoopHandle,
    state: watch::Receiver<DhtState>,
    local_addr: SocketAddr,
}

impl DhtEngine {
    /// Binds the UDP socket from `settings` with a fresh random node id.
    pub async fn bind(settings: DhtSettings) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind(settings.listen_addr).await?;
        Self::with_transport(socket, NodeId::generate(), settings)
    }

    /// Runs the engine over any datagram transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport<T: DhtTransport>(
        transport: T,
        local_id: NodeId,
        settings: DhtSettings,
    ) -> Result<Self, DhtError> {
        let local_addr = transport.local_addr()?;
        let (message_loop, handle, commands, state) =
            MessageLoop::new(transport, local_id, settings);
        tokio::spawn(message_loop.run(commands));

        info!("DHT engine bound to {} with id {}", local_addr, local_id);

        Ok(Self {
            handle,
            state,
            local_addr,
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.handle.local_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> DhtState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DhtEvent> {
        self.handle.subscribe()
    }

    /// Joins the network through `seeds`, falling back to the configured
    /// routers. Resolves once the engine is [`DhtState::Ready`] and returns
    /// the routing table size.
    pub async fn start(&self, seeds: &[SocketAddr]) -> Result<usize, DhtError> {
        let seeds = seeds
            .iter()
            .map(|&addr| Node::new(NodeId::generate(), addr))
            .collect();
        InitialiseTask::new(seeds).execute(&self.handle).await
    }

    /// Like [`start`](Self::start), seeded from the output of
    /// [`save_nodes`](Self::save_nodes).
    pub async fn start_from_saved(&self, saved: &[u8]) -> Result<usize, DhtError> {
        let seeds = parse_compact_nodes(saved)
            .ok_or_else(|| DhtError::InvalidMessage("saved nodes are not compact".into()))?;
        InitialiseTask::new(seeds).execute(&self.handle).await
    }

    /// The routing table in compact node format.
    pub async fn save_nodes(&self) -> Result<Bytes, DhtError> {
        let nodes = self.handle.nodes().await?;
        Ok(Bytes::from(encode_compact_nodes(&nodes)))
    }

    pub async fn get_peers(&self, info_hash: [u8; 20]) -> Result<Vec<SocketAddr>, DhtError> {
        let outcome = GetPeersTask::new(NodeId(info_hash))
            .execute(&self.handle)
            .await?;
        Ok(outcome.peers)
    }

    /// Announces that we serve `info_hash` on `port`. Returns the number of
    /// nodes that accepted the announce.
    pub async fn announce(&self, info_hash: [u8; 20], port: u16) -> Result<usize, DhtError> {
        let outcome = AnnounceTask::new(NodeId(info_hash), port)
            .execute(&self.handle)
            .await?;
        Ok(outcome.announced)
    }

    /// Pings `addr`; it joins the routing table if it answers.
    pub async fn add_node(&self, addr: SocketAddr) -> Result<(), DhtError> {
        self.handle
            .add_node(Node::new(NodeId::generate(), addr))
            .await
    }

    pub async fn node_count(&self) -> Result<usize, DhtError> {
        self.handle.node_count().await
    }

    pub async fn closest_nodes(&self, target: NodeId, count: usize) -> Result<Vec<Node>, DhtError> {
        self.handle.closest(target, count).await
    }

    pub async fn nodes(&self) -> Result<Vec<Node>, DhtError> {
        self.handle.nodes().await
    }

    pub async fn stop(&self) -> Result<(), DhtError> {
        self.handle.send(Command::Shutdown).await
    }
}

impl Drop for DhtEngine {
    fn drop(&mut self) {
        self.handle.try_shutdown();
    }
}
