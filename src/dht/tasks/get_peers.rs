use std::collections::HashSet;
use std::net::SocketAddr;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use super::super::engine::DhtEvent;
use super::super::error::DhtError;
use super::super::message::Query;
use super::super::message_loop::LoopHandle;
use super::super::node::{Node, NodeId};
use super::closest::ClosestNodes;
use super::send_query::SendQueryTask;
use crate::constants::DHT_BUCKET_SIZE;

#[derive(Debug, Default)]
pub(crate) struct GetPeersOutcome {
    pub peers: Vec<SocketAddr>,
    /// The closest nodes that answered, with the write tokens they handed out.
    pub queried: Vec<Node>,
}

/// Iterative `get_peers` lookup towards an info hash.
pub(crate) struct GetPeersTask {
    info_hash: NodeId,
}

impl GetPeersTask {
    pub fn new(info_hash: NodeId) -> Self {
        Self { info_hash }
    }

    pub async fn execute(self, handle: &LoopHandle) -> Result<GetPeersOutcome, DhtError> {
        let info_hash = self.info_hash;
        let attempts = handle.settings().query_attempts;
        let query = |node: Node| {
            SendQueryTask::new(node, Query::GetPeers { info_hash }, attempts).execute(handle)
        };

        let mut closest = ClosestNodes::new(info_hash, DHT_BUCKET_SIZE);
        let mut queried = ClosestNodes::new(info_hash, DHT_BUCKET_SIZE * 2);
        let mut contacted = HashSet::new();
        let mut known_peers = HashSet::new();
        let mut peers = Vec::new();
        let mut in_flight = FuturesUnordered::new();

        for node in handle.closest(info_hash, DHT_BUCKET_SIZE).await? {
            if contacted.insert(node.id) && closest.try_insert(node.clone()) {
                in_flight.push(query(node));
            }
        }

        while let Some(result) = in_flight.next().await {
            let Some(response) = result.response else {
                closest.remove(&result.node.id);
                continue;
            };

            let mut node = result.node;
            node.token = response.token;
            queried.try_insert(node);

            if let Some(values) = response.values {
                let found: Vec<SocketAddr> = values
                    .into_iter()
                    .filter(|peer| known_peers.insert(*peer))
                    .collect();
                if !found.is_empty() {
                    debug!("Found {} peers for {}", found.len(), info_hash);
                    peers.extend_from_slice(&found);
                    handle.publish(DhtEvent::PeersFound {
                        info_hash,
                        peers: found,
                    });
                }
            }

            for entry in response.nodes.into_iter().flatten() {
                if entry.id == handle.local_id() || contacted.contains(&entry.id) {
                    continue;
                }
                let node = entry.into_node();
                if closest.try_insert(node.clone()) {
                    contacted.insert(node.id);
                    in_flight.push(query(node));
                }
            }
        }

        Ok(GetPeersOutcome {
            peers,
            queried: queried.into_nodes(),
        })
    }
}
