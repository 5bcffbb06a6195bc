use std::collections::HashSet;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::lookup_host;
use tracing::{debug, info};

use super::super::engine::DhtState;
use super::super::error::DhtError;
use super::super::message::Query;
use super::super::message_loop::LoopHandle;
use super::super::node::{Node, NodeId};
use super::closest::ClosestNodes;
use super::send_query::SendQueryTask;
use crate::constants::DHT_BUCKET_SIZE;

/// Fills the routing table by looking up our own id.
///
/// Starts from the given seed nodes and falls back to the bootstrap routers
/// when the table is still thin afterwards.
pub(crate) struct InitialiseTask {
    seeds: Vec<Node>,
}

impl InitialiseTask {
    pub fn new(seeds: Vec<Node>) -> Self {
        Self { seeds }
    }

    /// Returns the number of nodes in the routing table once done.
    pub async fn execute(self, handle: &LoopHandle) -> Result<usize, DhtError> {
        handle.set_state(DhtState::Initialising).await?;

        if !self.seeds.is_empty() {
            find_own_neighbours(handle, self.seeds).await;
        }

        let mut count = handle.node_count().await?;
        if count < handle.settings().min_bootstrap_nodes {
            let routers = resolve_routers(&handle.settings().bootstrap_routers).await;
            if !routers.is_empty() {
                debug!("Only {} nodes known, bootstrapping from routers", count);
                find_own_neighbours(handle, routers).await;
                count = handle.node_count().await?;
            }
        }

        info!("DHT bootstrap complete with {} nodes", count);
        handle.set_state(DhtState::Ready).await?;
        Ok(count)
    }
}

/// Runs `find_node(local_id)` towards ever closer nodes until nothing is in
/// flight. Every node that answers lands in the routing table.
async fn find_own_neighbours(handle: &LoopHandle, seeds: Vec<Node>) {
    let target = handle.local_id();
    let attempts = handle.settings().query_attempts;
    let query =
        |node: Node| SendQueryTask::new(node, Query::FindNode { target }, attempts).execute(handle);

    let mut closest = ClosestNodes::new(target, DHT_BUCKET_SIZE);
    let mut contacted = HashSet::new();
    let mut in_flight = FuturesUnordered::new();

    for node in seeds {
        contacted.insert(node.id);
        in_flight.push(query(node));
    }

    while let Some(result) = in_flight.next().await {
        let Some(response) = result.response else {
            continue;
        };

        for entry in response.nodes.into_iter().flatten() {
            if entry.id == target || !contacted.insert(entry.id) {
                continue;
            }
            let node = entry.into_node();
            if closest.try_insert(node.clone()) {
                in_flight.push(query(node));
            }
        }
    }
}

async fn resolve_routers(routers: &[String]) -> Vec<Node> {
    let mut nodes = Vec::new();
    for router in routers {
        match lookup_host(router.as_str()).await {
            Ok(addrs) => nodes.extend(
                addrs
                    .filter(|addr| addr.is_ipv4())
                    .map(|addr| Node::new(NodeId::generate(), addr)),
            ),
            Err(e) => debug!("Failed to resolve DHT router {}: {}", router, e),
        }
    }
    nodes
}
