use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use super::super::error::DhtError;
use super::super::message::Query;
use super::super::message_loop::LoopHandle;
use super::super::node::NodeId;
use super::get_peers::GetPeersTask;
use super::send_query::SendQueryTask;

#[derive(Debug, Default)]
pub(crate) struct AnnounceOutcome {
    /// Nodes that acknowledged the announce.
    pub announced: usize,
}

/// Looks up an info hash, then announces to every node that gave us a token.
///
/// Peers met during the lookup reach subscribers as `DhtEvent::PeersFound`.
pub(crate) struct AnnounceTask {
    info_hash: NodeId,
    port: u16,
}

impl AnnounceTask {
    pub fn new(info_hash: NodeId, port: u16) -> Self {
        Self { info_hash, port }
    }

    pub async fn execute(self, handle: &LoopHandle) -> Result<AnnounceOutcome, DhtError> {
        let lookup = GetPeersTask::new(self.info_hash).execute(handle).await?;
        let attempts = handle.settings().query_attempts;

        let mut in_flight: FuturesUnordered<_> = lookup
            .queried
            .into_iter()
            .filter_map(|node| {
                let token = node.token.clone()?;
                let query = Query::AnnouncePeer {
                    info_hash: self.info_hash,
                    port: self.port,
                    implied_port: false,
                    token,
                };
                Some(SendQueryTask::new(node, query, attempts).execute(handle))
            })
            .collect();

        let mut announced = 0;
        while let Some(result) = in_flight.next().await {
            if result.response.is_some() {
                announced += 1;
            }
        }

        debug!("Announced {} to {} nodes", self.info_hash, announced);
        Ok(AnnounceOutcome { announced })
    }
}
