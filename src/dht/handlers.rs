use std::net::SocketAddr;

use tracing::{debug, trace};

use super::message::{ErrorCode, KrpcMessage, Query, ResponseBody, TransactionId};
use super::message_loop::MessageLoop;
use super::node::NodeId;
use super::transport::DhtTransport;
use crate::constants::{DHT_BUCKET_SIZE, DHT_MAX_PEERS_PER_REPLY};

impl<T: DhtTransport> MessageLoop<T> {
    /// Answers an incoming query. Every well-formed query gets exactly one
    /// reply, either a response or a KRPC error.
    pub(super) fn handle_query(
        &mut self,
        transaction_id: TransactionId,
        sender: NodeId,
        query: Query,
        from: SocketAddr,
    ) {
        trace!("Received {} from {} ({})", query.method(), from, sender);
        self.observe(sender, from);

        let local_id = self.local_id();
        let reply = match query {
            Query::Ping => KrpcMessage::response(transaction_id, ResponseBody::new(local_id)),
            Query::FindNode { target } => {
                let closest = self.table.closest(&target, DHT_BUCKET_SIZE);
                KrpcMessage::response(
                    transaction_id,
                    ResponseBody::new(local_id).with_nodes(&closest),
                )
            }
            Query::GetPeers { info_hash } => {
                let token = self.tokens.generate_token(&from);
                let peers = self.store.get_peers(&info_hash, DHT_MAX_PEERS_PER_REPLY);
                let body = ResponseBody::new(local_id).with_token(token);

                let body = if peers.is_empty() {
                    body.with_nodes(&self.table.closest(&info_hash, DHT_BUCKET_SIZE))
                } else {
                    body.with_values(peers)
                };
                KrpcMessage::response(transaction_id, body)
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
            } => {
                if !self.tokens.verify_token(&from, &token) {
                    debug!("Rejecting announce from {} with invalid token", from);
                    KrpcMessage::error(transaction_id, ErrorCode::Protocol, "invalid token")
                } else {
                    let port = if implied_port { from.port() } else { port };
                    let peer = SocketAddr::new(from.ip(), port);
                    debug!("Peer {} announced {}", peer, info_hash);
                    self.store.add_peer(info_hash, peer);
                    KrpcMessage::response(transaction_id, ResponseBody::new(local_id))
                }
            }
        };

        self.enqueue(from, reply);
    }
}
