//! Distributed Hash Table (BEP-5)
//!
//! This module implements the Kademlia-based DHT used by BitTorrent
//! for trackerless peer discovery. A single message loop owns all DHT state;
//! lookups, announces and table maintenance run as tasks talking to it.

mod engine;
mod error;
mod handlers;
mod message;
mod message_loop;
mod node;
mod routing;
mod store;
mod tasks;
mod token;
mod transport;

pub use engine::{DhtEngine, DhtEvent, DhtState};
pub use error::DhtError;
pub use message::{
    DecodeFailure, ErrorCode, KrpcError, KrpcMessage, NodeEntry, Query, QueryKind, ResponseBody,
    TransactionId,
};
pub use node::{
    compact_peer, encode_compact_nodes, parse_compact_nodes, parse_compact_peer, Node, NodeId,
    NodeState,
};
pub use routing::{AddOutcome, Bucket, RoutingTable};
pub use token::TokenManager;
pub use transport::DhtTransport;

#[cfg(test)]
mod tests;
