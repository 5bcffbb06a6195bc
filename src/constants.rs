//! Protocol constants and tuning parameters.
//!
//! This module contains the constants used by the piece picker, the DHT engine
//! and the tracker scheduler. Values that callers may want to change at runtime
//! are also exposed through the structs in [`crate::settings`], which use these
//! constants as their defaults.

use std::time::Duration;

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Fewest requests we keep in flight to any unchoked peer
pub const MIN_PENDING_REQUESTS: usize = 2;

/// Maximum outstanding block requests per peer for request pipelining.
/// Used when the peer does not advertise `reqq` in its extension handshake.
pub const MAX_REQUESTS_PER_PEER: usize = 250;

/// Seconds of transfer we try to keep queued at a peer
pub const REQUEST_PIPELINE_SECONDS: u64 = 2;

/// Peers a single block may be requested from during endgame
pub const ENDGAME_MAX_REQUESTERS: usize = 3;

// ============================================================================
// DHT routing
// ============================================================================

/// Kademlia K: nodes per bucket and size of closest-node sets
pub const DHT_BUCKET_SIZE: usize = 8;

/// Number of prefix buckets in the routing table (one per id bit)
pub const DHT_NUM_BUCKETS: usize = 160;

/// A node answering within this window is considered good
pub const DHT_NODE_GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Failed queries after which a node is bad
pub const DHT_MAX_FAILURES: u32 = 4;

/// Nodes seen more recently than this are never replaced
pub const DHT_REPLACEMENT_GRACE: Duration = Duration::from_secs(3 * 60);

/// Buckets untouched for this long are refreshed
pub const DHT_BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Below this many nodes after seeding, bootstrap from the public routers
pub const DHT_MIN_BOOTSTRAP_NODES: usize = 10;

/// Well-known DHT bootstrap routers
pub const DHT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

// ============================================================================
// DHT queries and tokens
// ============================================================================

/// DHT query timeout, per attempt
pub const DHT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts made by a query task before giving up on a node
pub const DHT_QUERY_ATTEMPTS: u32 = 3;

/// Maximum pending DHT queries
pub const MAX_PENDING_DHT_QUERIES: usize = 1024;

/// How often the message loop sweeps timeouts and stale buckets
pub const DHT_MAINTENANCE_TICK: Duration = Duration::from_millis(250);

/// Lifetime of one token secret
pub const DHT_TOKEN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Length of the token secret in bytes
pub const DHT_TOKEN_SECRET_LEN: usize = 10;

/// Peers remembered per info hash from `announce_peer`
pub const DHT_MAX_PEERS_PER_TORRENT: usize = 1000;

/// Info hashes the announced-peer store holds at once
pub const DHT_MAX_TORRENTS: usize = 2000;

/// How often expired announced peers are swept from the store
pub const DHT_PEER_STORE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Peer values returned in a single `get_peers` reply
pub const DHT_MAX_PEERS_PER_REPLY: usize = 50;

/// Announced peers are forgotten after this long
pub const DHT_PEER_ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Largest datagram the DHT socket reads
pub const DHT_MAX_PACKET_SIZE: usize = 65535;

// ============================================================================
// Tracker intervals
// ============================================================================

/// Default tracker announce interval when the tracker does not send one
pub const TRACKER_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

/// Default minimum announce interval (used after failures)
pub const TRACKER_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Time we give a single tracker to answer an announce or scrape
pub const TRACKER_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// UDP tracker attempts per request. The per-tracker timeout is split across
/// them, each wait twice as long as the one before.
pub const UDP_TRACKER_MAX_RETRIES: u32 = 3;

/// Largest datagram a UDP tracker may answer with
pub const UDP_TRACKER_MAX_PACKET_SIZE: usize = 65535;

/// A UDP tracker connection id stays valid for this long (BEP-15)
pub const UDP_CONNECTION_ID_LIFETIME: Duration = Duration::from_secs(60);

// ============================================================================
// Protocol values - UDP tracker (BEP-15)
// ============================================================================

/// Magic constant for UDP tracker connect
pub const UDP_TRACKER_PROTOCOL_ID: u64 = 0x41727101980;

/// UDP tracker action: connect
pub const UDP_ACTION_CONNECT: u32 = 0;

/// UDP tracker action: announce
pub const UDP_ACTION_ANNOUNCE: u32 = 1;

/// UDP tracker action: scrape
pub const UDP_ACTION_SCRAPE: u32 = 2;

/// UDP tracker action: error
pub const UDP_ACTION_ERROR: u32 = 3;
