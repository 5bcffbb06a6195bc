//! Runtime settings for the engine subsystems.
//!
//! Every struct here implements [`Default`] with the values from
//! [`crate::constants`]. Hosts that load configuration from files or the
//! environment build these structs themselves.

use crate::constants::*;
use std::net::SocketAddr;
use std::time::Duration;

/// Settings for [`DhtEngine`](crate::dht::DhtEngine).
#[derive(Debug, Clone)]
pub struct DhtSettings {
    /// Address the UDP socket binds to in [`DhtEngine::bind`](crate::dht::DhtEngine::bind).
    pub listen_addr: SocketAddr,
    /// Time a single query attempt waits for a response.
    pub query_timeout: Duration,
    /// Attempts a query task makes before giving up on a node.
    pub query_attempts: u32,
    /// Cap on concurrently pending transactions.
    pub max_pending_queries: usize,
    /// Buckets untouched for this long get a refresh task.
    pub bucket_refresh_interval: Duration,
    /// Nodes seen within this window are never replaced.
    pub replacement_grace: Duration,
    /// Lifetime of one token secret.
    pub token_timeout: Duration,
    /// Fewer nodes than this after seeding triggers a router bootstrap.
    pub min_bootstrap_nodes: usize,
    /// Router hostnames used when the seeds are not enough.
    pub bootstrap_routers: Vec<String>,
    /// Peers stored per info hash.
    pub max_peers_per_torrent: usize,
    /// Info hashes stored at once; announces for new ones are dropped past this.
    pub max_torrents: usize,
    /// Stored peers expire after this long.
    pub peer_announce_lifetime: Duration,
    /// How often the message loop sweeps timeouts.
    pub maintenance_tick: Duration,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 6881)),
            query_timeout: DHT_QUERY_TIMEOUT,
            query_attempts: DHT_QUERY_ATTEMPTS,
            max_pending_queries: MAX_PENDING_DHT_QUERIES,
            bucket_refresh_interval: DHT_BUCKET_REFRESH_INTERVAL,
            replacement_grace: DHT_REPLACEMENT_GRACE,
            token_timeout: DHT_TOKEN_TIMEOUT,
            min_bootstrap_nodes: DHT_MIN_BOOTSTRAP_NODES,
            bootstrap_routers: DHT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            max_peers_per_torrent: DHT_MAX_PEERS_PER_TORRENT,
            max_torrents: DHT_MAX_TORRENTS,
            peer_announce_lifetime: DHT_PEER_ANNOUNCE_LIFETIME,
            maintenance_tick: DHT_MAINTENANCE_TICK,
        }
    }
}

/// Settings for [`PiecePicker`](crate::picker::PiecePicker).
#[derive(Debug, Clone)]
pub struct PickerSettings {
    /// Prefer pieces advertised by the fewest peers.
    pub rarest_first: bool,
    /// Break ties randomly instead of by piece index.
    pub randomised: bool,
    /// Peers a block may be requested from at once during endgame.
    pub endgame_max_requesters: usize,
    /// Fixed seed for the tie-break rng; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for PickerSettings {
    fn default() -> Self {
        Self {
            rarest_first: true,
            randomised: true,
            endgame_max_requesters: ENDGAME_MAX_REQUESTERS,
            seed: None,
        }
    }
}

/// Settings for [`TrackerTier`](crate::tracker::TrackerTier).
#[derive(Debug, Clone)]
pub struct TierSettings {
    /// Time a single tracker gets to answer before the tier moves on.
    pub request_timeout: Duration,
    /// Announce interval assumed until a tracker reports one.
    pub default_update_interval: Duration,
    /// Minimum interval assumed until a tracker reports one.
    pub default_min_update_interval: Duration,
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            request_timeout: TRACKER_REQUEST_TIMEOUT,
            default_update_interval: TRACKER_ANNOUNCE_INTERVAL,
            default_min_update_interval: TRACKER_MIN_INTERVAL,
        }
    }
}
