//! swarmline - BitTorrent engine core
//!
//! The scheduling and discovery parts of a BitTorrent client, without the
//! disk and peer wire layers they drive.
//!
//! # Modules
//!
//! - [`picker`] - Block request coordination with rarest first and endgame mode
//! - [`dht`] - BEP-5 Kademlia DHT: routing table, tokens and lookup tasks
//! - [`tracker`] - BEP-3/12/15/23/48 tracker clients and tier failover
//! - [`bitfield`] - Piece availability bitfields
//! - [`settings`] - Runtime settings for the above

pub mod bitfield;
pub mod constants;
pub mod dht;
pub mod picker;
pub mod settings;
pub mod tracker;

pub use bitfield::Bitfield;
pub use dht::{DhtEngine, DhtError, DhtEvent, DhtState, Node, NodeId, RoutingTable};
pub use picker::{
    BlockRequest, PickerError, PieceSegment, PiecePicker, Priority, RequestEnqueuer, Requester,
    TorrentLayout,
};
pub use settings::{DhtSettings, PickerSettings, TierSettings};
pub use tracker::{
    AnnounceRequest, AnnounceResponse, HttpTracker, ScrapeResponse, Tracker, TrackerError,
    TrackerEvent, TrackerManager, TrackerTier, UdpTracker,
};
