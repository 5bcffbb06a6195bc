//! Tracker protocol (BEP-3, BEP-12, BEP-15, BEP-23)
//!
//! HTTP and UDP tracker clients behind the [`Tracker`] trait, grouped into
//! failover tiers that schedule announces from the intervals the trackers
//! report.

mod error;
mod http;
mod manager;
mod response;
mod tier;
mod udp;

use futures::future::BoxFuture;

pub use error::TrackerError;
pub use http::HttpTracker;
pub use manager::{tracker_from_url, tracker_with_timeout, TrackerManager};
pub use response::{
    parse_compact_peers, parse_compact_peers6, AnnounceRequest, AnnounceResponse, ScrapeFile,
    ScrapeRequest, ScrapeResponse, TrackerEvent,
};
pub use tier::{TierAnnounce, TrackerState, TrackerStatus, TrackerTier, TrackerUpdate};
pub use udp::UdpTracker;

/// A tracker endpoint a [`TrackerTier`] can announce to.
pub trait Tracker: Send + Sync {
    /// The announce URL, which also identifies the tracker within a tier.
    fn url(&self) -> &str;

    fn can_scrape(&self) -> bool;

    fn announce<'a>(
        &'a self,
        request: &'a AnnounceRequest,
    ) -> BoxFuture<'a, Result<AnnounceResponse, TrackerError>>;

    fn scrape<'a>(
        &'a self,
        request: &'a ScrapeRequest,
    ) -> BoxFuture<'a, Result<ScrapeResponse, TrackerError>>;
}

#[cfg(test)]
mod tests;
