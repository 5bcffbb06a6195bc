use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::debug;

use super::error::TrackerError;
use super::http::HttpTracker;
use super::response::{AnnounceRequest, ScrapeRequest, ScrapeResponse};
use super::tier::{TierAnnounce, TrackerTier, TrackerUpdate};
use super::udp::UdpTracker;
use super::Tracker;
use crate::constants::TRACKER_REQUEST_TIMEOUT;
use crate::settings::TierSettings;

/// Builds the tracker client for an announce URL.
pub fn tracker_from_url(url: &str) -> Result<Arc<dyn Tracker>, TrackerError> {
    tracker_with_timeout(url, TRACKER_REQUEST_TIMEOUT)
}

/// Like [`tracker_from_url`], with every request finishing within `timeout`.
pub fn tracker_with_timeout(
    url: &str,
    timeout: Duration,
) -> Result<Arc<dyn Tracker>, TrackerError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Arc::new(HttpTracker::with_timeout(url, timeout)?))
    } else if url.starts_with("udp://") {
        Ok(Arc::new(UdpTracker::with_timeout(url, timeout)?))
    } else {
        let scheme = url.split("://").next().unwrap_or(url);
        Err(TrackerError::UnsupportedProtocol(scheme.to_string()))
    }
}

/// All tracker tiers of one torrent.
///
/// Tiers are announced to concurrently; inside a tier trackers are tried one
/// after another.
pub struct TrackerManager {
    tiers: Vec<TrackerTier>,
    settings: TierSettings,
    updates: Option<mpsc::UnboundedSender<TrackerUpdate>>,
}

impl TrackerManager {
    pub fn new(settings: TierSettings) -> Self {
        Self {
            tiers: Vec::new(),
            settings,
            updates: None,
        }
    }

    /// Builds one tier per inner list of an announce list (BEP-12).
    /// URLs with unsupported schemes are skipped.
    pub fn from_announce_list(announce_list: &[Vec<String>], settings: TierSettings) -> Self {
        let timeout = settings.request_timeout;
        let mut manager = Self::new(settings);
        for urls in announce_list {
            let trackers: Vec<_> = urls
                .iter()
                .filter_map(|url| match tracker_with_timeout(url, timeout) {
                    Ok(tracker) => Some(tracker),
                    Err(e) => {
                        debug!("Skipping tracker {}: {}", url, e);
                        None
                    }
                })
                .collect();
            manager.add_tier(trackers);
        }
        manager
    }

    pub fn with_updates(mut self, updates: mpsc::UnboundedSender<TrackerUpdate>) -> Self {
        self.tiers = self
            .tiers
            .into_iter()
            .map(|tier| tier.with_updates(updates.clone()))
            .collect();
        self.updates = Some(updates);
        self
    }

    pub fn tiers(&self) -> &[TrackerTier] {
        &self.tiers
    }

    pub fn add_tier(&mut self, trackers: Vec<Arc<dyn Tracker>>) {
        if trackers.is_empty() {
            return;
        }
        let mut tier = TrackerTier::new(trackers, self.settings.clone());
        if let Some(updates) = &self.updates {
            tier = tier.with_updates(updates.clone());
        }
        self.tiers.push(tier);
    }

    /// Adds the tracker for `url` to tier `tier`, or to a new tier past the
    /// last one.
    pub fn add_tracker(&mut self, tier: usize, url: &str) -> Result<(), TrackerError> {
        let tracker = tracker_with_timeout(url, self.settings.request_timeout)?;
        match self.tiers.get_mut(tier) {
            Some(existing) => *existing = existing.with_tracker(tracker),
            None => self.add_tier(vec![tracker]),
        }
        Ok(())
    }

    /// Removes every tracker announcing to `url`. Tiers left empty are dropped.
    pub fn remove_tracker(&mut self, url: &str) -> bool {
        let before: usize = self.tiers.iter().map(TrackerTier::len).sum();
        self.tiers = self
            .tiers
            .iter()
            .map(|tier| tier.without_tracker(url))
            .filter(|tier| !tier.is_empty())
            .collect();
        self.tiers.iter().map(TrackerTier::len).sum::<usize>() < before
    }

    /// Announces to every tier at once and returns the distinct peers found.
    pub async fn announce(&mut self, request: &AnnounceRequest) -> Vec<SocketAddr> {
        let results = join_all(self.tiers.iter_mut().map(|tier| tier.announce(request))).await;

        let mut seen = HashSet::new();
        results
            .iter()
            .filter_map(|result| match result {
                TierAnnounce::Succeeded(response) => Some(response),
                _ => None,
            })
            .flat_map(|response| response.all_peers().copied())
            .filter(|peer| seen.insert(*peer))
            .collect()
    }

    pub async fn scrape(&mut self, request: &ScrapeRequest) -> Vec<ScrapeResponse> {
        join_all(self.tiers.iter_mut().map(|tier| tier.scrape(request)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}
