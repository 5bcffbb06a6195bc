use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use super::error::TrackerError;
use super::response::{
    AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse, TrackerEvent,
};
use super::Tracker;
use crate::settings::TierSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    NotContacted,
    Working,
    Failed,
}

/// What a tier learned about one of its trackers.
#[derive(Debug, Clone)]
pub struct TrackerStatus {
    pub state: TrackerState,
    pub update_interval: Duration,
    pub min_update_interval: Duration,
    pub warning_message: Option<String>,
    pub failure_message: Option<String>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub downloaded: Option<u32>,
}

impl TrackerStatus {
    fn new(settings: &TierSettings) -> Self {
        Self {
            state: TrackerState::NotContacted,
            update_interval: settings.default_update_interval,
            min_update_interval: settings.default_min_update_interval,
            warning_message: None,
            failure_message: None,
            complete: None,
            incomplete: None,
            downloaded: None,
        }
    }

    fn announced(&mut self, response: &AnnounceResponse, settings: &TierSettings) {
        self.state = TrackerState::Working;
        self.update_interval = match response.interval {
            0 => settings.default_update_interval,
            secs => Duration::from_secs(u64::from(secs)),
        };
        self.min_update_interval = response
            .min_interval
            .map(|secs| Duration::from_secs(u64::from(secs)))
            .unwrap_or(settings.default_min_update_interval);
        self.warning_message = response.warning_message.clone();
        self.failure_message = None;
        self.complete = response.complete.or(self.complete);
        self.incomplete = response.incomplete.or(self.incomplete);
    }

    fn failed(&mut self, error: &TrackerError) {
        self.state = TrackerState::Failed;
        self.failure_message = Some(error.to_string());
    }
}

/// Published on a tier's update channel for every tracker contacted.
#[derive(Debug, Clone)]
pub enum TrackerUpdate {
    Announce {
        url: String,
        event: TrackerEvent,
        result: Result<Vec<SocketAddr>, String>,
    },
    Scrape {
        url: String,
        result: Result<ScrapeResponse, String>,
    },
}

/// Outcome of [`TrackerTier::announce`].
#[derive(Debug, Clone)]
pub enum TierAnnounce {
    /// Too early to announce again; nothing was sent.
    Skipped,
    Succeeded(AnnounceResponse),
    /// Every tracker of the tier failed.
    Failed,
}

#[derive(Clone)]
struct TierEntry {
    tracker: Arc<dyn Tracker>,
    status: TrackerStatus,
}

/// A group of interchangeable trackers (BEP-12).
///
/// Announces go to the active tracker first and fail over round robin; the
/// first tracker to answer becomes the active one. Announces without an event
/// are held back until the active tracker's interval has passed.
pub struct TrackerTier {
    entries: Vec<TierEntry>,
    active_index: usize,
    last_announce: Option<Instant>,
    last_scrape: Option<Instant>,
    last_announce_succeeded: bool,
    last_scrape_succeeded: bool,
    sent_started_event: bool,
    settings: TierSettings,
    updates: Option<mpsc::UnboundedSender<TrackerUpdate>>,
}

impl TrackerTier {
    pub fn new(trackers: Vec<Arc<dyn Tracker>>, settings: TierSettings) -> Self {
        let entries = trackers
            .into_iter()
            .map(|tracker| TierEntry {
                tracker,
                status: TrackerStatus::new(&settings),
            })
            .collect();

        Self {
            entries,
            active_index: 0,
            last_announce: None,
            last_scrape: None,
            last_announce_succeeded: false,
            last_scrape_succeeded: false,
            sent_started_event: false,
            settings,
            updates: None,
        }
    }

    /// Publishes a [`TrackerUpdate`] for every tracker contacted from now on.
    pub fn with_updates(mut self, updates: mpsc::UnboundedSender<TrackerUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn trackers(&self) -> impl Iterator<Item = &Arc<dyn Tracker>> {
        self.entries.iter().map(|e| &e.tracker)
    }

    pub fn status(&self, url: &str) -> Option<&TrackerStatus> {
        self.position(url).map(|i| &self.entries[i].status)
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn active_tracker(&self) -> Option<&Arc<dyn Tracker>> {
        self.entries.get(self.active_index).map(|e| &e.tracker)
    }

    pub fn last_announce_succeeded(&self) -> bool {
        self.last_announce_succeeded
    }

    pub fn last_scrape_succeeded(&self) -> bool {
        self.last_scrape_succeeded
    }

    pub fn sent_started_event(&self) -> bool {
        self.sent_started_event
    }

    pub fn time_since_last_announce(&self) -> Option<Duration> {
        self.last_announce.map(|at| at.elapsed())
    }

    fn position(&self, url: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.tracker.url() == url)
    }

    fn active_status(&self) -> Option<&TrackerStatus> {
        self.entries.get(self.active_index).map(|e| &e.status)
    }

    /// Whether an announce with `event` would be sent now.
    pub fn can_announce(&self, event: TrackerEvent) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        if event != TrackerEvent::None {
            return true;
        }
        let (Some(at), Some(status)) = (self.last_announce, self.active_status()) else {
            return true;
        };

        let wait = if self.last_announce_succeeded {
            status.update_interval
        } else {
            status.min_update_interval
        };
        at.elapsed() >= wait
    }

    fn effective_event(&self, event: TrackerEvent) -> TrackerEvent {
        match event {
            TrackerEvent::None if !self.sent_started_event => TrackerEvent::Started,
            TrackerEvent::Started if self.sent_started_event => TrackerEvent::None,
            other => other,
        }
    }

    pub async fn announce(&mut self, request: &AnnounceRequest) -> TierAnnounce {
        if !self.can_announce(request.event) {
            trace!("Tier announce skipped, interval not elapsed");
            return TierAnnounce::Skipped;
        }

        let mut request = request.clone();
        request.event = self.effective_event(request.event);
        self.last_announce = Some(Instant::now());

        let count = self.entries.len();
        for offset in 0..count {
            let index = (self.active_index + offset) % count;
            let tracker = Arc::clone(&self.entries[index].tracker);

            let announce = tracker.announce(&request);
            let result = match timeout(self.settings.request_timeout, announce).await {
                Ok(result) => result,
                Err(_) => Err(TrackerError::Timeout),
            };

            self.publish(TrackerUpdate::Announce {
                url: tracker.url().to_string(),
                event: request.event,
                result: result
                    .as_ref()
                    .map(|r| r.all_peers().copied().collect())
                    .map_err(|e| e.to_string()),
            });

            match result {
                Ok(response) => {
                    debug!(
                        "Announced {:?} to {}: {} peers",
                        request.event,
                        tracker.url(),
                        response.peers.len() + response.peers6.len()
                    );
                    self.entries[index].status.announced(&response, &self.settings);
                    self.active_index = index;
                    self.last_announce_succeeded = true;
                    match request.event {
                        TrackerEvent::Started => self.sent_started_event = true,
                        TrackerEvent::Stopped => self.sent_started_event = false,
                        _ => {}
                    }
                    return TierAnnounce::Succeeded(response);
                }
                Err(e) => {
                    debug!("Announce to {} failed: {}", tracker.url(), e);
                    self.entries[index].status.failed(&e);
                }
            }
        }

        warn!("All {} trackers in tier failed to announce", count);
        self.last_announce_succeeded = false;
        TierAnnounce::Failed
    }

    /// Scrapes the active tracker, at most once per its minimum interval.
    pub async fn scrape(&mut self, request: &ScrapeRequest) -> Option<ScrapeResponse> {
        let index = self.active_index;
        let entry = self.entries.get(index)?;
        if !entry.tracker.can_scrape() {
            return None;
        }
        if let Some(at) = self.last_scrape {
            if at.elapsed() < entry.status.min_update_interval {
                return None;
            }
        }

        let tracker = Arc::clone(&entry.tracker);
        self.last_scrape = Some(Instant::now());

        let result = match timeout(self.settings.request_timeout, tracker.scrape(request)).await {
            Ok(result) => result,
            Err(_) => Err(TrackerError::Timeout),
        };

        self.publish(TrackerUpdate::Scrape {
            url: tracker.url().to_string(),
            result: result
                .as_ref()
                .map(ScrapeResponse::clone)
                .map_err(|e| e.to_string()),
        });

        match result {
            Ok(response) => {
                self.last_scrape_succeeded = true;
                if let [file] = response.files.as_slice() {
                    let status = &mut self.entries[index].status;
                    status.complete = Some(file.complete);
                    status.incomplete = Some(file.incomplete);
                    status.downloaded = Some(file.downloaded);
                }
                Some(response)
            }
            Err(e) => {
                debug!("Scrape of {} failed: {}", tracker.url(), e);
                self.last_scrape_succeeded = false;
                None
            }
        }
    }

    /// A copy of this tier with `tracker` appended.
    pub fn with_tracker(&self, tracker: Arc<dyn Tracker>) -> TrackerTier {
        let mut entries = self.entries.clone();
        entries.push(TierEntry {
            tracker,
            status: TrackerStatus::new(&self.settings),
        });
        self.rebuilt(entries, self.active_index)
    }

    /// A copy of this tier without the tracker announcing to `url`.
    pub fn without_tracker(&self, url: &str) -> TrackerTier {
        let Some(removed) = self.position(url) else {
            return self.rebuilt(self.entries.clone(), self.active_index);
        };

        let mut entries = self.entries.clone();
        entries.remove(removed);

        let active_index = if removed < self.active_index {
            self.active_index - 1
        } else if self.active_index >= entries.len() {
            0
        } else {
            self.active_index
        };
        self.rebuilt(entries, active_index)
    }

    fn rebuilt(&self, entries: Vec<TierEntry>, active_index: usize) -> TrackerTier {
        TrackerTier {
            entries,
            active_index,
            last_announce: self.last_announce,
            last_scrape: self.last_scrape,
            last_announce_succeeded: self.last_announce_succeeded,
            last_scrape_succeeded: self.last_scrape_succeeded,
            sent_started_event: self.sent_started_event,
            settings: self.settings.clone(),
            updates: self.updates.clone(),
        }
    }

    fn publish(&self, update: TrackerUpdate) {
        if let Some(updates) = &self.updates {
            let _ = updates.send(update);
        }
    }
}
