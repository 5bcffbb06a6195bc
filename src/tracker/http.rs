use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use serde::Deserialize;
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use tracing::trace;

use super::error::TrackerError;
use super::response::{
    parse_compact_peers, parse_compact_peers6, AnnounceRequest, AnnounceResponse, ScrapeFile,
    ScrapeRequest, ScrapeResponse,
};
use super::Tracker;
use crate::constants::TRACKER_REQUEST_TIMEOUT;

#[derive(Debug, Deserialize)]
struct AnnounceReply {
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default, rename = "warning message")]
    warning_message: Option<String>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default, rename = "min interval")]
    min_interval: Option<i64>,
    #[serde(default, rename = "tracker id")]
    tracker_id: Option<String>,
    #[serde(default)]
    complete: Option<i64>,
    #[serde(default)]
    incomplete: Option<i64>,
    #[serde(default)]
    peers: Option<Value>,
    #[serde(default)]
    peers6: Option<ByteBuf>,
}

#[derive(Debug, Deserialize)]
struct ScrapeReply {
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    files: HashMap<ByteBuf, ScrapeStats>,
}

#[derive(Debug, Default, Deserialize)]
struct ScrapeStats {
    #[serde(default)]
    complete: i64,
    #[serde(default)]
    incomplete: i64,
    #[serde(default)]
    downloaded: i64,
}

/// An HTTP(S) tracker (BEP-3, BEP-23 compact peers, BEP-48 scrape).
pub struct HttpTracker {
    client: Client,
    url: String,
    scrape_url: Option<String>,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        Self::with_timeout(url, TRACKER_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TrackerError::Http)?;

        Ok(Self {
            client,
            url: url.to_string(),
            scrape_url: scrape_url(url),
        })
    }

    pub fn scrape_url(&self) -> Option<&str> {
        self.scrape_url.as_deref()
    }

    async fn get(&self, url: &str) -> Result<bytes::Bytes, TrackerError> {
        trace!("GET {}", url);
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?)
    }

    async fn send_announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = announce_url(&self.url, request);
        parse_announce(&self.get(&url).await?)
    }

    async fn send_scrape(&self, request: &ScrapeRequest) -> Result<ScrapeResponse, TrackerError> {
        let base = self
            .scrape_url
            .as_deref()
            .ok_or(TrackerError::ScrapeUnsupported)?;

        let mut url = base.to_string();
        for (i, info_hash) in request.info_hashes.iter().enumerate() {
            let separator = if i == 0 && !base.contains('?') { '?' } else { '&' };
            url.push(separator);
            url.push_str("info_hash=");
            url.push_str(&url_encode(info_hash));
        }

        parse_scrape(&self.get(&url).await?)
    }
}

impl Tracker for HttpTracker {
    fn url(&self) -> &str {
        &self.url
    }

    fn can_scrape(&self) -> bool {
        self.scrape_url.is_some()
    }

    fn announce<'a>(
        &'a self,
        request: &'a AnnounceRequest,
    ) -> BoxFuture<'a, Result<AnnounceResponse, TrackerError>> {
        self.send_announce(request).boxed()
    }

    fn scrape<'a>(
        &'a self,
        request: &'a ScrapeRequest,
    ) -> BoxFuture<'a, Result<ScrapeResponse, TrackerError>> {
        self.send_scrape(request).boxed()
    }
}

fn announce_url(base: &str, request: &AnnounceRequest) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&key={:08x}&compact=1",
        base,
        separator,
        url_encode(&request.info_hash),
        url_encode(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
        request.key,
    );

    let event = request.event.as_str();
    if !event.is_empty() {
        url.push_str("&event=");
        url.push_str(event);
    }
    if let Some(num_want) = request.num_want {
        url.push_str(&format!("&numwant={}", num_want));
    }
    url
}

/// BEP-48: the scrape URL swaps a trailing `announce` path segment for
/// `scrape`. Trackers without one cannot be scraped.
pub(super) fn scrape_url(announce: &str) -> Option<String> {
    let path_end = announce.find('?').unwrap_or(announce.len());
    let slash = announce[..path_end].rfind('/')?;
    let segment = &announce[slash + 1..path_end];

    let rest = segment.strip_prefix("announce")?;
    Some(format!(
        "{}scrape{}{}",
        &announce[..slash + 1],
        rest,
        &announce[path_end..]
    ))
}

fn to_u32(value: Option<i64>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok())
}

pub(super) fn parse_announce(data: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let reply: AnnounceReply = serde_bencode::from_bytes(data)?;

    if let Some(failure) = reply.failure_reason {
        return Err(TrackerError::Failure(failure));
    }

    let interval = to_u32(reply.interval)
        .ok_or_else(|| TrackerError::InvalidResponse("missing interval".into()))?;

    let mut response = AnnounceResponse::new(interval);
    response.min_interval = to_u32(reply.min_interval);
    response.complete = to_u32(reply.complete);
    response.incomplete = to_u32(reply.incomplete);
    response.warning_message = reply.warning_message;
    response.tracker_id = reply.tracker_id;

    match reply.peers {
        Some(Value::Bytes(compact)) => response.peers = parse_compact_peers(&compact),
        Some(Value::List(list)) => response.peers = list.iter().filter_map(dict_peer).collect(),
        _ => {}
    }
    if let Some(peers6) = reply.peers6 {
        response.peers6 = parse_compact_peers6(&peers6);
    }

    Ok(response)
}

fn dict_peer(value: &Value) -> Option<SocketAddr> {
    let Value::Dict(dict) = value else {
        return None;
    };
    let ip = match dict.get(b"ip".as_slice())? {
        Value::Bytes(ip) => std::str::from_utf8(ip).ok()?.parse().ok()?,
        _ => return None,
    };
    let port = match dict.get(b"port".as_slice())? {
        Value::Int(port) => u16::try_from(*port).ok()?,
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

pub(super) fn parse_scrape(data: &[u8]) -> Result<ScrapeResponse, TrackerError> {
    let reply: ScrapeReply = serde_bencode::from_bytes(data)?;

    if let Some(failure) = reply.failure_reason {
        return Err(TrackerError::Failure(failure));
    }

    let files = reply
        .files
        .into_iter()
        .filter_map(|(info_hash, stats)| {
            Some(ScrapeFile {
                info_hash: info_hash.as_slice().try_into().ok()?,
                complete: u32::try_from(stats.complete).unwrap_or(0),
                incomplete: u32::try_from(stats.incomplete).unwrap_or(0),
                downloaded: u32::try_from(stats.downloaded).unwrap_or(0),
            })
        })
        .collect();

    Ok(ScrapeResponse { files })
}

fn url_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~' {
                format!("{}", b as char)
            } else {
                format!("%{:02X}", b)
            }
        })
        .collect()
}
