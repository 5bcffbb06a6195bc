use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng as _;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use super::error::TrackerError;
use super::response::{
    parse_compact_peers, AnnounceRequest, AnnounceResponse, ScrapeFile, ScrapeRequest,
    ScrapeResponse,
};
use super::Tracker;
use crate::constants::{
    TRACKER_REQUEST_TIMEOUT, UDP_ACTION_ANNOUNCE, UDP_ACTION_CONNECT, UDP_ACTION_ERROR,
    UDP_ACTION_SCRAPE, UDP_CONNECTION_ID_LIFETIME, UDP_TRACKER_MAX_PACKET_SIZE,
    UDP_TRACKER_MAX_RETRIES, UDP_TRACKER_PROTOCOL_ID,
};

/// A UDP tracker (BEP-15).
///
/// The socket is bound on first use. Connection ids are cached for their
/// one minute lifetime and renewed transparently.
pub struct UdpTracker {
    url: String,
    host: String,
    socket: OnceCell<UdpSocket>,
    // Transactions run one at a time so replies cannot be mixed up.
    exchange: AsyncMutex<()>,
    connection: Mutex<Option<(u64, Instant)>>,
    first_timeout: Duration,
}

impl UdpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        Self::with_timeout(url, TRACKER_REQUEST_TIMEOUT)
    }

    /// Spreads `budget` over the doubling retries of one exchange, so a
    /// single lost datagram is resent well before the budget runs out.
    pub fn with_timeout(url: &str, budget: Duration) -> Result<Self, TrackerError> {
        let slots = (1u32 << UDP_TRACKER_MAX_RETRIES) - 1;
        Ok(Self {
            url: url.to_string(),
            host: parse_udp_url(url)?,
            socket: OnceCell::new(),
            exchange: AsyncMutex::new(()),
            connection: Mutex::new(None),
            first_timeout: budget / slots,
        })
    }

    async fn socket(&self) -> Result<&UdpSocket, TrackerError> {
        self.socket
            .get_or_try_init(|| async {
                let addr = lookup_host(self.host.as_str())
                    .await?
                    .next()
                    .ok_or_else(|| TrackerError::InvalidUrl(self.url.clone()))?;
                let bind: SocketAddr = if addr.is_ipv4() {
                    ([0u8; 4], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(addr).await?;
                debug!("UDP tracker {} resolved to {}", self.url, addr);
                Ok::<_, TrackerError>(socket)
            })
            .await
    }

    async fn connection_id(&self, socket: &UdpSocket) -> Result<u64, TrackerError> {
        if let Some((id, obtained)) = *self.connection.lock() {
            if obtained.elapsed() < UDP_CONNECTION_ID_LIFETIME {
                return Ok(id);
            }
        }

        let transaction_id: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&UDP_TRACKER_PROTOCOL_ID.to_be_bytes());
        request.extend_from_slice(&UDP_ACTION_CONNECT.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());

        let response = self.send_and_receive(socket, &request, transaction_id, 16).await?;
        expect_action(&response, UDP_ACTION_CONNECT)?;

        let id = read_u64(&response, 8);
        *self.connection.lock() = Some((id, Instant::now()));
        trace!("UDP tracker {} issued connection id {:x}", self.url, id);
        Ok(id)
    }

    async fn send_announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let _exchange = self.exchange.lock().await;
        let socket = self.socket().await?;
        let connection_id = self.connection_id(socket).await?;
        let transaction_id: u32 = rand::rng().random();
        let num_want = request.num_want.map_or(-1, |n| i32::try_from(n).unwrap_or(i32::MAX));

        let mut packet = Vec::with_capacity(98);
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&UDP_ACTION_ANNOUNCE.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(&request.info_hash);
        packet.extend_from_slice(&request.peer_id);
        packet.extend_from_slice(&request.downloaded.to_be_bytes());
        packet.extend_from_slice(&request.left.to_be_bytes());
        packet.extend_from_slice(&request.uploaded.to_be_bytes());
        packet.extend_from_slice(&request.event.as_udp_id().to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // IP address (0 = sender)
        packet.extend_from_slice(&request.key.to_be_bytes());
        packet.extend_from_slice(&num_want.to_be_bytes());
        packet.extend_from_slice(&request.port.to_be_bytes());

        let response = self.send_and_receive(socket, &packet, transaction_id, 20).await?;
        expect_action(&response, UDP_ACTION_ANNOUNCE)?;

        let mut result = AnnounceResponse::new(read_u32(&response, 8));
        result.incomplete = Some(read_u32(&response, 12));
        result.complete = Some(read_u32(&response, 16));
        result.peers = parse_compact_peers(&response[20..]);
        Ok(result)
    }

    async fn send_scrape(&self, request: &ScrapeRequest) -> Result<ScrapeResponse, TrackerError> {
        let _exchange = self.exchange.lock().await;
        let socket = self.socket().await?;
        let connection_id = self.connection_id(socket).await?;
        let transaction_id: u32 = rand::rng().random();

        let mut packet = Vec::with_capacity(16 + 20 * request.info_hashes.len());
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&UDP_ACTION_SCRAPE.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        for info_hash in &request.info_hashes {
            packet.extend_from_slice(info_hash);
        }

        let response = self.send_and_receive(socket, &packet, transaction_id, 8).await?;
        expect_action(&response, UDP_ACTION_SCRAPE)?;

        let files = request
            .info_hashes
            .iter()
            .zip(response[8..].chunks_exact(12))
            .map(|(info_hash, stats)| ScrapeFile {
                info_hash: *info_hash,
                complete: read_u32(stats, 0),
                downloaded: read_u32(stats, 4),
                incomplete: read_u32(stats, 8),
            })
            .collect();

        Ok(ScrapeResponse { files })
    }

    /// Sends `request` and waits for the reply carrying `transaction_id`,
    /// doubling the wait after every silent attempt.
    async fn send_and_receive(
        &self,
        socket: &UdpSocket,
        request: &[u8],
        transaction_id: u32,
        min_response_size: usize,
    ) -> Result<Vec<u8>, TrackerError> {
        let mut buf = vec![0u8; UDP_TRACKER_MAX_PACKET_SIZE];

        for attempt in 0..UDP_TRACKER_MAX_RETRIES {
            if attempt > 0 {
                trace!("Resending to UDP tracker {} (attempt {})", self.url, attempt + 1);
            }
            socket.send(request).await?;
            let deadline = Instant::now() + self.first_timeout * (1 << attempt);

            loop {
                let n = match timeout_at(deadline, socket.recv(&mut buf)).await {
                    Ok(result) => result?,
                    Err(_) => break,
                };
                if n < 8 || read_u32(&buf, 4) != transaction_id {
                    trace!("Ignoring stray UDP tracker datagram");
                    continue;
                }
                if read_u32(&buf, 0) == UDP_ACTION_ERROR {
                    let message = String::from_utf8_lossy(&buf[8..n]).into_owned();
                    return Err(TrackerError::Failure(message));
                }
                if n < min_response_size {
                    return Err(TrackerError::InvalidResponse("response too short".into()));
                }
                buf.truncate(n);
                return Ok(buf);
            }
        }

        Err(TrackerError::Timeout)
    }
}

impl Tracker for UdpTracker {
    fn url(&self) -> &str {
        &self.url
    }

    fn can_scrape(&self) -> bool {
        true
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

fn expect_action(response: &[u8], action: u32) -> Result<(), TrackerError> {
    if read_u32(response, 0) != action {
        return Err(TrackerError::InvalidResponse(format!(
            "expected action {}, got {}",
            action,
            read_u32(response, 0)
        )));
    }
    Ok(())
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// `udp://host:port/path` to `host:port`.
pub(super) fn parse_udp_url(url: &str) -> Result<String, TrackerError> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;

    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    let has_port = authority
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());

    if !has_port {
        return Err(TrackerError::InvalidUrl(url.to_string()));
    }
    Ok(authority.to_string())
}
