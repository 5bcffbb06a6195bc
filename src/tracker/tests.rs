use super::http::{parse_announce, parse_scrape, scrape_url};
use super::udp::parse_udp_url;
use super::*;
use crate::settings::TierSettings;
use futures::FutureExt;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[derive(Clone)]
enum Behaviour {
    Respond(Vec<SocketAddr>),
    Fail,
    Hang,
}

struct MockTracker {
    url: String,
    behaviour: Mutex<Behaviour>,
    events: Mutex<Vec<TrackerEvent>>,
    scrapes: AtomicUsize,
}

impl MockTracker {
    fn new(url: &str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            behaviour: Mutex::new(behaviour),
            events: Mutex::new(Vec::new()),
            scrapes: AtomicUsize::new(0),
        })
    }

    fn set(&self, behaviour: Behaviour) {
        *self.behaviour.lock() = behaviour;
    }

    fn events(&self) -> Vec<TrackerEvent> {
        self.events.lock().clone()
    }
}

impl Tracker for MockTracker {
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
        async move {
            self.events.lock().push(request.event);
            let behaviour = self.behaviour.lock().clone();
            match behaviour {
                Behaviour::Respond(peers) => {
                    let mut response = AnnounceResponse::new(1800);
                    response.min_interval = Some(60);
                    response.peers = peers;
                    Ok(response)
                }
                Behaviour::Fail => Err(TrackerError::Failure("unavailable".into())),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(TrackerError::Timeout)
                }
            }
        }
        .boxed()
    }

    fn scrape<'a>(
        &'a self,
        request: &'a ScrapeRequest,
    ) -> BoxFuture<'a, Result<ScrapeResponse, TrackerError>> {
        async move {
            self.scrapes.fetch_add(1, Ordering::Relaxed);
            let files = request
                .info_hashes
                .iter()
                .map(|info_hash| ScrapeFile {
                    info_hash: *info_hash,
                    complete: 4,
                    incomplete: 2,
                    downloaded: 9,
                })
                .collect();
            Ok(ScrapeResponse { files })
        }
        .boxed()
    }
}

fn peers(count: u8) -> Vec<SocketAddr> {
    (1..=count)
        .map(|i| SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)), 6881))
        .collect()
}

fn tier_of(trackers: &[&Arc<MockTracker>]) -> TrackerTier {
    let trackers = trackers
        .iter()
        .map(|t| Arc::clone(*t) as Arc<dyn Tracker>)
        .collect();
    TrackerTier::new(trackers, TierSettings::default())
}

fn request() -> AnnounceRequest {
    AnnounceRequest::new([1u8; 20], [2u8; 20], 6881)
}

#[test]
fn test_tracker_event() {
    assert_eq!(TrackerEvent::Started.as_str(), "started");
    assert_eq!(TrackerEvent::Stopped.as_str(), "stopped");
    assert_eq!(TrackerEvent::Completed.as_str(), "completed");
    assert_eq!(TrackerEvent::None.as_str(), "");

    assert_eq!(TrackerEvent::None.as_udp_id(), 0);
    assert_eq!(TrackerEvent::Completed.as_udp_id(), 1);
    assert_eq!(TrackerEvent::Started.as_udp_id(), 2);
    assert_eq!(TrackerEvent::Stopped.as_udp_id(), 3);
}

#[test]
fn test_parse_compact_peers() {
    let data = [
        192, 168, 1, 1, 0x1A, 0xE1, // 192.168.1.1:6881
        10, 0, 0, 1, 0x1A, 0xE1, // 10.0.0.1:6881
        10, 0, 0, // trailing garbage
    ];

    let peers = parse_compact_peers(&data);
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0], "192.168.1.1:6881".parse().unwrap());
}

#[test]
fn test_parse_compact_announce() {
    let mut data = b"d8:completei10e10:incompletei5e8:intervali1800e12:min intervali60e5:peers12:".to_vec();
    data.extend_from_slice(&[192, 168, 1, 1, 0x1A, 0xE1, 10, 0, 0, 1, 0x1A, 0xE2]);
    data.push(b'e');

    let response = parse_announce(&data).unwrap();
    assert_eq!(response.interval, 1800);
    assert_eq!(response.min_interval, Some(60));
    assert_eq!(response.complete, Some(10));
    assert_eq!(response.incomplete, Some(5));
    assert_eq!(response.peers.len(), 2);
    assert_eq!(response.peers[1], "10.0.0.1:6882".parse().unwrap());
}

#[test]
fn test_parse_dictionary_peers() {
    let data = b"d8:intervali900e5:peersld2:ip8:10.0.0.14:porti6881eeee";

    let response = parse_announce(data).unwrap();
    assert_eq!(response.interval, 900);
    assert_eq!(response.peers, vec!["10.0.0.1:6881".parse().unwrap()]);
}

#[test]
fn test_parse_failure_reason() {
    let data = b"d14:failure reason12:unregisterede";
    match parse_announce(data) {
        Err(TrackerError::Failure(reason)) => assert_eq!(reason, "unregistered"),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn test_parse_scrape() {
    let mut data = b"d5:filesd20:".to_vec();
    data.extend_from_slice(&[7u8; 20]);
    data.extend_from_slice(b"d8:completei5e10:downloadedi50e10:incompletei3eeee");

    let response = parse_scrape(&data).unwrap();
    let file = response.file(&[7u8; 20]).unwrap();
    assert_eq!(file.complete, 5);
    assert_eq!(file.downloaded, 50);
    assert_eq!(file.incomplete, 3);
}

#[test]
fn test_scrape_url() {
    assert_eq!(
        scrape_url("http://t.example/announce").as_deref(),
        Some("http://t.example/scrape")
    );
    assert_eq!(
        scrape_url("http://t.example/x/announce.php?passkey=1").as_deref(),
        Some("http://t.example/x/scrape.php?passkey=1")
    );
    assert_eq!(scrape_url("http://t.example/a"), None);
}

#[test]
fn test_tracker_urls() {
    assert_eq!(
        parse_udp_url("udp://tracker.example:6969/announce").unwrap(),
        "tracker.example:6969"
    );
    assert!(parse_udp_url("udp://tracker.example/announce").is_err());
    assert!(HttpTracker::new("ftp://tracker.example.com").is_err());

    assert!(matches!(
        tracker_from_url("wss://tracker.example"),
        Err(TrackerError::UnsupportedProtocol(_))
    ));
    let tracker = tracker_from_url("udp://tracker.example:6969").unwrap();
    assert_eq!(tracker.url(), "udp://tracker.example:6969");
}

#[tokio::test(start_paused = true)]
async fn test_two_silent_trackers_then_success() {
    let a = MockTracker::new("a", Behaviour::Hang);
    let b = MockTracker::new("b", Behaviour::Hang);
    let c = MockTracker::new("c", Behaviour::Respond(peers(5)));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut tier = tier_of(&[&a, &b, &c]).with_updates(tx);

    let outcome = tier.announce(&request()).await;
    match outcome {
        TierAnnounce::Succeeded(response) => assert_eq!(response.peers.len(), 5),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(tier.last_announce_succeeded());
    assert_eq!(tier.active_index(), 2);
    assert_eq!(tier.active_tracker().unwrap().url(), "c");

    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    assert_eq!(updates.len(), 3);
    for (update, expected) in updates.iter().zip(["a", "b", "c"]) {
        match update {
            TrackerUpdate::Announce { url, result, .. } => {
                assert_eq!(url, expected);
                assert_eq!(result.is_ok(), expected == "c");
            }
            other => panic!("unexpected update {:?}", other),
        }
    }
    assert_eq!(tier.status("a").unwrap().state, TrackerState::Failed);
    assert_eq!(tier.status("c").unwrap().state, TrackerState::Working);
}

#[tokio::test(start_paused = true)]
async fn test_failover_and_total_failure() {
    let a = MockTracker::new("a", Behaviour::Fail);
    let b = MockTracker::new("b", Behaviour::Respond(peers(1)));
    let c = MockTracker::new("c", Behaviour::Respond(peers(1)));
    let mut tier = tier_of(&[&a, &b, &c]);

    assert!(matches!(
        tier.announce(&request()).await,
        TierAnnounce::Succeeded(_)
    ));
    assert_eq!(tier.active_index(), 1);
    assert!(c.events().is_empty());

    for tracker in [&a, &b, &c] {
        tracker.set(Behaviour::Fail);
    }
    let completed = request().with_event(TrackerEvent::Completed);
    assert!(matches!(tier.announce(&completed).await, TierAnnounce::Failed));
    assert!(!tier.last_announce_succeeded());
    assert_eq!(tier.active_index(), 1);

    // Round robin starts at the active tracker.
    assert_eq!(b.events().len(), 2);
    assert_eq!(c.events(), vec![TrackerEvent::Completed]);
    assert_eq!(a.events().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_started_is_sent_once() {
    let a = MockTracker::new("a", Behaviour::Respond(peers(1)));
    let mut tier = tier_of(&[&a]);

    assert!(matches!(
        tier.announce(&request()).await,
        TierAnnounce::Succeeded(_)
    ));
    assert!(tier.sent_started_event());
    assert!(matches!(tier.announce(&request()).await, TierAnnounce::Skipped));

    tokio::time::advance(Duration::from_secs(1800)).await;
    tier.announce(&request()).await;

    let started = request().with_event(TrackerEvent::Started);
    tier.announce(&started).await;

    assert_eq!(
        a.events(),
        vec![TrackerEvent::Started, TrackerEvent::None, TrackerEvent::None]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stopped_rearms_started() {
    let a = MockTracker::new("a", Behaviour::Respond(peers(1)));
    let mut tier = tier_of(&[&a]);

    tier.announce(&request()).await;
    let stopped = request().with_event(TrackerEvent::Stopped);
    tier.announce(&stopped).await;
    assert!(!tier.sent_started_event());

    tokio::time::advance(Duration::from_secs(1800)).await;
    tier.announce(&request()).await;

    assert_eq!(
        a.events(),
        vec![
            TrackerEvent::Started,
            TrackerEvent::Stopped,
            TrackerEvent::Started
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_tier_waits_min_interval() {
    let a = MockTracker::new("a", Behaviour::Fail);
    let mut tier = tier_of(&[&a]);

    assert!(matches!(tier.announce(&request()).await, TierAnnounce::Failed));
    assert!(!tier.can_announce(TrackerEvent::None));
    assert!(matches!(tier.announce(&request()).await, TierAnnounce::Skipped));

    tokio::time::advance(TierSettings::default().default_min_update_interval).await;
    assert!(tier.can_announce(TrackerEvent::None));
    assert!(matches!(tier.announce(&request()).await, TierAnnounce::Failed));
    assert_eq!(a.events().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_with_and_without_tracker() {
    let a = MockTracker::new("a", Behaviour::Fail);
    let b = MockTracker::new("b", Behaviour::Fail);
    let c = MockTracker::new("c", Behaviour::Respond(peers(1)));
    let mut tier = tier_of(&[&a, &b, &c]);
    tier.announce(&request()).await;
    assert_eq!(tier.active_index(), 2);

    let d = MockTracker::new("d", Behaviour::Fail);
    let grown = tier.with_tracker(d as Arc<dyn Tracker>);
    assert_eq!(grown.len(), 4);
    assert_eq!(tier.len(), 3);
    assert!(grown.sent_started_event());

    let shrunk = tier.without_tracker("b");
    assert_eq!(shrunk.len(), 2);
    assert_eq!(shrunk.active_tracker().unwrap().url(), "c");

    let without_active = shrunk.without_tracker("c");
    assert_eq!(without_active.len(), 1);
    assert_eq!(without_active.active_index(), 0);

    let empty = without_active.without_tracker("a");
    assert!(empty.is_empty());
    assert!(empty.active_tracker().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_scrape_is_rate_limited() {
    let a = MockTracker::new("a", Behaviour::Respond(peers(1)));
    let mut tier = tier_of(&[&a]);
    let scrape = ScrapeRequest {
        info_hashes: vec![[1u8; 20]],
    };

    let response = tier.scrape(&scrape).await.unwrap();
    assert_eq!(response.files.len(), 1);
    assert!(tier.last_scrape_succeeded());
    assert_eq!(tier.status("a").unwrap().downloaded, Some(9));

    assert!(tier.scrape(&scrape).await.is_none());
    tokio::time::advance(TierSettings::default().default_min_update_interval).await;
    assert!(tier.scrape(&scrape).await.is_some());
    assert_eq!(a.scrapes.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn test_manager_announces_all_tiers() {
    let a = MockTracker::new("a", Behaviour::Respond(peers(3)));
    let b = MockTracker::new("b", Behaviour::Respond(peers(5)));
    let mut manager = TrackerManager::new(TierSettings::default());
    manager.add_tier(vec![a.clone() as Arc<dyn Tracker>]);
    manager.add_tier(vec![b.clone() as Arc<dyn Tracker>]);
    manager.add_tier(Vec::new());
    assert_eq!(manager.tiers().len(), 2);

    let found = manager.announce(&request()).await;
    assert_eq!(found.len(), 5);
    assert_eq!(a.events(), vec![TrackerEvent::Started]);
    assert_eq!(b.events(), vec![TrackerEvent::Started]);
}

#[tokio::test]
async fn test_manager_tracker_list() {
    let announce_list = vec![
        vec![
            "http://one.example/announce".to_string(),
            "wss://two.example".to_string(),
        ],
        vec!["udp://three.example:6969".to_string()],
    ];
    let mut manager = TrackerManager::from_announce_list(&announce_list, TierSettings::default());
    assert_eq!(manager.tiers().len(), 2);
    assert_eq!(manager.tiers()[0].len(), 1);

    manager.add_tracker(1, "udp://four.example:6969").unwrap();
    assert_eq!(manager.tiers()[1].len(), 2);
    assert!(manager.add_tracker(0, "wss://five.example").is_err());

    assert!(manager.remove_tracker("http://one.example/announce"));
    assert_eq!(manager.tiers().len(), 1);
    assert!(!manager.remove_tracker("http://one.example/announce"));
}

/// A UDP tracker on localhost that ignores the first `skip` datagrams and
/// answers announces with `peers`. Returns the count of datagrams received.
fn spawn_udp_tracker(
    server: UdpSocket,
    skip: usize,
    peers: Vec<SocketAddr>,
) -> Arc<AtomicUsize> {
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            if counter.fetch_add(1, Ordering::SeqCst) < skip {
                continue;
            }

            let action = u32::from_be_bytes(buf[8..12].try_into().unwrap());
            let mut reply = action.to_be_bytes().to_vec();
            reply.extend_from_slice(&buf[12..16]);
            match action {
                0 => reply.extend_from_slice(&0x1234_5678u64.to_be_bytes()),
                1 => {
                    reply.extend_from_slice(&1800u32.to_be_bytes());
                    reply.extend_from_slice(&0u32.to_be_bytes());
                    reply.extend_from_slice(&(peers.len() as u32).to_be_bytes());
                    for peer in &peers {
                        if let SocketAddr::V4(v4) = peer {
                            reply.extend_from_slice(&v4.ip().octets());
                            reply.extend_from_slice(&v4.port().to_be_bytes());
                        }
                    }
                }
                _ => continue,
            }
            server.send_to(&reply, from).await.unwrap();
        }
    });

    received
}

#[tokio::test]
async fn test_udp_resends_lost_connect_within_tier_timeout() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let url = format!("udp://{}", server.local_addr().unwrap());
    let received = spawn_udp_tracker(server, 1, peers(3));

    let settings = TierSettings {
        request_timeout: Duration::from_millis(700),
        ..TierSettings::default()
    };
    let mut manager = TrackerManager::new(settings);
    manager.add_tracker(0, &url).unwrap();

    let found = manager.announce(&request()).await;
    assert_eq!(found, peers(3));
    assert!(manager.tiers()[0].last_announce_succeeded());
    // lost connect, resent connect, announce
    assert_eq!(received.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_udp_announce_with_many_peers() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let url = format!("udp://{}", server.local_addr().unwrap());
    let many: Vec<SocketAddr> = (0..400u16)
        .map(|i| {
            let ip = Ipv4Addr::new(10, 1, (i >> 8) as u8, i as u8);
            SocketAddr::new(IpAddr::V4(ip), 6881)
        })
        .collect();
    spawn_udp_tracker(server, 0, many.clone());

    let tracker = UdpTracker::new(&url).unwrap();
    let response = tracker.announce(&request()).await.unwrap();
    assert_eq!(response.interval, 1800);
    assert_eq!(response.peers, many);
}
