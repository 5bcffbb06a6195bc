use super::store::PeerStore;
use super::tasks::ClosestNodes;
use super::*;
use crate::constants::{DHT_BUCKET_SIZE, DHT_QUERY_ATTEMPTS};
use crate::settings::DhtSettings;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Datagram = (Vec<u8>, SocketAddr);

/// A lossless datagram network living in memory.
#[derive(Clone)]
struct MemoryNetwork {
    sockets: Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>>,
    next_port: Arc<AtomicU16>,
}

impl MemoryNetwork {
    fn new() -> Self {
        Self {
            sockets: Arc::new(Mutex::new(HashMap::new())),
            next_port: Arc::new(AtomicU16::new(10000)),
        }
    }

    fn bind(&self) -> MemorySocket {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.lock().insert(addr, tx);

        MemorySocket {
            addr,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }
}

struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl DhtTransport for MemorySocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let peer = self.network.sockets.lock().get(&target).cloned();
        if let Some(peer) = peer {
            let _ = peer.send((buf.to_vec(), self.addr));
        }
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some((data, from)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

fn id(first: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[0] = first;
    NodeId(bytes)
}

fn id2(first: u8, second: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[0] = first;
    bytes[1] = second;
    NodeId(bytes)
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
}

fn seen_node(id: NodeId, port: u16) -> Node {
    let mut node = Node::new(id, addr(port));
    node.seen();
    node
}

fn test_settings() -> DhtSettings {
    DhtSettings {
        bootstrap_routers: Vec::new(),
        ..DhtSettings::default()
    }
}

fn spawn_engine(network: &MemoryNetwork, local_id: NodeId) -> DhtEngine {
    DhtEngine::with_transport(network.bind(), local_id, test_settings()).unwrap()
}

async fn recv(socket: &MemorySocket) -> KrpcMessage {
    let mut buf = vec![0u8; 2048];
    let (n, _) = socket.recv_from(&mut buf).await.unwrap();
    KrpcMessage::decode(&buf[..n]).unwrap()
}

async fn exchange(socket: &MemorySocket, to: SocketAddr, message: &KrpcMessage) -> KrpcMessage {
    socket
        .send_to(&message.encode().unwrap(), to)
        .await
        .unwrap();
    recv(socket).await
}

fn tid(value: &'static [u8]) -> Bytes {
    Bytes::from_static(value)
}

#[test]
fn test_node_id_from_bytes() {
    let bytes = [1u8; 20];
    let id = NodeId::from_bytes(&bytes).unwrap();
    assert_eq!(id.0, bytes);
    assert!(NodeId::from_bytes(&[1u8; 10]).is_err());
}

#[test]
fn test_xor_distance_is_symmetric_with_zero_identity() {
    let a = NodeId::generate();
    let b = NodeId::generate();

    assert_eq!(a.xor(&b), b.xor(&a));
    assert_eq!(a.xor(&a), NodeId::MIN);
    assert_eq!(NodeId::MIN.xor(&NodeId::MAX), NodeId::MAX);
}

#[test]
fn test_node_id_bucket_index() {
    let local = NodeId::MIN;
    assert_eq!(local.bucket_index(&id(0x80)), 0);
    assert_eq!(local.bucket_index(&id(0x01)), 7);
    assert_eq!(local.bucket_index(&id2(0, 0x40)), 9);
}

#[test]
fn test_node_compact() {
    let node = Node::new(NodeId([1u8; 20]), addr(6881));

    let compact = node.to_compact().unwrap();
    assert_eq!(compact.len(), 26);

    let parsed = Node::from_compact(&compact).unwrap();
    assert_eq!(parsed.id, node.id);
    assert_eq!(parsed.addr, node.addr);

    assert!(parse_compact_nodes(&compact[..25]).is_none());
    assert_eq!(parse_compact_nodes(&[]).unwrap().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_node_state_transitions() {
    let mut node = Node::new(id(1), addr(1));
    assert_eq!(node.state(), NodeState::Unknown);

    node.seen();
    assert_eq!(node.state(), NodeState::Good);

    tokio::time::advance(Duration::from_secs(16 * 60)).await;
    assert_eq!(node.state(), NodeState::Questionable);

    for _ in 0..3 {
        node.failed();
    }
    assert_eq!(node.state(), NodeState::Questionable);
    node.failed();
    assert_eq!(node.state(), NodeState::Bad);

    node.seen();
    assert_eq!(node.failed_count, 0);
    assert!(node.is_good());
}

#[test]
fn test_routing_table_rejects_local_id_and_duplicates() {
    let mut table = RoutingTable::new(NodeId::MIN);

    assert_eq!(table.add(seen_node(NodeId::MIN, 1)), AddOutcome::Rejected);
    assert_eq!(table.add(seen_node(id(0x80), 1)), AddOutcome::Added);
    assert_eq!(table.add(seen_node(id(0x80), 2)), AddOutcome::Updated);
    assert_eq!(table.node_count(), 1);
    assert_eq!(table.find_node(&id(0x80)).unwrap().addr, addr(2));
}

#[test]
fn test_closest_of_twenty_nodes() {
    let mut table = RoutingTable::new(NodeId::MIN);
    for i in 1..=20u8 {
        assert_eq!(table.add(seen_node(id2(i, i), u16::from(i))), AddOutcome::Added);
    }

    let target = id2(0x0B, 0xFF);
    let closest = table.closest(&target, 8);

    let mut expected: Vec<NodeId> = (1..=20u8).map(|i| id2(i, i)).collect();
    expected.sort_by_key(|n| n.xor(&target));
    expected.truncate(8);

    let ids: Vec<NodeId> = closest.iter().map(|n| n.id).collect();
    assert_eq!(ids, expected);
    assert_eq!(ids[0], id2(0x0B, 0x0B));
}

#[test]
fn test_closest_skips_bad_nodes() {
    let mut table = RoutingTable::new(NodeId::MIN);
    let mut bad = seen_node(id(0x10), 1);
    for _ in 0..4 {
        bad.failed();
    }
    table.add(bad);
    table.add(seen_node(id(0x20), 2));

    let closest = table.closest(&id(0x10), 8);
    assert_eq!(closest.len(), 1);
    assert_eq!(closest[0].id, id(0x20));
}

#[test]
fn test_full_bucket_and_replacement() {
    let mut table = RoutingTable::new(NodeId::MIN);
    for i in 0..DHT_BUCKET_SIZE as u8 {
        assert_eq!(table.add(seen_node(id(0x80 | i), 1)), AddOutcome::Added);
    }

    let candidate = seen_node(id(0xF0), 2);
    assert_eq!(table.add(candidate.clone()), AddOutcome::BucketFull(0));
    assert!(table.set_replacement(0, candidate));
    assert!(!table.set_replacement(0, seen_node(id(0xF1), 3)));

    assert!(!table.replace(0, &id(0x7F)));
    assert!(table.replace(0, &id(0x80)));
    assert!(table.find_node(&id(0x80)).is_none());
    assert!(table.find_node(&id(0xF0)).is_some());
    assert!(table.bucket(0).unwrap().replacement().is_none());
}

#[test]
fn test_mark_failed_evicts_and_promotes_replacement() {
    let mut table = RoutingTable::new(NodeId::MIN);
    for i in 0..DHT_BUCKET_SIZE as u8 {
        table.add(seen_node(id(0x80 | i), 1));
    }
    table.set_replacement(0, seen_node(id(0xF0), 2));

    for _ in 0..3 {
        table.mark_failed(&id(0x81));
    }
    assert_eq!(table.find_node(&id(0x81)).unwrap().failed_count, 3);

    table.mark_failed(&id(0x81));
    assert!(table.find_node(&id(0x81)).is_none());
    assert!(table.find_node(&id(0xF0)).is_some());
    assert_eq!(table.node_count(), DHT_BUCKET_SIZE);
}

#[tokio::test(start_paused = true)]
async fn test_stale_buckets() {
    let mut table = RoutingTable::new(NodeId::MIN);
    table.add(seen_node(id(0x80), 1));
    table.add(seen_node(id(0x40), 2));

    let interval = Duration::from_secs(15 * 60);
    assert!(table.stale_buckets(interval).is_empty());

    tokio::time::advance(interval).await;
    table.touch_bucket(1);
    assert_eq!(table.stale_buckets(interval), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn test_token_validity_window() {
    let timeout = Duration::from_secs(300);
    let mut tokens = TokenManager::new(timeout);
    let peer = addr(6881);

    let token = tokens.generate_token(&peer);
    assert!(tokens.verify_token(&peer, &token));
    assert!(!tokens.verify_token(&addr(6882), &token));
    assert!(!tokens.verify_token(&peer, b"bogus"));

    tokio::time::advance(timeout + Duration::from_secs(1)).await;
    assert!(tokens.verify_token(&peer, &token));

    tokio::time::advance(timeout).await;
    assert!(!tokens.verify_token(&peer, &token));
}

#[test]
fn test_query_codec() {
    let message = KrpcMessage::query(
        tid(b"aa"),
        id(1),
        Query::AnnouncePeer {
            info_hash: id(2),
            port: 6881,
            implied_port: true,
            token: Bytes::from_static(b"tok"),
        },
    );

    match KrpcMessage::decode(&message.encode().unwrap()).unwrap() {
        KrpcMessage::Query {
            transaction_id,
            sender,
            query,
        } => {
            assert_eq!(transaction_id, tid(b"aa"));
            assert_eq!(sender, id(1));
            assert_eq!(
                query,
                Query::AnnouncePeer {
                    info_hash: id(2),
                    port: 6881,
                    implied_port: true,
                    token: Bytes::from_static(b"tok"),
                }
            );
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[test]
fn test_response_codec() {
    let nodes = vec![Node::new(id(3), addr(1)), Node::new(id(4), addr(2))];
    let body = ResponseBody::new(id(1))
        .with_nodes(&nodes)
        .with_values(vec![addr(7000)])
        .with_token(Bytes::from_static(b"token"));
    let message = KrpcMessage::response(tid(b"bb"), body.clone());

    match KrpcMessage::decode(&message.encode().unwrap()).unwrap() {
        KrpcMessage::Response {
            transaction_id,
            body: decoded,
        } => {
            assert_eq!(transaction_id, tid(b"bb"));
            assert_eq!(decoded, body);
            assert!(decoded.validate_for(QueryKind::GetPeers).is_ok());
        }
        other => panic!("unexpected message {:?}", other),
    }

    let bare = ResponseBody::new(id(1));
    assert!(bare.validate_for(QueryKind::Ping).is_ok());
    assert!(bare.validate_for(QueryKind::FindNode).is_err());
    assert!(bare.validate_for(QueryKind::GetPeers).is_err());
}

#[test]
fn test_error_codec() {
    let message = KrpcMessage::error(tid(b"cc"), ErrorCode::Protocol, "invalid token");

    match KrpcMessage::decode(&message.encode().unwrap()).unwrap() {
        KrpcMessage::Error { error, .. } => {
            assert_eq!(error.code, 203);
            assert_eq!(error.message, "invalid token");
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[test]
fn test_decode_failures_keep_transaction_id() {
    let missing_id = KrpcMessage::decode(b"d1:ade1:q4:ping1:t2:aa1:y1:qe").unwrap_err();
    assert_eq!(missing_id.transaction_id, Some(tid(b"aa")));
    assert!(missing_id.is_query);
    assert_eq!(missing_id.code, ErrorCode::Protocol);

    let unknown = KrpcMessage::decode(
        b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:vote1:t2:ab1:y1:qe",
    )
    .unwrap_err();
    assert_eq!(unknown.transaction_id, Some(tid(b"ab")));
    assert_eq!(unknown.code, ErrorCode::MethodUnknown);

    let bad_nodes = KrpcMessage::decode(
        b"d1:rd2:id20:aaaaaaaaaaaaaaaaaaaa5:nodes3:abce1:t2:ac1:y1:re",
    )
    .unwrap_err();
    assert!(!bad_nodes.is_query);
    assert_eq!(bad_nodes.transaction_id, Some(tid(b"ac")));

    let garbage = KrpcMessage::decode(b"not bencode").unwrap_err();
    assert!(garbage.transaction_id.is_none());
}

#[test]
fn test_closest_nodes_admission() {
    let mut closest = ClosestNodes::new(NodeId::MIN, 2);

    assert!(closest.try_insert(Node::new(id(5), addr(1))));
    assert!(closest.try_insert(Node::new(id(3), addr(2))));
    assert!(!closest.try_insert(Node::new(id(9), addr(3))));
    assert!(!closest.try_insert(Node::new(id(3), addr(2))));

    assert!(closest.try_insert(Node::new(id(4), addr(4))));
    let ids: Vec<NodeId> = closest.nodes().iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![id(3), id(4)]);
    assert_eq!(closest.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_engines_discover_each_other() {
    let network = MemoryNetwork::new();
    let a = spawn_engine(&network, id(0x10));
    let b = spawn_engine(&network, id(0x20));

    let mut events = b.subscribe();
    assert_eq!(b.state(), DhtState::NotReady);

    let count = b.start(&[a.local_addr()]).await.unwrap();
    assert_eq!(count, 1);
    assert_eq!(b.state(), DhtState::Ready);
    assert_eq!(a.node_count().await.unwrap(), 1);
    assert_eq!(a.nodes().await.unwrap()[0].id, id(0x20));

    assert!(matches!(
        events.recv().await.unwrap(),
        DhtEvent::StateChanged(DhtState::Initialising)
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        DhtEvent::StateChanged(DhtState::Ready)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_announce_then_get_peers() {
    let network = MemoryNetwork::new();
    let a = spawn_engine(&network, id(0x10));
    let b = spawn_engine(&network, id(0x20));
    let c = spawn_engine(&network, id(0x30));
    let info_hash = [0x11u8; 20];

    b.start(&[a.local_addr()]).await.unwrap();
    assert_eq!(b.announce(info_hash, 7000).await.unwrap(), 1);

    c.start(&[a.local_addr()]).await.unwrap();
    let mut events = c.subscribe();
    let peers = c.get_peers(info_hash).await.unwrap();

    let expected = SocketAddr::new(b.local_addr().ip(), 7000);
    assert_eq!(peers, vec![expected]);

    match events.recv().await.unwrap() {
        DhtEvent::PeersFound { info_hash: found, peers } => {
            assert_eq!(found, NodeId(info_hash));
            assert_eq!(peers, vec![expected]);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_announce_with_invalid_token_is_rejected() {
    let network = MemoryNetwork::new();
    let engine = spawn_engine(&network, id(0x10));
    let remote = network.bind();
    let info_hash = id(0x11);

    let get_peers = KrpcMessage::query(tid(b"g1"), id(0x20), Query::GetPeers { info_hash });
    let token = match exchange(&remote, engine.local_addr(), &get_peers).await {
        KrpcMessage::Response { body, .. } => {
            assert!(body.values.is_none());
            body.token.unwrap()
        }
        other => panic!("unexpected message {:?}", other),
    };

    let mut forged = token.to_vec();
    forged[0] ^= 0xFF;
    let announce = KrpcMessage::query(
        tid(b"a1"),
        id(0x20),
        Query::AnnouncePeer {
            info_hash,
            port: 7000,
            implied_port: false,
            token: Bytes::from(forged),
        },
    );
    match exchange(&remote, engine.local_addr(), &announce).await {
        KrpcMessage::Error {
            transaction_id,
            error,
        } => {
            assert_eq!(transaction_id, tid(b"a1"));
            assert_eq!(error.code, ErrorCode::Protocol.code());
        }
        other => panic!("unexpected message {:?}", other),
    }

    let get_peers = KrpcMessage::query(tid(b"g2"), id(0x20), Query::GetPeers { info_hash });
    match exchange(&remote, engine.local_addr(), &get_peers).await {
        KrpcMessage::Response { body, .. } => assert!(body.values.is_none()),
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_implied_port_announce() {
    let network = MemoryNetwork::new();
    let engine = spawn_engine(&network, id(0x10));
    let remote = network.bind();
    let info_hash = id(0x11);

    let get_peers = KrpcMessage::query(tid(b"g1"), id(0x20), Query::GetPeers { info_hash });
    let token = match exchange(&remote, engine.local_addr(), &get_peers).await {
        KrpcMessage::Response { body, .. } => body.token.unwrap(),
        other => panic!("unexpected message {:?}", other),
    };

    let announce = KrpcMessage::query(
        tid(b"a1"),
        id(0x20),
        Query::AnnouncePeer {
            info_hash,
            port: 1,
            implied_port: true,
            token,
        },
    );
    assert!(matches!(
        exchange(&remote, engine.local_addr(), &announce).await,
        KrpcMessage::Response { .. }
    ));

    let get_peers = KrpcMessage::query(tid(b"g2"), id(0x20), Query::GetPeers { info_hash });
    match exchange(&remote, engine.local_addr(), &get_peers).await {
        KrpcMessage::Response { body, .. } => {
            assert_eq!(body.values, Some(vec![remote.addr]));
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_malformed_and_unknown_queries_get_errors() {
    let network = MemoryNetwork::new();
    let engine = spawn_engine(&network, id(0x10));
    let remote = network.bind();

    remote
        .send_to(b"d1:ade1:q4:ping1:t2:aa1:y1:qe", engine.local_addr())
        .await
        .unwrap();
    match recv(&remote).await {
        KrpcMessage::Error { error, .. } => assert_eq!(error.code, 203),
        other => panic!("unexpected message {:?}", other),
    }

    remote
        .send_to(
            b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:vote1:t2:ab1:y1:qe",
            engine.local_addr(),
        )
        .await
        .unwrap();
    match recv(&remote).await {
        KrpcMessage::Error {
            transaction_id,
            error,
        } => {
            assert_eq!(transaction_id, tid(b"ab"));
            assert_eq!(error.code, 204);
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_response_with_unknown_transaction_is_discarded() {
    let network = MemoryNetwork::new();
    let engine = spawn_engine(&network, id(0x10));
    let remote = network.bind();

    let stale = KrpcMessage::response(tid(b"zz"), ResponseBody::new(id(0x20)));
    remote
        .send_to(&stale.encode().unwrap(), engine.local_addr())
        .await
        .unwrap();

    let ping = KrpcMessage::query(tid(b"p1"), id(0x30), Query::Ping);
    assert!(matches!(
        exchange(&remote, engine.local_addr(), &ping).await,
        KrpcMessage::Response { .. }
    ));

    let nodes = engine.nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, id(0x30));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_queries_count_failures() {
    let network = MemoryNetwork::new();
    let engine = spawn_engine(&network, id(0x10));
    let silent = network.bind();

    let ping = KrpcMessage::query(tid(b"p1"), id(0x20), Query::Ping);
    exchange(&silent, engine.local_addr(), &ping).await;

    let peers = engine.get_peers([0x21; 20]).await.unwrap();
    assert!(peers.is_empty());

    let nodes = engine.nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].failed_count, DHT_QUERY_ATTEMPTS);
    assert_eq!(nodes[0].state(), NodeState::Good);
}

async fn fill_bucket_zero(network: &MemoryNetwork, engine: &DhtEngine) -> Vec<MemorySocket> {
    let mut sockets = Vec::new();
    for i in 0..DHT_BUCKET_SIZE as u8 {
        let socket = network.bind();
        let ping = KrpcMessage::query(tid(b"p1"), id(0x80 | i), Query::Ping);
        exchange(&socket, engine.local_addr(), &ping).await;
        sockets.push(socket);
    }
    sockets
}

#[tokio::test(start_paused = true)]
async fn test_replacement_respects_grace_period() {
    let network = MemoryNetwork::new();
    let engine = spawn_engine(&network, NodeId::MIN);
    let _bucket = fill_bucket_zero(&network, &engine).await;

    let newcomer = network.bind();
    let ping = KrpcMessage::query(tid(b"p1"), id(0xF0), Query::Ping);
    exchange(&newcomer, engine.local_addr(), &ping).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let nodes = engine.nodes().await.unwrap();
    assert_eq!(nodes.len(), DHT_BUCKET_SIZE);
    assert!(nodes.iter().all(|n| n.id != id(0xF0)));
}

#[tokio::test(start_paused = true)]
async fn test_silent_node_is_replaced() {
    let network = MemoryNetwork::new();
    let engine = spawn_engine(&network, NodeId::MIN);
    let _bucket = fill_bucket_zero(&network, &engine).await;

    tokio::time::advance(Duration::from_secs(4 * 60)).await;

    let newcomer = network.bind();
    let ping = KrpcMessage::query(tid(b"p1"), id(0xF0), Query::Ping);
    exchange(&newcomer, engine.local_addr(), &ping).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let nodes = engine.nodes().await.unwrap();
    assert_eq!(nodes.len(), DHT_BUCKET_SIZE);
    assert!(nodes.iter().any(|n| n.id == id(0xF0)));
    assert!(nodes.iter().all(|n| n.id != id(0x80)));
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_through_single_seed() {
    let network = MemoryNetwork::new();
    let seed = spawn_engine(&network, id2(0x01, 0x01));

    let mut engines = Vec::new();
    for i in 1..=11u8 {
        let engine = spawn_engine(&network, id2(i.wrapping_mul(23), i));
        engine.start(&[seed.local_addr()]).await.unwrap();
        engines.push(engine);
    }

    let last = engines.last().unwrap();
    assert_eq!(last.state(), DhtState::Ready);
    assert!(last.node_count().await.unwrap() >= DHT_BUCKET_SIZE);
    assert!(seed.node_count().await.unwrap() >= DHT_BUCKET_SIZE);

    let saved = last.save_nodes().await.unwrap();
    let restarted = spawn_engine(&network, id2(0xFE, 0xFE));
    let count = restarted.start_from_saved(&saved).await.unwrap();
    assert!(count >= DHT_BUCKET_SIZE);
}

#[tokio::test(start_paused = true)]
async fn test_start_returns_once_ready() {
    let network = MemoryNetwork::new();
    let engine = spawn_engine(&network, id(0x10));
    let mut events = engine.subscribe();

    assert_eq!(engine.start(&[]).await.unwrap(), 0);
    assert_eq!(engine.state(), DhtState::Ready);
    assert!(matches!(
        events.try_recv().unwrap(),
        DhtEvent::StateChanged(DhtState::Initialising)
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        DhtEvent::StateChanged(DhtState::Ready)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_peer_store_forgets_expired_torrents() {
    let mut store = PeerStore::new(10, 10_000, Duration::from_secs(60));
    for i in 0..=255u8 {
        store.add_peer(id2(i, 1), addr(7000));
        store.add_peer(id2(i, 2), addr(7000));
    }
    assert_eq!(store.torrent_count(), 512);

    tokio::time::advance(Duration::from_secs(3600)).await;
    store.add_peer(id(1), addr(7001));
    store.prune();
    assert_eq!(store.torrent_count(), 1);
    assert_eq!(store.get_peers(&id(1), 10), vec![addr(7001)]);
}

#[tokio::test(start_paused = true)]
async fn test_peer_store_caps_torrents() {
    let mut store = PeerStore::new(10, 4, Duration::from_secs(60));
    for i in 0..10u8 {
        store.add_peer(id(i), addr(7000));
    }
    assert_eq!(store.torrent_count(), 4);
    assert_eq!(store.get_peers(&id(3), 10), vec![addr(7000)]);
    assert!(store.get_peers(&id(9), 10).is_empty());

    // Known info hashes still take new peers.
    store.add_peer(id(0), addr(7001));
    assert_eq!(store.get_peers(&id(0), 10), vec![addr(7001), addr(7000)]);

    tokio::time::advance(Duration::from_secs(61)).await;
    store.add_peer(id(9), addr(7002));
    assert_eq!(store.torrent_count(), 1);
    assert_eq!(store.get_peers(&id(9), 10), vec![addr(7002)]);
}

#[tokio::test(start_paused = true)]
async fn test_stale_bucket_refresh_asks_oldest_node_first() {
    let network = MemoryNetwork::new();
    let engine = spawn_engine(&network, NodeId::MIN);

    // Node 0x87 is seen first, 0x80 last.
    let mut sockets = Vec::new();
    for i in (0..DHT_BUCKET_SIZE as u8).rev() {
        let socket = network.bind();
        let ping = KrpcMessage::query(tid(b"p1"), id(0x80 | i), Query::Ping);
        exchange(&socket, engine.local_addr(), &ping).await;
        sockets.push(socket);
        tokio::time::advance(Duration::from_secs(1)).await;
    }

    tokio::time::advance(Duration::from_secs(15 * 60)).await;

    let oldest = &sockets[0];
    let transaction_id = match recv(oldest).await {
        KrpcMessage::Query {
            transaction_id,
            query: Query::FindNode { target },
            ..
        } => {
            assert_eq!(target, id(0x87));
            transaction_id
        }
        other => panic!("unexpected message {:?}", other),
    };
    let body = ResponseBody::new(id(0x87)).with_nodes(&[Node::new(id(0x01), addr(9))]);
    oldest
        .send_to(
            &KrpcMessage::response(transaction_id, body).encode().unwrap(),
            engine.local_addr(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    for socket in &sockets {
        assert!(socket.inbox.lock().await.try_recv().is_err());
    }
}

/// Answers every query with the same node list and a token, counting
/// `get_peers` queries.
fn spawn_responder(socket: MemorySocket, own_id: NodeId, nodes: Vec<Node>) -> Arc<AtomicUsize> {
    let lookups = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&lookups);

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            let Ok(KrpcMessage::Query {
                transaction_id,
                query,
                ..
            }) = KrpcMessage::decode(&buf[..n])
            else {
                continue;
            };
            if matches!(query, Query::GetPeers { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            let body = ResponseBody::new(own_id)
                .with_nodes(&nodes)
                .with_token(Bytes::from_static(b"tok"));
            let reply = KrpcMessage::response(transaction_id, body);
            socket.send_to(&reply.encode().unwrap(), from).await.unwrap();
        }
    });

    lookups
}

#[tokio::test(start_paused = true)]
async fn test_lookup_queries_each_close_node_once() {
    let network = MemoryNetwork::new();
    let engine = spawn_engine(&network, NodeId::MIN);
    let target = id(0x40);

    // Remote d sits at distance d from the target in the first byte.
    let sockets: Vec<(NodeId, MemorySocket)> = (1..=10u8)
        .map(|d| (id(0x40 ^ d), network.bind()))
        .collect();
    let nodes: Vec<Node> = sockets
        .iter()
        .map(|(node_id, socket)| Node::new(*node_id, socket.addr))
        .collect();

    // Only the farthest remote is known up front.
    let (seed_id, seed) = &sockets[9];
    let ping = KrpcMessage::query(tid(b"p1"), *seed_id, Query::Ping);
    exchange(seed, engine.local_addr(), &ping).await;

    let lookups: Vec<Arc<AtomicUsize>> = sockets
        .into_iter()
        .map(|(node_id, socket)| spawn_responder(socket, node_id, nodes.clone()))
        .collect();

    let peers = engine.get_peers(target.0).await.unwrap();
    assert!(peers.is_empty());

    let counts: Vec<usize> = lookups.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    // Distance 9 never makes the eight closest once distances 1 to 8 are known.
    assert_eq!(counts, vec![1, 1, 1, 1, 1, 1, 1, 1, 0, 1]);
}
