use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::engine::{DhtEvent, DhtState};
use super::error::DhtError;
use super::message::{
    DecodeFailure, KrpcError, KrpcMessage, Query, QueryKind, ResponseBody, TransactionId,
};
use super::node::{Node, NodeId};
use super::routing::{AddOutcome, RoutingTable};
use super::store::PeerStore;
use super::tasks::{RefreshBucketTask, ReplaceNodeTask};
use super::token::TokenManager;
use super::transport::DhtTransport;
use crate::constants::{DHT_MAX_PACKET_SIZE, DHT_PEER_STORE_PRUNE_INTERVAL};
use crate::settings::DhtSettings;

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// How a single query attempt ended.
#[derive(Debug)]
pub(crate) enum QueryOutcome {
    Response(ResponseBody),
    Error(KrpcError),
    TimedOut,
    Failed(DhtError),
}

/// Requests from tasks and the engine to the message loop.
pub(crate) enum Command {
    Query {
        node: Node,
        query: Query,
        reply: oneshot::Sender<QueryOutcome>,
    },
    /// Ping an address; the node is added to the table if it answers.
    AddNode { node: Node },
    Closest {
        target: NodeId,
        count: usize,
        reply: oneshot::Sender<Vec<Node>>,
    },
    BucketNodes {
        bucket: usize,
        reply: oneshot::Sender<Vec<Node>>,
    },
    Nodes { reply: oneshot::Sender<Vec<Node>> },
    Replace {
        bucket: usize,
        old: NodeId,
        reply: oneshot::Sender<bool>,
    },
    ReplacementDone { bucket: usize },
    RefreshDone { bucket: usize },
    /// Replies once the new state is visible to watchers and subscribers.
    SetState {
        state: DhtState,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cheap, cloneable access to a running message loop.
#[derive(Clone)]
pub(crate) struct LoopHandle {
    commands: mpsc::Sender<Command>,
    local_id: NodeId,
    settings: Arc<DhtSettings>,
    events: broadcast::Sender<DhtEvent>,
}

impl LoopHandle {
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn settings(&self) -> &DhtSettings {
        &self.settings
    }

    pub fn publish(&self, event: DhtEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DhtEvent> {
        self.events.subscribe()
    }

    pub async fn send(&self, command: Command) -> Result<(), DhtError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DhtError::Shutdown)
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| DhtError::Shutdown)
    }

    /// Sends one query attempt and waits for its outcome.
    pub async fn query(&self, node: Node, query: Query) -> QueryOutcome {
        self.request(|reply| Command::Query { node, query, reply })
            .await
            .unwrap_or_else(QueryOutcome::Failed)
    }

    pub async fn closest(&self, target: NodeId, count: usize) -> Result<Vec<Node>, DhtError> {
        self.request(|reply| Command::Closest {
            target,
            count,
            reply,
        })
        .await
    }

    pub async fn bucket_nodes(&self, bucket: usize) -> Result<Vec<Node>, DhtError> {
        self.request(|reply| Command::BucketNodes { bucket, reply })
            .await
    }

    pub async fn nodes(&self) -> Result<Vec<Node>, DhtError> {
        self.request(|reply| Command::Nodes { reply }).await
    }

    pub async fn node_count(&self) -> Result<usize, DhtError> {
        Ok(self.nodes().await?.len())
    }

    pub async fn replace(&self, bucket: usize, old: NodeId) -> Result<bool, DhtError> {
        self.request(|reply| Command::Replace { bucket, old, reply })
            .await
    }

    pub async fn add_node(&self, node: Node) -> Result<(), DhtError> {
        self.send(Command::AddNode { node }).await
    }

    pub async fn set_state(&self, state: DhtState) -> Result<(), DhtError> {
        self.request(|reply| Command::SetState { state, reply })
            .await
    }

    /// Asks the loop to stop without waiting for channel capacity.
    pub fn try_shutdown(&self) {
        let _ = self.commands.try_send(Command::Shutdown);
    }
}

struct PendingQuery {
    node_id: NodeId,
    addr: SocketAddr,
    kind: QueryKind,
    deadline: Instant,
    reply: Option<oneshot::Sender<QueryOutcome>>,
}

impl PendingQuery {
    fn resolve(self, outcome: QueryOutcome) {
        if let Some(reply) = self.reply {
            // The task may have been dropped; nothing else holds the outcome.
            let _ = reply.send(outcome);
        }
    }
}

/// The single owner of all DHT state.
///
/// Every datagram, query, timeout and table mutation goes through this loop,
/// so the routing table and peer store need no locking. Tasks run as their
/// own futures and reach the loop through a [`LoopHandle`].
pub(crate) struct MessageLoop<T> {
    transport: Arc<T>,
    settings: Arc<DhtSettings>,
    pub(super) table: RoutingTable,
    pub(super) tokens: TokenManager,
    pub(super) store: PeerStore,
    pending: HashMap<TransactionId, PendingQuery>,
    send_queue: VecDeque<(SocketAddr, Bytes)>,
    refreshing: HashSet<usize>,
    next_store_prune: Instant,
    commands: mpsc::WeakSender<Command>,
    events: broadcast::Sender<DhtEvent>,
    state: watch::Sender<DhtState>,
}

impl<T: DhtTransport> MessageLoop<T> {
    /// Builds the loop and the handle that feeds it. The loop stops once every
    /// handle is dropped or [`Command::Shutdown`] arrives.
    pub fn new(
        transport: T,
        local_id: NodeId,
        settings: DhtSettings,
    ) -> (Self, LoopHandle, mpsc::Receiver<Command>, watch::Receiver<DhtState>) {
        let settings = Arc::new(settings);
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(64);
        let (state, state_rx) = watch::channel(DhtState::NotReady);

        let message_loop = Self {
            transport: Arc::new(transport),
            table: RoutingTable::new(local_id),
            tokens: TokenManager::new(settings.token_timeout),
            store: PeerStore::new(
                settings.max_peers_per_torrent,
                settings.max_torrents,
                settings.peer_announce_lifetime,
            ),
            next_store_prune: Instant::now() + DHT_PEER_STORE_PRUNE_INTERVAL,
            settings: Arc::clone(&settings),
            pending: HashMap::new(),
            send_queue: VecDeque::new(),
            refreshing: HashSet::new(),
            commands: tx.downgrade(),
            events: events.clone(),
            state,
        };

        let handle = LoopHandle {
            commands: tx,
            local_id,
            settings,
            events,
        };

        (message_loop, handle, rx, state_rx)
    }

    pub(super) fn local_id(&self) -> NodeId {
        *self.table.local_id()
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let transport = Arc::clone(&self.transport);
        let mut buf = vec![0u8; DHT_MAX_PACKET_SIZE];
        let mut tick = tokio::time::interval(self.settings.maintenance_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            self.flush_send_queue().await;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                result = transport.recv_from(&mut buf) => match result {
                    Ok((n, addr)) => self.handle_datagram(&buf[..n], addr),
                    Err(e) => debug!("DHT socket receive failed: {}", e),
                },
                _ = tick.tick() => self.maintain(),
            }
        }

        for (_, pending) in self.pending.drain() {
            pending.resolve(QueryOutcome::Failed(DhtError::Shutdown));
        }
        self.set_state(DhtState::NotReady);
        debug!("DHT message loop stopped");
    }

    async fn flush_send_queue(&mut self) {
        while let Some((addr, data)) = self.send_queue.pop_front() {
            if let Err(e) = self.transport.send_to(&data, addr).await {
                debug!("Failed to send DHT message to {}: {}", addr, e);
            }
        }
    }

    pub(super) fn enqueue(&mut self, addr: SocketAddr, message: KrpcMessage) {
        match message.encode() {
            Ok(data) => self.send_queue.push_back((addr, data)),
            Err(e) => debug!("Failed to encode DHT message for {}: {}", addr, e),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Query { node, query, reply } => self.send_query(node, query, Some(reply)),
            Command::AddNode { node } => {
                if self.table.find_node(&node.id).is_none() {
                    self.send_query(node, Query::Ping, None);
                }
            }
            Command::Closest {
                target,
                count,
                reply,
            } => {
                let _ = reply.send(self.table.closest(&target, count));
            }
            Command::BucketNodes { bucket, reply } => {
                let nodes = self
                    .table
                    .bucket(bucket)
                    .map(|b| b.nodes_by_last_seen())
                    .unwrap_or_default();
                let _ = reply.send(nodes);
            }
            Command::Nodes { reply } => {
                let _ = reply.send(self.table.nodes().cloned().collect());
            }
            Command::Replace { bucket, old, reply } => {
                let _ = reply.send(self.table.replace(bucket, &old));
            }
            Command::ReplacementDone { bucket } => {
                self.table.clear_replacement(bucket);
            }
            Command::RefreshDone { bucket } => {
                self.refreshing.remove(&bucket);
                self.table.touch_bucket(bucket);
            }
            Command::SetState { state, reply } => {
                self.set_state(state);
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn set_state(&mut self, state: DhtState) {
        if *self.state.borrow() != state {
            self.state.send_replace(state);
            let _ = self.events.send(DhtEvent::StateChanged(state));
        }
    }

    fn next_transaction_id(&self) -> TransactionId {
        loop {
            let id: [u8; 2] = rand::random();
            let tid = Bytes::copy_from_slice(&id);
            if !self.pending.contains_key(&tid) {
                return tid;
            }
        }
    }

    fn send_query(
        &mut self,
        node: Node,
        query: Query,
        reply: Option<oneshot::Sender<QueryOutcome>>,
    ) {
        if self.pending.len() >= self.settings.max_pending_queries {
            if let Some(reply) = reply {
                let _ = reply.send(QueryOutcome::Failed(DhtError::RateLimited));
            }
            return;
        }

        let transaction_id = self.next_transaction_id();
        let kind = query.kind();
        let message = KrpcMessage::query(transaction_id.clone(), self.local_id(), query);

        match message.encode() {
            Ok(data) => {
                trace!("Sending {:?} to {} ({})", kind, node.addr, node.id);
                self.pending.insert(
                    transaction_id,
                    PendingQuery {
                        node_id: node.id,
                        addr: node.addr,
                        kind,
                        deadline: Instant::now() + self.settings.query_timeout,
                        reply,
                    },
                );
                self.send_queue.push_back((node.addr, data));
            }
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(QueryOutcome::Failed(e));
                }
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        match KrpcMessage::decode(data) {
            Ok(KrpcMessage::Query {
                transaction_id,
                sender,
                query,
            }) => self.handle_query(transaction_id, sender, query, from),
            Ok(KrpcMessage::Response {
                transaction_id,
                body,
            }) => self.handle_response(transaction_id, body, from),
            Ok(KrpcMessage::Error {
                transaction_id,
                error,
            }) => self.handle_error(transaction_id, error, from),
            Err(failure) => self.handle_decode_failure(failure, from),
        }
    }

    fn handle_response(
        &mut self,
        transaction_id: TransactionId,
        body: ResponseBody,
        from: SocketAddr,
    ) {
        let Some(pending) = self.pending.remove(&transaction_id) else {
            debug!("Discarding response from {} with unknown transaction id", from);
            return;
        };

        match body.validate_for(pending.kind) {
            Ok(()) => {
                self.observe(body.id, from);
                pending.resolve(QueryOutcome::Response(body));
            }
            Err(e) => {
                debug!("Invalid {:?} response from {}: {}", pending.kind, from, e);
                self.table.mark_failed(&pending.node_id);
                pending.resolve(QueryOutcome::Failed(e));
            }
        }
    }

    fn handle_error(&mut self, transaction_id: TransactionId, error: KrpcError, from: SocketAddr) {
        let Some(pending) = self.pending.remove(&transaction_id) else {
            debug!("Discarding error from {} with unknown transaction id", from);
            return;
        };

        debug!(
            "{:?} query to {} failed with {} {}",
            pending.kind, pending.addr, error.code, error.message
        );
        self.table.mark_seen(&pending.node_id);
        pending.resolve(QueryOutcome::Error(error));
    }

    fn handle_decode_failure(&mut self, failure: DecodeFailure, from: SocketAddr) {
        let Some(transaction_id) = failure.transaction_id else {
            debug!("Failed to parse DHT message from {}: {}", from, failure.error);
            return;
        };

        if failure.is_query {
            debug!("Rejecting malformed query from {}: {}", from, failure.error);
            let reply =
                KrpcMessage::error(transaction_id, failure.code, &failure.error.to_string());
            self.enqueue(from, reply);
            return;
        }

        if let Some(pending) = self.pending.remove(&transaction_id) {
            debug!("Response dictionary invalid from {}: {}", from, failure.error);
            self.table.mark_failed(&pending.node_id);
            pending.resolve(QueryOutcome::Failed(failure.error));
        }
    }

    /// Records that `id` talked to us from `addr`.
    pub(super) fn observe(&mut self, id: NodeId, addr: SocketAddr) {
        let mut node = Node::new(id, addr);
        node.seen();

        if let AddOutcome::BucketFull(bucket) = self.table.add(node.clone()) {
            self.start_replacement(bucket, node);
        }
    }

    fn start_replacement(&mut self, bucket: usize, candidate: Node) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        if !self.table.set_replacement(bucket, candidate) {
            return;
        }

        let handle = self.handle(commands);
        tokio::spawn(async move {
            ReplaceNodeTask::new(bucket).execute(&handle).await;
        });
    }

    fn handle(&self, commands: mpsc::Sender<Command>) -> LoopHandle {
        LoopHandle {
            commands,
            local_id: self.local_id(),
            settings: Arc::clone(&self.settings),
            events: self.events.clone(),
        }
    }

    fn maintain(&mut self) {
        let now = Instant::now();
        let expired: Vec<TransactionId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(tid, _)| tid.clone())
            .collect();

        for tid in expired {
            if let Some(pending) = self.pending.remove(&tid) {
                trace!("{:?} query to {} timed out", pending.kind, pending.addr);
                self.table.mark_failed(&pending.node_id);
                pending.resolve(QueryOutcome::TimedOut);
            }
        }

        if now >= self.next_store_prune {
            self.store.prune();
            self.next_store_prune = now + DHT_PEER_STORE_PRUNE_INTERVAL;
        }

        for bucket in self.table.stale_buckets(self.settings.bucket_refresh_interval) {
            if !self.refreshing.insert(bucket) {
                continue;
            }
            let Some(commands) = self.commands.upgrade() else {
                return;
            };
            let handle = self.handle(commands);
            tokio::spawn(async move {
                RefreshBucketTask::new(bucket).execute(&handle).await;
            });
        }
    }
}
