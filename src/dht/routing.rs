use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use super::node::{Node, NodeId};
use crate::constants::{DHT_BUCKET_SIZE, DHT_NUM_BUCKETS};

/// Result of inserting a node into the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The node was new and its bucket had room.
    Added,
    /// The node was already known; its address and liveness were refreshed.
    Updated,
    /// The owning bucket is full. The node may only enter through replacement.
    BucketFull(usize),
    /// The node carries our own id.
    Rejected,
}

/// A Kademlia bucket: up to K nodes sharing the same id prefix with us.
#[derive(Debug)]
pub struct Bucket {
    nodes: Vec<Node>,
    replacement: Option<Node>,
    last_changed: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            nodes: Vec::with_capacity(DHT_BUCKET_SIZE),
            replacement: None,
            last_changed: Instant::now(),
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= DHT_BUCKET_SIZE
    }

    /// Candidate waiting to take the place of a stale node.
    pub fn replacement(&self) -> Option<&Node> {
        self.replacement.as_ref()
    }

    pub fn last_changed(&self) -> Instant {
        self.last_changed
    }

    /// Snapshot of the nodes ordered by `last_seen`, never-seen nodes first.
    pub fn nodes_by_last_seen(&self) -> Vec<Node> {
        let mut nodes = self.nodes.clone();
        nodes.sort_by_key(|n| n.last_seen);
        nodes
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    fn changed(&mut self) {
        self.last_changed = Instant::now();
    }
}

/// The local node's view of the DHT: one bucket per shared-prefix length.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        let buckets = (0..DHT_NUM_BUCKETS).map(|_| Bucket::new()).collect();
        Self { local_id, buckets }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Index of the bucket that owns `id`, or `None` for our own id.
    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        if id == &self.local_id {
            return None;
        }
        Some(self.local_id.bucket_index(id))
    }

    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index)
    }

    pub fn add(&mut self, node: Node) -> AddOutcome {
        let Some(index) = self.bucket_index(&node.id) else {
            return AddOutcome::Rejected;
        };
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.position(&node.id) {
            let existing = &mut bucket.nodes[pos];
            existing.addr = node.addr;
            if node.last_seen.is_some() {
                existing.seen();
            }
            bucket.changed();
            return AddOutcome::Updated;
        }

        if bucket.is_full() {
            return AddOutcome::BucketFull(index);
        }

        trace!("Adding node {} to bucket {}", node.id, index);
        bucket.nodes.push(node);
        bucket.changed();
        AddOutcome::Added
    }

    /// Parks `node` as the replacement candidate of a bucket.
    ///
    /// Returns false if the bucket already has a candidate.
    pub fn set_replacement(&mut self, index: usize, node: Node) -> bool {
        match self.buckets.get_mut(index) {
            Some(bucket) if bucket.replacement.is_none() => {
                bucket.replacement = Some(node);
                true
            }
            _ => false,
        }
    }

    pub fn clear_replacement(&mut self, index: usize) -> Option<Node> {
        self.buckets.get_mut(index)?.replacement.take()
    }

    /// Swaps `old` for the bucket's replacement candidate.
    ///
    /// Nothing happens unless `old` is still present and a candidate exists.
    pub fn replace(&mut self, index: usize, old: &NodeId) -> bool {
        let Some(bucket) = self.buckets.get_mut(index) else {
            return false;
        };
        let Some(pos) = bucket.position(old) else {
            return false;
        };
        let Some(candidate) = bucket.replacement.take() else {
            return false;
        };

        trace!("Replacing node {} with {} in bucket {}", old, candidate.id, index);
        bucket.nodes[pos] = candidate;
        bucket.changed();
        true
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let index = self.bucket_index(id)?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.position(id)?;
        let removed = bucket.nodes.remove(pos);

        if let Some(replacement) = bucket.replacement.take() {
            bucket.nodes.push(replacement);
        }
        bucket.changed();

        Some(removed)
    }

    pub fn mark_seen(&mut self, id: &NodeId) -> bool {
        match self.find_node_mut(id) {
            Some(node) => {
                node.seen();
                true
            }
            None => false,
        }
    }

    /// Counts a failed query against a node. Bad nodes are evicted and the
    /// bucket's replacement candidate, if any, takes their place.
    pub fn mark_failed(&mut self, id: &NodeId) {
        let is_bad = match self.find_node_mut(id) {
            Some(node) => {
                node.failed();
                node.is_bad()
            }
            None => return,
        };

        if is_bad {
            trace!("Evicting bad node {}", id);
            self.remove(id);
        }
    }

    pub fn find_node(&self, id: &NodeId) -> Option<&Node> {
        let index = self.bucket_index(id)?;
        self.buckets[index].nodes.iter().find(|n| &n.id == id)
    }

    fn find_node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        let index = self.bucket_index(id)?;
        self.buckets[index].nodes.iter_mut().find(|n| &n.id == id)
    }

    /// Up to `count` non-bad nodes ordered by XOR distance to `target`.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let mut nodes: Vec<(NodeId, &Node)> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| !n.is_bad())
            .map(|n| (n.id.xor(target), n))
            .collect();

        nodes.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        nodes.truncate(count);
        nodes.into_iter().map(|(_, n)| n.clone()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|b| b.nodes.iter())
    }

    /// Non-empty buckets that have not changed for `refresh_interval`.
    pub fn stale_buckets(&self, refresh_interval: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && b.last_changed.elapsed() >= refresh_interval)
            .map(|(i, _)| i)
            .collect()
    }

    /// Marks a bucket as freshly maintained.
    pub fn touch_bucket(&mut self, index: usize) {
        if let Some(bucket) = self.buckets.get_mut(index) {
            bucket.changed();
        }
    }
}
