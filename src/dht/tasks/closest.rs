use super::super::node::{Node, NodeId};

/// The nodes nearest to a target seen so far during a lookup, nearest first.
#[derive(Debug)]
pub(crate) struct ClosestNodes {
    target: NodeId,
    capacity: usize,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: NodeId, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            nodes: Vec::with_capacity(capacity),
        }
    }

    /// Admits `node` if there is room, or if it is strictly closer to the
    /// target than the current farthest entry, which is then dropped.
    pub fn try_insert(&mut self, node: Node) -> bool {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return false;
        }

        let distance = node.id.xor(&self.target);
        if self.nodes.len() >= self.capacity {
            match self.nodes.last() {
                Some(farthest) if distance < farthest.id.xor(&self.target) => {
                    self.nodes.pop();
                }
                _ => return false,
            }
        }

        let pos = self
            .nodes
            .partition_point(|n| n.id.xor(&self.target) < distance);
        self.nodes.insert(pos, node);
        true
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| &n.id == id)?;
        Some(self.nodes.remove(pos))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }
}
