//! Node pool and open list for graph searches

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use bitflags::bitflags;
use glam::Vec3;

use crate::PolyRef;

/// Default node budget of a search.
pub const MAX_SEARCH_NODES: usize = 2048;

bitflags! {
    /// Search state of a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        const OPEN = 0x01;
        const CLOSED = 0x02;
    }
}

/// Search node
#[derive(Debug, Clone)]
pub struct Node {
    /// Position the node was reached at
    pub pos: Vec3,
    /// Cost from the start
    pub cost: f32,
    /// Cost plus heuristic
    pub total: f32,
    /// Parent node index
    pub parent: Option<usize>,
    pub flags: NodeFlags,
    /// Polygon the node stands for
    pub id: PolyRef,
}

/// Fixed-budget node storage keyed by polygon reference
#[derive(Debug)]
pub struct NodePool {
    nodes: Vec<Node>,
    lookup: HashMap<PolyRef, usize>,
    max_nodes: usize,
}

impl NodePool {
    /// Creates a pool holding at most `max_nodes` nodes
    pub fn new(max_nodes: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(max_nodes.min(MAX_SEARCH_NODES)),
            lookup: HashMap::new(),
            max_nodes,
        }
    }

    /// Clears the node pool
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.lookup.clear();
    }

    /// Index of the node of `id`, allocating it if needed.
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn get_node(&mut self, id: PolyRef) -> Option<usize> {
        if let Some(&idx) = self.lookup.get(&id) {
            return Some(idx);
        }
        if self.nodes.len() >= self.max_nodes {
            return None;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            pos: Vec3::ZERO,
            cost: 0.0,
            total: 0.0,
            parent: None,
            flags: NodeFlags::empty(),
            id,
        });
        self.lookup.insert(id, idx);
        Some(idx)
    }

    /// Index of the node of `id`, if one was allocated
    pub fn find_node(&self, id: PolyRef) -> Option<usize> {
        self.lookup.get(&id).copied()
    }

    #[inline]
    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    #[inline]
    pub fn node_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.nodes[idx]
    }

    /// Gets the current node count
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    /// Polygons from the start to node `idx`, following parent links.
    pub fn path_to(&self, idx: usize) -> Vec<PolyRef> {
        let mut path = Vec::new();
        let mut cur = Some(idx);
        while let Some(i) = cur {
            path.push(self.nodes[i].id);
            cur = self.nodes[i].parent;
        }
        path.reverse();
        path
    }
}

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    total: f32,
    idx: usize,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; ties broken by allocation order.
        other
            .total
            .total_cmp(&self.total)
            .then_with(|| other.idx.cmp(&self.idx))
    }
}

/// Open list ordered by node total cost
///
/// Re-pushing a node with a lower total supersedes its earlier entry;
/// stale entries are skipped on pop.
#[derive(Debug, Default)]
pub struct NodeQueue {
    heap: BinaryHeap<QueueEntry>,
}

impl NodeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Pushes or re-prioritizes node `idx`
    pub fn push(&mut self, pool: &NodePool, idx: usize) {
        self.heap.push(QueueEntry {
            total: pool.node(idx).total,
            idx,
        });
    }

    /// Pops the open node with the lowest total
    pub fn pop(&mut self, pool: &NodePool) -> Option<usize> {
        while let Some(entry) = self.heap.pop() {
            let node = pool.node(entry.idx);
            if node.flags.contains(NodeFlags::OPEN) && node.total == entry.total {
                return Some(entry.idx);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_pool() {
        let mut pool = NodePool::new(2);
        let a = pool.get_node(PolyRef::new(1)).unwrap();
        assert_eq!(pool.get_node(PolyRef::new(1)), Some(a));
        let b = pool.get_node(PolyRef::new(2)).unwrap();
        assert_ne!(a, b);
        assert!(pool.get_node(PolyRef::new(3)).is_none());
        assert_eq!(pool.find_node(PolyRef::new(2)), Some(b));

        pool.node_mut(b).parent = Some(a);
        assert_eq!(pool.path_to(b), vec![PolyRef::new(1), PolyRef::new(2)]);

        pool.clear();
        assert_eq!(pool.node_count(), 0);
        assert!(pool.find_node(PolyRef::new(1)).is_none());
    }

    #[test]
    fn test_node_queue_order_and_updates() {
        let mut pool = NodePool::new(8);
        let mut queue = NodeQueue::new();
        for (id, total) in [(1, 5.0), (2, 3.0), (3, 7.0)] {
            let idx = pool.get_node(PolyRef::new(id)).unwrap();
            let node = pool.node_mut(idx);
            node.total = total;
            node.flags = NodeFlags::OPEN;
            queue.push(&pool, idx);
        }
        // Lower the cost of node 3 below everything else.
        let idx3 = pool.find_node(PolyRef::new(3)).unwrap();
        pool.node_mut(idx3).total = 1.0;
        queue.push(&pool, idx3);

        let order: Vec<u32> = std::iter::from_fn(|| {
            let idx = queue.pop(&pool)?;
            pool.node_mut(idx).flags = NodeFlags::CLOSED;
            Some(pool.node(idx).id.id())
        })
        .collect();
        assert_eq!(order, vec![3, 2, 1]);
    }
}
