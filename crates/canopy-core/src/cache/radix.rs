//! Radix tree over token sequences for KV prefix reuse.
//!
//! Each edge holds a run of tokens together with the KV slots that store
//! them, so matching a prompt against the tree yields the slot vector a new
//! request can reuse instead of recomputing. Nodes live in an arena keyed by
//! [`NodeId`]; parents are referenced by id, never owned.
//!
//! Requests pin the path they reuse with [`RadixCache::inc_ref`]. Unpinned
//! leaves are reclaimed in LRU order by [`RadixCache::evict`].
//!
//! # Example
//!
//! ```
//! use canopy_core::cache::{RadixCache, SlotPool};
//!
//! let mut pool = SlotPool::new(16).unwrap();
//! let mut cache = RadixCache::new();
//!
//! // Commit a finished sequence with the slots holding its KV
//! let slots = pool.alloc(4).unwrap();
//! let rejected = cache.insert(&[1, 2, 3, 4], &slots).unwrap();
//! assert!(rejected.is_empty());
//!
//! // A new prompt sharing three tokens reuses three slots
//! let hit = cache.match_prefix(&[1, 2, 3, 9]);
//! assert_eq!(hit.slots, slots[..3].to_vec());
//!
//! // Nothing is pinned, so everything can be reclaimed
//! let freed = cache.evict(4, &mut pool).unwrap();
//! assert_eq!(freed, 4);
//! assert_eq!(pool.available(), 16);
//! ```

use super::{SlotId, SlotPool};
use crate::error::{CanopyError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Identifier of a node in the radix cache arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Root node ID.
    pub const ROOT: NodeId = NodeId(0);

    /// Check if this is the root.
    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A node in the radix tree.
#[derive(Debug, Clone)]
struct RadixNode {
    /// Parent node (None for root).
    parent: Option<NodeId>,
    /// Edge tokens from the parent.
    key: Vec<u32>,
    /// KV slots for the edge tokens, position for position.
    value: Vec<SlotId>,
    /// Children indexed by the first token of their edge.
    children: HashMap<u32, NodeId>,
    /// Number of live requests pinning this node or a descendant.
    lock_ref: usize,
    /// Logical time of the last touch.
    last_access: u64,
    /// Creation order of the edge. A split keeps it on the shared prefix.
    seq: u64,
}

impl RadixNode {
    fn root() -> Self {
        Self {
            parent: None,
            key: Vec::new(),
            value: Vec::new(),
            children: HashMap::new(),
            lock_ref: 0,
            last_access: 0,
            seq: 0,
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Result of a prefix lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixMatch {
    /// Slots covering the matched prefix, in token order.
    pub slots: Vec<SlotId>,
    /// Deepest node reached. On a partial edge match this is the node whose
    /// edge was partially matched.
    pub last_node: NodeId,
}

impl PrefixMatch {
    /// A match of nothing, ending at the root.
    pub fn empty() -> Self {
        Self {
            slots: Vec::new(),
            last_node: NodeId::ROOT,
        }
    }

    /// Number of matched tokens.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if nothing matched.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Info about a radix node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node ID.
    pub id: NodeId,
    /// Parent node ID.
    pub parent: Option<NodeId>,
    /// Tokens on the edge into this node.
    pub edge_len: usize,
    /// Number of children.
    pub num_children: usize,
    /// Pin count.
    pub lock_ref: usize,
    /// Logical time of the last touch.
    pub last_access: u64,
    /// Creation order among siblings; survives edge splits.
    pub seq: u64,
}

/// Shared-prefix index over token sequences.
///
/// A disabled cache matches nothing and retains nothing: every insert hands
/// its slots straight back to the caller.
#[derive(Debug, Clone)]
pub struct RadixCache {
    /// Arena of nodes.
    nodes: HashMap<NodeId, RadixNode>,
    /// Next node id to hand out.
    next_id: u64,
    /// Logical clock for LRU ordering.
    clock: u64,
    /// Whether caching is turned off.
    disabled: bool,
    /// Sum of edge slots over all nodes.
    total_slots: usize,
    /// Sum of edge slots over unpinned nodes.
    evictable_slots: usize,
    /// Slots reclaimed by eviction since creation.
    evicted_slots: u64,
}

impl RadixCache {
    /// Create an empty radix cache.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::ROOT, RadixNode::root());

        Self {
            nodes,
            next_id: 1,
            clock: 0,
            disabled: false,
            total_slots: 0,
            evictable_slots: 0,
            evicted_slots: 0,
        }
    }

    /// Create a cache that never matches and never retains slots.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::new()
        }
    }

    /// Root node ID.
    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// Find the longest cached prefix of `tokens`.
    ///
    /// A match that ends inside an edge returns the matched part of that
    /// edge's slots; the edge itself is only split by a later insert.
    pub fn match_prefix(&mut self, tokens: &[u32]) -> PrefixMatch {
        if self.disabled {
            return PrefixMatch::empty();
        }

        let now = self.tick();
        let mut result = PrefixMatch::empty();
        let mut pos = 0;

        if let Some(root) = self.nodes.get_mut(&NodeId::ROOT) {
            root.last_access = now;
        }

        while pos < tokens.len() {
            let Some(child_id) = self
                .nodes
                .get(&result.last_node)
                .and_then(|n| n.children.get(&tokens[pos]).copied())
            else {
                break;
            };
            let Some(child) = self.nodes.get_mut(&child_id) else {
                break;
            };

            child.last_access = now;
            let common = common_prefix_len(&child.key, &tokens[pos..]);
            result.slots.extend_from_slice(&child.value[..common]);
            result.last_node = child_id;
            pos += common;

            if common < child.key.len() {
                break;
            }
        }

        result
    }

    /// Make `tokens` representable in the tree, mapped to `slots`.
    ///
    /// Where the tree already covers a position with a different slot, the
    /// tree's slot wins and the caller's slot is returned so it can be freed.
    /// Positions the caller shares with the tree (a reused prefix) are not
    /// returned.
    pub fn insert(&mut self, tokens: &[u32], slots: &[SlotId]) -> Result<Vec<SlotId>> {
        if tokens.len() != slots.len() {
            return Err(CanopyError::InvariantBreak(format!(
                "insert of {} tokens with {} slots",
                tokens.len(),
                slots.len()
            )));
        }
        if self.disabled {
            return Ok(slots.to_vec());
        }

        let now = self.tick();
        let mut rejected = Vec::new();
        let mut node_id = NodeId::ROOT;
        let mut pos = 0;

        while pos < tokens.len() {
            let existing = self
                .node(node_id)?
                .children
                .get(&tokens[pos])
                .copied();

            let Some(mut child_id) = existing else {
                self.add_leaf(node_id, &tokens[pos..], &slots[pos..], now)?;
                break;
            };

            let (common, edge_len) = {
                let child = self.node(child_id)?;
                (common_prefix_len(&child.key, &tokens[pos..]), child.key.len())
            };
            if common < edge_len {
                child_id = self.split(child_id, common)?;
            }

            let child = self.node_mut(child_id)?;
            child.last_access = now;
            for (tree_slot, caller_slot) in child.value.iter().zip(&slots[pos..pos + common]) {
                if tree_slot != caller_slot {
                    rejected.push(*caller_slot);
                }
            }

            node_id = child_id;
            pos += common;
        }

        Ok(rejected)
    }

    /// Pin `node` and every ancestor.
    pub fn inc_ref(&mut self, node: NodeId) -> Result<()> {
        if self.disabled && node.is_root() {
            return Ok(());
        }
        self.node(node)?;

        let now = self.tick();
        let mut current = Some(node);
        while let Some(id) = current {
            if id.is_root() {
                break;
            }
            let entry = self.nodes.get_mut(&id).ok_or(CanopyError::InvalidNode(id.0))?;
            if entry.lock_ref == 0 {
                self.evictable_slots -= entry.value.len();
            }
            entry.lock_ref += 1;
            entry.last_access = now;
            current = entry.parent;
        }
        Ok(())
    }

    /// Unpin `node` and every ancestor.
    pub fn dec_ref(&mut self, node: NodeId) -> Result<()> {
        if self.disabled && node.is_root() {
            return Ok(());
        }
        self.node(node)?;

        let now = self.tick();
        let mut current = Some(node);
        while let Some(id) = current {
            if id.is_root() {
                break;
            }
            let entry = self.nodes.get_mut(&id).ok_or(CanopyError::InvalidNode(id.0))?;
            if entry.lock_ref == 0 {
                return Err(CanopyError::InvariantBreak(format!(
                    "refcount underflow at node {id}"
                )));
            }
            entry.lock_ref -= 1;
            if entry.lock_ref == 0 {
                self.evictable_slots += entry.value.len();
            }
            entry.last_access = now;
            current = entry.parent;
        }
        Ok(())
    }

    /// Reclaim at least `num_slots` slots from unpinned leaves, oldest first.
    ///
    /// Returns the number of slots actually freed, which may be short when
    /// the rest of the tree is pinned.
    pub fn evict(&mut self, num_slots: usize, pool: &mut SlotPool) -> Result<usize> {
        if num_slots == 0 || self.disabled {
            return Ok(0);
        }

        let mut heap: BinaryHeap<Reverse<(u64, NodeId)>> = self
            .nodes
            .iter()
            .filter(|(id, n)| !id.is_root() && n.is_leaf() && n.lock_ref == 0)
            .map(|(id, n)| Reverse((n.last_access, *id)))
            .collect();

        let mut freed = 0;
        while freed < num_slots {
            let Some(Reverse((_, id))) = heap.pop() else {
                break;
            };
            let node = self.nodes.remove(&id).ok_or(CanopyError::InvalidNode(id.0))?;
            pool.free(&node.value)?;

            freed += node.value.len();
            self.total_slots -= node.value.len();
            self.evictable_slots -= node.value.len();

            let parent_id = node.parent.ok_or(CanopyError::InvalidNode(id.0))?;
            let parent = self.node_mut(parent_id)?;
            parent.children.remove(&node.key[0]);
            if !parent_id.is_root() && parent.is_leaf() && parent.lock_ref == 0 {
                heap.push(Reverse((parent.last_access, parent_id)));
            }
        }

        self.evicted_slots += freed as u64;
        Ok(freed)
    }

    /// Drop every node and return all slots to `pool`.
    ///
    /// Fails if any node is pinned.
    pub fn reset(&mut self, pool: &mut SlotPool) -> Result<()> {
        let pinned = self.nodes.values().filter(|n| n.lock_ref > 0).count();
        if pinned > 0 {
            return Err(CanopyError::CacheInUse { pinned });
        }

        let slots = self.all_slots();
        pool.free(&slots)?;

        // Node ids are never reused, so stale ids held elsewhere stay stale.
        let disabled = self.disabled;
        let evicted = self.evicted_slots;
        let next_id = self.next_id;
        *self = Self::new();
        self.disabled = disabled;
        self.evicted_slots = evicted;
        self.next_id = next_id;
        Ok(())
    }

    /// Check if `node` is in the tree.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    /// Pin count of `node`.
    pub fn lock_ref(&self, node: NodeId) -> Option<usize> {
        self.nodes.get(&node).map(|n| n.lock_ref)
    }

    /// Parent of `node`.
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(&node).and_then(|n| n.parent)
    }

    /// Children of `node` (test-only helper).
    #[cfg(test)]
    pub(crate) fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&node)
            .map(|n| n.children.values().copied().collect())
            .unwrap_or_default()
    }

    /// Creation order of the edge into `node`.
    ///
    /// Unlike the node id, this is inherited by the shared prefix when an
    /// edge is split, so siblings keep their relative order.
    pub fn creation_seq(&self, node: NodeId) -> Option<u64> {
        self.nodes.get(&node).map(|n| n.seq)
    }

    /// Get node info.
    pub fn get_node(&self, node: NodeId) -> Option<NodeInfo> {
        self.nodes.get(&node).map(|n| NodeInfo {
            id: node,
            parent: n.parent,
            edge_len: n.key.len(),
            num_children: n.children.len(),
            lock_ref: n.lock_ref,
            last_access: n.last_access,
            seq: n.seq,
        })
    }

    /// Every slot held by the tree.
    pub fn all_slots(&self) -> Vec<SlotId> {
        self.nodes
            .values()
            .flat_map(|n| n.value.iter().copied())
            .collect()
    }

    /// Total slots held on edges.
    pub fn total_slots(&self) -> usize {
        self.total_slots
    }

    /// Slots on unpinned nodes.
    pub fn evictable_slots(&self) -> usize {
        self.evictable_slots
    }

    /// Slots on pinned nodes.
    pub fn protected_slots(&self) -> usize {
        self.total_slots - self.evictable_slots
    }

    /// Number of nodes, root included.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the tree holds no tokens.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Get statistics about the radix cache.
    pub fn stats(&self) -> RadixCacheStats {
        RadixCacheStats {
            num_nodes: self.nodes.len(),
            total_slots: self.total_slots,
            evictable_slots: self.evictable_slots,
            protected_slots: self.protected_slots(),
            evicted_slots: self.evicted_slots,
        }
    }

    /// Verify structural invariants.
    ///
    /// Checks parent/child links, unique first tokens, edge/slot lengths,
    /// pin counts (a parent carries at least the pins of its children),
    /// reachability of every node from the root, and the slot totals.
    pub fn validate(&self) -> Result<()> {
        let broken = |msg: String| Err(CanopyError::InvariantBreak(msg));

        let mut total = 0;
        let mut evictable = 0;
        for (id, node) in &self.nodes {
            if node.key.len() != node.value.len() {
                return broken(format!(
                    "node {id} has {} tokens but {} slots",
                    node.key.len(),
                    node.value.len()
                ));
            }
            if id.is_root() {
                if node.parent.is_some() || !node.key.is_empty() {
                    return broken("root has a parent or an edge".into());
                }
            } else {
                if node.key.is_empty() {
                    return broken(format!("node {id} has an empty edge"));
                }
                let Some(parent) = node.parent.and_then(|p| self.nodes.get(&p)) else {
                    return broken(format!("node {id} has no live parent"));
                };
                if parent.children.get(&node.key[0]) != Some(id) {
                    return broken(format!("node {id} is not linked from its parent"));
                }
            }

            for (first, child_id) in &node.children {
                let Some(child) = self.nodes.get(child_id) else {
                    return broken(format!("node {id} links missing child {child_id}"));
                };
                if child.key.first() != Some(first) || child.parent != Some(*id) {
                    return broken(format!("child {child_id} of {id} is mislinked"));
                }
            }

            if !id.is_root() {
                let child_pins: usize = node
                    .children
                    .values()
                    .filter_map(|c| self.nodes.get(c))
                    .map(|c| c.lock_ref)
                    .sum();
                if child_pins > node.lock_ref {
                    return broken(format!("node {id} has fewer pins than its children"));
                }
            }

            // Walk to the root; a cycle or a dangling parent breaks reachability.
            let mut steps = 0;
            let mut cursor = *id;
            while let Some(parent) = self.nodes.get(&cursor).and_then(|n| n.parent) {
                cursor = parent;
                steps += 1;
                if steps > self.nodes.len() {
                    return broken(format!("node {id} is on a parent cycle"));
                }
            }
            if !cursor.is_root() {
                return broken(format!("node {id} is unreachable from the root"));
            }

            total += node.value.len();
            if node.lock_ref == 0 {
                evictable += node.value.len();
            }
        }

        if total != self.total_slots || evictable != self.evictable_slots {
            return broken(format!(
                "slot totals drifted: counted {total}/{evictable}, tracked {}/{}",
                self.total_slots, self.evictable_slots
            ));
        }
        Ok(())
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn node(&self, id: NodeId) -> Result<&RadixNode> {
        self.nodes.get(&id).ok_or(CanopyError::InvalidNode(id.0))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut RadixNode> {
        self.nodes.get_mut(&id).ok_or(CanopyError::InvalidNode(id.0))
    }

    fn add_leaf(&mut self, parent: NodeId, key: &[u32], value: &[SlotId], now: u64) -> Result<NodeId> {
        let id = NodeId(self.next_id);
        self.next_id += 1;

        self.node_mut(parent)?.children.insert(key[0], id);
        self.nodes.insert(
            id,
            RadixNode {
                parent: Some(parent),
                key: key.to_vec(),
                value: value.to_vec(),
                children: HashMap::new(),
                lock_ref: 0,
                last_access: now,
                seq: id.0,
            },
        );

        self.total_slots += value.len();
        self.evictable_slots += value.len();
        Ok(id)
    }

    /// Split the edge into `child` after `at` tokens. Returns the new node
    /// holding the shared prefix; `child` keeps the suffix.
    fn split(&mut self, child_id: NodeId, at: usize) -> Result<NodeId> {
        let new_id = NodeId(self.next_id);
        self.next_id += 1;

        let child = self.node_mut(child_id)?;
        let key: Vec<u32> = child.key.drain(..at).collect();
        let value: Vec<SlotId> = child.value.drain(..at).collect();
        let parent_id = child.parent.replace(new_id).ok_or(CanopyError::InvalidNode(child_id.0))?;
        let suffix_first = child.key[0];
        let lock_ref = child.lock_ref;
        let last_access = child.last_access;
        let seq = child.seq;

        let first = key[0];
        self.nodes.insert(
            new_id,
            RadixNode {
                parent: Some(parent_id),
                key,
                value,
                children: HashMap::from([(suffix_first, child_id)]),
                lock_ref,
                last_access,
                seq,
            },
        );
        self.node_mut(parent_id)?.children.insert(first, new_id);
        Ok(new_id)
    }
}

impl Default for RadixCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about a RadixCache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RadixCacheStats {
    /// Number of nodes in the tree, root included.
    pub num_nodes: usize,
    /// Slots held on edges.
    pub total_slots: usize,
    /// Slots on unpinned nodes.
    pub evictable_slots: usize,
    /// Slots on pinned nodes.
    pub protected_slots: usize,
    /// Slots reclaimed by eviction so far.
    pub evicted_slots: u64,
}

fn common_prefix_len(a: &[u32], b: &[u32]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
