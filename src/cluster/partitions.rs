//! The partition table: known nodes plus the derived slot lookup.
//!
//! [`Partitions`] holds the current table behind a copy-on-write pointer.
//! Readers grab an `Arc` snapshot and never see a half-updated table;
//! writers build a new table and swap it in.
//!
//! Node edits made through [`Partitions::modify`] are published at once for
//! membership and selection purposes, but slot routing keeps using the
//! previous lookup until [`Partitions::update_cache`] rebuilds it. Several
//! nodes can therefore be edited before routing changes.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::slot::{key_slot, SLOT_COUNT};
use super::topology::{ClusterNode, NodeId, SlotRange};

/// Immutable snapshot of the topology.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    nodes: Vec<ClusterNode>,
    slots: Box<[Option<u16>]>,
}

impl PartitionTable {
    /// Builds a table and its slot lookup.
    ///
    /// If two nodes claim the same slot, the later one in `nodes` wins.
    pub fn new(nodes: Vec<ClusterNode>) -> Self {
        let mut table = Self {
            nodes,
            slots: vec![None; SLOT_COUNT as usize].into_boxed_slice(),
        };
        table.rebuild_slots();
        table
    }

    fn rebuild_slots(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        for (index, node) in self.nodes.iter().enumerate() {
            for range in &node.slots {
                for slot in range.start..=range.end.min(SLOT_COUNT - 1) {
                    self.slots[slot as usize] = Some(index as u16);
                }
            }
        }
    }

    /// All nodes in topology order.
    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    /// The node owning `slot`, if any.
    pub fn node_for_slot(&self, slot: u16) -> Option<&ClusterNode> {
        let index = (*self.slots.get(slot as usize)?)?;
        self.nodes.get(index as usize)
    }

    /// Looks a node up by id.
    pub fn node_by_id(&self, id: &NodeId) -> Option<&ClusterNode> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    /// Looks a node up by `host:port`.
    pub fn node_by_address(&self, host: &str, port: u16) -> Option<&ClusterNode> {
        self.nodes.iter().find(|node| node.has_address(host, port))
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no node is known.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of slots with an owner.
    pub fn assigned_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Shared, atomically replaceable partition table.
///
/// Cloning yields another handle to the same table.
#[derive(Debug, Clone, Default)]
pub struct Partitions {
    current: Arc<RwLock<Arc<PartitionTable>>>,
}

impl Partitions {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table holding `nodes`.
    pub fn from_nodes(nodes: Vec<ClusterNode>) -> Self {
        let partitions = Self::new();
        partitions.load(nodes);
        partitions
    }

    /// Replaces every node and rebuilds the slot lookup.
    pub fn load(&self, nodes: Vec<ClusterNode>) {
        let table = PartitionTable::new(nodes);
        debug!(
            nodes = table.len(),
            assigned_slots = table.assigned_slots(),
            "loaded partition table"
        );
        *self.current.write() = Arc::new(table);
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<PartitionTable> {
        self.current.read().clone()
    }

    /// Slot for `key`.
    pub fn slot_for(key: impl AsRef<[u8]>) -> u16 {
        key_slot(key)
    }

    /// Owner of `slot` according to the slot lookup.
    pub fn node_for_slot(&self, slot: u16) -> Option<ClusterNode> {
        self.current.read().node_for_slot(slot).cloned()
    }

    /// Nodes matching `predicate`, in topology order.
    pub fn nodes_matching<F>(&self, predicate: F) -> Vec<ClusterNode>
    where
        F: Fn(&ClusterNode) -> bool,
    {
        self.current
            .read()
            .nodes()
            .iter()
            .filter(|node| predicate(node))
            .cloned()
            .collect()
    }

    /// All nodes.
    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.current.read().nodes().to_vec()
    }

    /// Node at `index`.
    pub fn get(&self, index: usize) -> Option<ClusterNode> {
        self.current.read().nodes().get(index).cloned()
    }

    /// Looks a node up by id.
    pub fn node_by_id(&self, id: &NodeId) -> Option<ClusterNode> {
        self.current.read().node_by_id(id).cloned()
    }

    /// Looks a node up by address.
    pub fn node_by_address(&self, host: &str, port: u16) -> Option<ClusterNode> {
        self.current.read().node_by_address(host, port).cloned()
    }

    /// Returns true if a node listens on `host:port`.
    pub fn contains_address(&self, host: &str, port: u16) -> bool {
        self.current.read().node_by_address(host, port).is_some()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    /// Returns true if no node is known.
    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }

    /// Edits the node at `index` and publishes the change.
    ///
    /// Flag and address edits are visible immediately. Slot routing is not
    /// recomputed; call [`update_cache`](Partitions::update_cache) once all
    /// edits are staged. Returns `None` if `index` is out of range.
    pub fn modify<F, R>(&self, index: usize, f: F) -> Option<R>
    where
        F: FnOnce(&mut ClusterNode) -> R,
    {
        let mut guard = self.current.write();
        let mut table = PartitionTable::clone(&guard);
        let result = f(table.nodes.get_mut(index)?);
        *guard = Arc::new(table);
        Some(result)
    }

    /// Rebuilds the slot lookup from the nodes' current slot ranges.
    pub fn update_cache(&self) {
        let mut guard = self.current.write();
        let mut table = PartitionTable::clone(&guard);
        table.rebuild_slots();
        *guard = Arc::new(table);
    }

    /// Moves ownership of `slot` to the node at `host:port`.
    ///
    /// Used when a node answers with a permanent redirect. Returns the new
    /// owner, or `None` if no known node has that address.
    pub fn relocate_slot(&self, slot: u16, host: &str, port: u16) -> Option<ClusterNode> {
        let mut guard = self.current.write();
        let target = guard
            .nodes()
            .iter()
            .position(|node| node.has_address(host, port))?;
        if guard.slots.get(slot as usize).copied().flatten() == Some(target as u16) {
            return guard.nodes.get(target).cloned();
        }

        let mut table = PartitionTable::clone(&guard);
        for node in table.nodes.iter_mut() {
            if node.has_slot(slot) {
                node.slots = node.slots.iter().flat_map(|r| r.without(slot)).collect();
            }
        }
        table.nodes[target].slots.push(SlotRange::new(slot, slot));
        table.slots[slot as usize] = Some(target as u16);
        let owner = table.nodes[target].clone();

        debug!(slot, owner = %owner.id, "relocated slot");
        *guard = Arc::new(table);
        Some(owner)
    }
}
