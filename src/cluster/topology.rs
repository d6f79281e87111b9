//! The cluster directory: live nodes, address aliases and partition maps.
//!
//! Every collection here is an atomically swappable handle to an immutable
//! snapshot. The tend task is the only writer: it builds a new snapshot and
//! publishes it with one store. Readers clone the handle once per operation
//! and treat it as frozen, so they never take a lock across work and never
//! see a torn update.

use crate::cluster::host::Host;
use crate::cluster::node::Node;
use crate::cluster::partitions::PartitionTable;
use crate::error::{Error, Result};
use crate::net::info::NamespaceBitmaps;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared cluster directory.
pub struct Topology {
    /// Live node set.
    nodes: RwLock<Arc<Vec<Arc<Node>>>>,

    /// Every host each node is reachable under, for peer cross-checks.
    aliases: RwLock<Arc<HashMap<Host, Arc<Node>>>>,

    /// Per-namespace partition ownership tables.
    maps: RwLock<Arc<HashMap<String, Arc<PartitionTable>>>>,

    /// Round-robin cursor for fallback node selection.
    fallback: AtomicUsize,

    /// Round-robin cursor for master-and-replica reads.
    replica_cursor: AtomicUsize,
}

impl Topology {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Arc::new(Vec::new())),
            aliases: RwLock::new(Arc::new(HashMap::new())),
            maps: RwLock::new(Arc::new(HashMap::new())),
            fallback: AtomicUsize::new(0),
            replica_cursor: AtomicUsize::new(0),
        }
    }

    /// Next replica index for round-robin replica reads.
    pub fn next_replica_index(&self, replica_count: usize) -> usize {
        self.replica_cursor.fetch_add(1, Ordering::Relaxed) % replica_count.max(1)
    }

    // ---------------------------------------------------------------- read

    /// Snapshot of the current node list.
    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes.read().clone()
    }

    /// Currently active nodes.
    pub fn active_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes()
            .iter()
            .filter(|n| n.is_active())
            .cloned()
            .collect()
    }

    /// Number of nodes in the current snapshot.
    pub fn node_count(&self) -> usize {
        self.nodes().len()
    }

    /// Look a node up by its stable name.
    pub fn node_by_name(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes().iter().find(|n| n.name() == name).cloned()
    }

    /// Look a node up by one of its hosts.
    pub fn node_by_host(&self, host: &Host) -> Option<Arc<Node>> {
        self.aliases.read().get(host).cloned()
    }

    /// A uniformly random active node.
    pub fn random_node(&self) -> Result<Arc<Node>> {
        let nodes = self.nodes();
        if nodes.is_empty() {
            return Err(Error::NoAvailableNode);
        }

        let mut rng = rand::thread_rng();
        let start = rng.gen_range(0..nodes.len());
        for offset in 0..nodes.len() {
            let node = &nodes[(start + offset) % nodes.len()];
            if node.is_active() {
                return Ok(node.clone());
            }
        }
        Err(Error::NoAvailableNode)
    }

    /// The next active node in a wrapping round-robin walk. Used when a
    /// partition slot is unmapped or points at an inactive node; guarantees
    /// liveness even with a stale map at the cost of a possible redirect.
    pub fn fallback_node(&self) -> Result<Arc<Node>> {
        let nodes = self.nodes();
        if nodes.is_empty() {
            return Err(Error::NoAvailableNode);
        }

        for _ in 0..nodes.len() {
            let idx = self.fallback.fetch_add(1, Ordering::Relaxed) % nodes.len();
            if nodes[idx].is_active() {
                return Ok(nodes[idx].clone());
            }
        }
        Err(Error::NoAvailableNode)
    }

    /// Snapshot of one namespace's partition table.
    pub fn partition_table(&self, namespace: &str) -> Option<Arc<PartitionTable>> {
        self.maps.read().get(namespace).cloned()
    }

    /// The node owning a partition at the given replica index, if mapped.
    pub fn node_for_partition(
        &self,
        namespace: &str,
        partition_id: usize,
        replica_index: usize,
    ) -> Option<Arc<Node>> {
        self.partition_table(namespace)?
            .node_for(partition_id, replica_index)
    }

    /// Whether any namespace maps a partition to `node`.
    pub fn owns_any_partition(&self, node: &Arc<Node>) -> bool {
        self.maps.read().values().any(|table| table.owns_any(node))
    }

    /// Names of all known namespaces.
    pub fn namespaces(&self) -> Vec<String> {
        self.maps.read().keys().cloned().collect()
    }

    // ------------------------------------------------- write (tend task)

    /// Add nodes and their aliases. One wholesale swap per collection.
    pub(crate) fn apply_additions(&self, additions: &[Arc<Node>]) {
        if additions.is_empty() {
            return;
        }

        {
            let mut nodes = self.nodes.write();
            let mut next = (**nodes).clone();
            for node in additions {
                if !next.iter().any(|n| Arc::ptr_eq(n, node)) {
                    next.push(node.clone());
                }
            }
            *nodes = Arc::new(next);
        }

        let mut aliases = self.aliases.write();
        let mut next = (**aliases).clone();
        for node in additions {
            for host in node.aliases() {
                next.insert(host, node.clone());
            }
        }
        *aliases = Arc::new(next);
    }

    /// Drop nodes, their aliases and their partition claims. One wholesale
    /// swap per collection.
    pub(crate) fn apply_removals(&self, removals: &[Arc<Node>]) {
        if removals.is_empty() {
            return;
        }

        {
            let mut nodes = self.nodes.write();
            let next: Vec<_> = nodes
                .iter()
                .filter(|n| !removals.iter().any(|r| Arc::ptr_eq(n, r)))
                .cloned()
                .collect();
            *nodes = Arc::new(next);
        }

        {
            let mut aliases = self.aliases.write();
            let next: HashMap<_, _> = aliases
                .iter()
                .filter(|(_, n)| !removals.iter().any(|r| Arc::ptr_eq(n, r)))
                .map(|(h, n)| (h.clone(), n.clone()))
                .collect();
            *aliases = Arc::new(next);
        }

        let mut maps = self.maps.write();
        let mut next = (**maps).clone();
        for (_, table) in next.iter_mut() {
            for node in removals {
                if table.owns_any(node) {
                    *table = Arc::new(table.without_node(node));
                }
            }
        }
        *maps = Arc::new(next);
    }

    /// Register an extra host for an already-known node.
    pub(crate) fn add_alias(&self, host: Host, node: &Arc<Node>) {
        node.add_alias(host.clone());
        let mut aliases = self.aliases.write();
        let mut next = (**aliases).clone();
        next.insert(host, node.clone());
        *aliases = Arc::new(next);
    }

    /// Merge a node's reported ownership bitmaps into the partition maps.
    /// Each touched namespace's table is rebuilt and swapped wholesale.
    pub(crate) fn merge_partitions(&self, node: &Arc<Node>, namespaces: &NamespaceBitmaps) {
        if namespaces.is_empty() {
            return;
        }

        let mut maps = self.maps.write();
        let mut next = (**maps).clone();
        for (namespace, bitmaps) in namespaces {
            let merged = match next.get(namespace) {
                Some(table) => table.merge(node, bitmaps),
                None => PartitionTable::new(bitmaps.len()).merge(node, bitmaps),
            };
            next.insert(namespace.clone(), Arc::new(merged));
        }
        *maps = Arc::new(next);
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("nodes", &self.node_count())
            .field("namespaces", &self.maps.read().len())
            .finish()
    }
}
