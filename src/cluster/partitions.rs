//! Per-namespace partition ownership tables.
//!
//! A table maps `[replica_index][partition_id]` to the owning node. Tables
//! are immutable once published: the tend task builds a new table from the
//! previous one plus a node's ownership bitmaps and swaps it in wholesale,
//! so readers iterating a snapshot never observe a partial update.

use crate::cluster::node::Node;
use crate::net::info::bit_set;
use crate::types::PARTITIONS;
use std::sync::Arc;

/// Ownership table for one namespace.
pub struct PartitionTable {
    /// `replicas[replica_index][partition_id]`, owning node or unknown.
    replicas: Vec<Vec<Option<Arc<Node>>>>,

    /// Partitions whose master slot lost its owner with no replacement yet.
    /// Strong-consistency reads refuse to guess for these.
    unavailable: Vec<bool>,
}

impl PartitionTable {
    /// Create an empty table with the given replica depth.
    pub fn new(replica_count: usize) -> Self {
        Self {
            replicas: vec![vec![None; PARTITIONS]; replica_count.max(1)],
            unavailable: vec![false; PARTITIONS],
        }
    }

    /// Number of replica levels tracked.
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// The node owning `partition_id` at `replica_index`, if known.
    pub fn node_for(&self, partition_id: usize, replica_index: usize) -> Option<Arc<Node>> {
        self.replicas
            .get(replica_index)?
            .get(partition_id)?
            .clone()
    }

    /// Whether the partition's master ownership is in flux.
    pub fn is_unavailable(&self, partition_id: usize) -> bool {
        self.unavailable.get(partition_id).copied().unwrap_or(false)
    }

    /// Whether any slot in the table references `node`.
    pub fn owns_any(&self, node: &Arc<Node>) -> bool {
        self.replicas.iter().any(|level| {
            level
                .iter()
                .any(|slot| slot.as_ref().is_some_and(|n| Arc::ptr_eq(n, node)))
        })
    }

    /// Build the successor table after `node` reported `bitmaps` (one per
    /// replica level, bit *i* set means `node` owns partition *i* there).
    ///
    /// A set bit claims the slot for `node`; a clear bit withdraws only
    /// `node`'s own claim, leaving other nodes' slots alone. A master slot
    /// left empty by a withdrawal is flagged unavailable until some node
    /// claims it again.
    pub fn merge(&self, node: &Arc<Node>, bitmaps: &[Vec<u8>]) -> Self {
        let replica_count = self.replicas.len().max(bitmaps.len());
        let mut replicas = Vec::with_capacity(replica_count);
        for r in 0..replica_count {
            replicas.push(match self.replicas.get(r) {
                Some(level) => level.clone(),
                None => vec![None; PARTITIONS],
            });
        }

        for (r, bitmap) in bitmaps.iter().enumerate() {
            let level = &mut replicas[r];
            for (pid, slot) in level.iter_mut().enumerate() {
                if bit_set(bitmap, pid) {
                    *slot = Some(node.clone());
                } else if slot.as_ref().is_some_and(|n| Arc::ptr_eq(n, node)) {
                    *slot = None;
                }
            }
        }

        let unavailable =
            Self::refresh_unavailable(&self.unavailable, &self.replicas[0], &replicas[0]);
        Self {
            replicas,
            unavailable,
        }
    }

    /// Build the successor table with every claim of `node` removed. Used
    /// when the tend task drops a node.
    pub fn without_node(&self, node: &Arc<Node>) -> Self {
        let mut replicas = self.replicas.clone();
        for level in &mut replicas {
            for slot in level.iter_mut() {
                if slot.as_ref().is_some_and(|n| Arc::ptr_eq(n, node)) {
                    *slot = None;
                }
            }
        }

        let unavailable =
            Self::refresh_unavailable(&self.unavailable, &self.replicas[0], &replicas[0]);
        Self {
            replicas,
            unavailable,
        }
    }

    /// A partition becomes unavailable when its master slot goes from owned
    /// to empty, and stays so until some node claims it again.
    fn refresh_unavailable(
        previous_flags: &[bool],
        old_masters: &[Option<Arc<Node>>],
        new_masters: &[Option<Arc<Node>>],
    ) -> Vec<bool> {
        new_masters
            .iter()
            .enumerate()
            .map(|(pid, slot)| {
                slot.is_none()
                    && (old_masters[pid].is_some()
                        || previous_flags.get(pid).copied().unwrap_or(false))
            })
            .collect()
    }
}

impl std::fmt::Debug for PartitionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mapped = self.replicas[0].iter().filter(|s| s.is_some()).count();
        f.debug_struct("PartitionTable")
            .field("replica_count", &self.replicas.len())
            .field("mapped_masters", &mapped)
            .finish()
    }
}
