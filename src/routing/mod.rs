//! Partition-aware node resolution.

pub mod partition;

pub use partition::{PartitionStatus, PartitionTracker};

use crate::cluster::node::Node;
use crate::cluster::partitions::PartitionTable;
use crate::cluster::topology::Topology;
use crate::config::CommandPolicy;
use crate::error::{Error, Result};
use rand::Rng;
use std::sync::Arc;

/// Replica selection policy for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replica {
    /// Always the master replica.
    Master,

    /// Round-robin across master and replicas.
    MasterProles,

    /// A random replica.
    Random,

    /// Walk the replica list, advancing one step per retry so consecutive
    /// attempts land on different replicas.
    Sequence,

    /// Prefer a replica on this client's rack, falling back to the
    /// sequence walk when none matches.
    PreferRack,
}

/// Read behaviour against strong-consistency namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadModeSc {
    /// Read from the session's view; refuses partitions in migration.
    Session,

    /// Linearizable read; refuses partitions in migration.
    Linearize,

    /// Allow replica reads; refuses partitions in migration.
    AllowReplica,

    /// Allow reads even for partitions whose ownership is in flux.
    AllowUnavailable,
}

impl ReadModeSc {
    /// Whether this mode refuses to route to a partition flagged
    /// unavailable by an in-progress migration.
    pub fn refuses_unavailable(&self) -> bool {
        !matches!(self, ReadModeSc::AllowUnavailable)
    }
}

/// Resolve the target node for one partition under a replica policy.
///
/// `sequence` is the attempt counter: retries pass an advanced value so the
/// sequence and rack policies walk to a different replica each time. When
/// the mapped slot is missing or points at an inactive node, resolution
/// falls back to any active node via a wrapping round-robin, trading a
/// possible server-side redirect for liveness under a stale map.
pub fn resolve_node(
    topology: &Topology,
    policy: &CommandPolicy,
    namespace: &str,
    partition_id: usize,
    rack_id: Option<u32>,
    sequence: usize,
) -> Result<Arc<Node>> {
    if let Some(table) = topology.partition_table(namespace) {
        if table.is_unavailable(partition_id) && policy.read_mode_sc.refuses_unavailable() {
            return Err(Error::InvalidNode {
                namespace: namespace.to_string(),
                partition_id,
            });
        }

        if let Some(node) = select_replica(
            topology,
            &table,
            policy.replica,
            namespace,
            partition_id,
            rack_id,
            sequence,
        ) {
            return Ok(node);
        }
    }

    // Unmapped or dead slot: any active node keeps the operation moving.
    topology.fallback_node()
}

fn select_replica(
    topology: &Topology,
    table: &PartitionTable,
    replica: Replica,
    namespace: &str,
    partition_id: usize,
    rack_id: Option<u32>,
    sequence: usize,
) -> Option<Arc<Node>> {
    let replica_count = table.replica_count();

    match replica {
        Replica::Master => active(table.node_for(partition_id, 0)),
        Replica::MasterProles => {
            let start = topology.next_replica_index(replica_count);
            walk(table, partition_id, replica_count, start)
        }
        Replica::Random => {
            let start = rand::thread_rng().gen_range(0..replica_count.max(1));
            walk(table, partition_id, replica_count, start)
        }
        Replica::Sequence => walk(table, partition_id, replica_count, sequence),
        Replica::PreferRack => {
            if let Some(rack_id) = rack_id {
                // Scan the replica list for a rack-local node, starting at
                // the sequence offset so retries rotate within the rack.
                for offset in 0..replica_count {
                    let idx = (sequence + offset) % replica_count;
                    if let Some(node) = active(table.node_for(partition_id, idx)) {
                        if node.rack_for(namespace) == Some(rack_id) {
                            return Some(node);
                        }
                    }
                }
            }
            walk(table, partition_id, replica_count, sequence)
        }
    }
}

/// First active replica starting at `start`, wrapping across the list.
fn walk(
    table: &PartitionTable,
    partition_id: usize,
    replica_count: usize,
    start: usize,
) -> Option<Arc<Node>> {
    for offset in 0..replica_count {
        let idx = (start + offset) % replica_count;
        if let Some(node) = active(table.node_for(partition_id, idx)) {
            return Some(node);
        }
    }
    None
}

fn active(slot: Option<Arc<Node>>) -> Option<Arc<Node>> {
    slot.filter(|n| n.is_active())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::host::Host;
    use crate::config::ClientConfig;
    use crate::types::PARTITIONS;

    fn node(name: &str, port: u16) -> Arc<Node> {
        let config = ClientConfig::default();
        Arc::new(Node::new(
            name,
            Host::new("127.0.0.1", port),
            format!("127.0.0.1:{port}").parse().unwrap(),
            &config,
        ))
    }

    fn bitmap(partitions: &[usize]) -> Vec<u8> {
        let mut bytes = vec![0u8; PARTITIONS / 8];
        for &p in partitions {
            bytes[p >> 3] |= 0x80 >> (p & 7);
        }
        bytes
    }

    /// Three nodes; partition 7 mapped master=A, replica=B. C owns nothing.
    fn fixture() -> (Topology, Arc<Node>, Arc<Node>, Arc<Node>) {
        let topo = Topology::new();
        let a = node("A", 3000);
        let b = node("B", 3001);
        let c = node("C", 3002);
        topo.apply_additions(&[a.clone(), b.clone(), c.clone()]);
        topo.merge_partitions(
            &a,
            &vec![("test".to_string(), vec![bitmap(&[7]), bitmap(&[])])],
        );
        topo.merge_partitions(
            &b,
            &vec![("test".to_string(), vec![bitmap(&[]), bitmap(&[7])])],
        );
        (topo, a, b, c)
    }

    fn policy(replica: Replica) -> CommandPolicy {
        CommandPolicy::default().with_replica(replica)
    }

    #[test]
    fn test_master_policy_hits_master() {
        let (topo, a, _, _) = fixture();
        for sequence in 0..3 {
            let resolved =
                resolve_node(&topo, &policy(Replica::Master), "test", 7, None, sequence).unwrap();
            assert!(Arc::ptr_eq(&resolved, &a));
        }
    }

    #[test]
    fn test_sequence_policy_advances_on_retry() {
        let (topo, a, b, _) = fixture();
        let p = policy(Replica::Sequence);
        let first = resolve_node(&topo, &p, "test", 7, None, 0).unwrap();
        let second = resolve_node(&topo, &p, "test", 7, None, 1).unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        assert!(Arc::ptr_eq(&second, &b));
        // Wraps back to the master.
        let third = resolve_node(&topo, &p, "test", 7, None, 2).unwrap();
        assert!(Arc::ptr_eq(&third, &a));
    }

    #[test]
    fn test_inactive_master_falls_through_to_replica() {
        let (topo, a, b, _) = fixture();
        block_on(a.close());
        let resolved =
            resolve_node(&topo, &policy(Replica::Sequence), "test", 7, None, 0).unwrap();
        assert!(Arc::ptr_eq(&resolved, &b));
    }

    #[test]
    fn test_unmapped_partition_uses_fallback() {
        let (topo, _, _, _) = fixture();
        // Partition 99 has no owner; resolution still returns some active node.
        let resolved =
            resolve_node(&topo, &policy(Replica::Sequence), "test", 99, None, 0).unwrap();
        assert!(resolved.is_active());
    }

    #[test]
    fn test_unknown_namespace_uses_fallback() {
        let (topo, _, _, _) = fixture();
        let resolved =
            resolve_node(&topo, &policy(Replica::Master), "nope", 7, None, 0).unwrap();
        assert!(resolved.is_active());
    }

    #[test]
    fn test_empty_cluster_fails() {
        let topo = Topology::new();
        let err = resolve_node(&topo, &policy(Replica::Master), "test", 7, None, 0).unwrap_err();
        assert!(matches!(err, Error::NoAvailableNode));
    }

    #[test]
    fn test_prefer_rack_picks_local_replica() {
        let (topo, a, b, _) = fixture();
        a.set_racks(vec![("test".to_string(), 1)]);
        b.set_racks(vec![("test".to_string(), 2)]);

        let p = policy(Replica::PreferRack);
        let resolved = resolve_node(&topo, &p, "test", 7, Some(2), 0).unwrap();
        assert!(Arc::ptr_eq(&resolved, &b));

        // Without a matching rack the sequence order applies.
        let resolved = resolve_node(&topo, &p, "test", 7, Some(9), 0).unwrap();
        assert!(Arc::ptr_eq(&resolved, &a));

        // Without a configured rack id, same.
        let resolved = resolve_node(&topo, &p, "test", 7, None, 0).unwrap();
        assert!(Arc::ptr_eq(&resolved, &a));
    }

    #[test]
    fn test_sc_mode_refuses_unavailable_partition() {
        let (topo, a, b, _) = fixture();
        // A withdraws partition 7's master claim; B holds only the replica
        // level, so the master slot empties out and the partition is in flux.
        topo.merge_partitions(
            &a,
            &vec![("test".to_string(), vec![bitmap(&[]), bitmap(&[])])],
        );

        let p = policy(Replica::Sequence);
        let err = resolve_node(&topo, &p, "test", 7, None, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidNode { partition_id: 7, .. }));
        assert!(err.is_retryable());

        // AllowUnavailable keeps routing (replica walk finds B).
        let relaxed = p.clone().with_read_mode_sc(ReadModeSc::AllowUnavailable);
        let resolved = resolve_node(&topo, &relaxed, "test", 7, None, 0).unwrap();
        assert!(Arc::ptr_eq(&resolved, &b));
    }

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
