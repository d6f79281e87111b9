//! Client statistics snapshots.

use crate::cluster::topology::Topology;
use crate::net::pool::PoolStats;
use std::net::SocketAddr;

/// Point-in-time statistics for one node.
#[derive(Debug, Clone)]
pub struct NodeStats {
    /// Stable node name.
    pub name: String,

    /// Node address.
    pub address: SocketAddr,

    /// Current health score.
    pub health: u32,

    /// Whether the node is active.
    pub active: bool,

    /// Connection pool counters.
    pub pool: PoolStats,
}

/// Point-in-time statistics for the whole client.
#[derive(Debug, Clone)]
pub struct ClientStats {
    /// Per-node breakdown.
    pub nodes: Vec<NodeStats>,
}

impl ClientStats {
    /// Snapshot every node in the current topology.
    pub fn collect(topology: &Topology) -> Self {
        let nodes = topology
            .nodes()
            .iter()
            .map(|node| NodeStats {
                name: node.name().to_string(),
                address: node.address(),
                health: node.health(),
                active: node.is_active(),
                pool: node.pool_stats(),
            })
            .collect();
        Self { nodes }
    }

    /// Connections currently handed out across all nodes.
    pub fn in_use(&self) -> usize {
        self.nodes.iter().map(|n| n.pool.in_use).sum()
    }

    /// Idle pooled connections across all nodes.
    pub fn pooled(&self) -> usize {
        self.nodes.iter().map(|n| n.pool.pooled).sum()
    }

    /// Connections opened over the client's lifetime.
    pub fn opened(&self) -> usize {
        self.nodes.iter().map(|n| n.pool.opened).sum()
    }

    /// Connections closed over the client's lifetime.
    pub fn closed(&self) -> usize {
        self.nodes.iter().map(|n| n.pool.closed).sum()
    }
}
