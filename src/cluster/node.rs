//! A single server process as seen by the client.

use crate::cluster::host::Host;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::net::connection::Connection;
use crate::net::pool::{ConnectionPool, PoolStats};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Health score a node starts with and is restored to on success.
pub const FULL_HEALTH: u32 = 5;

/// One server node: identity, addresses, connection pool and liveness state.
///
/// Nodes are created by the tend task after a successful identity probe and
/// owned exclusively by the topology directory; every other component holds
/// `Arc<Node>` clones out of published snapshots.
pub struct Node {
    /// Stable node name reported by the identity probe.
    name: String,

    /// The host this node was first reached under.
    host: Host,

    /// Resolved socket address used for new connections.
    address: SocketAddr,

    /// Every host known to map to this node.
    aliases: RwLock<HashSet<Host>>,

    pool: ConnectionPool,
    connect_timeout: Duration,
    idle_timeout: Duration,

    /// Decremented on connection/timeout errors, restored on success.
    /// Zero marks the node unhealthy.
    health: AtomicU32,

    /// How many peers referenced this node during the current tend cycle.
    peer_refs: AtomicUsize,

    /// Whether this node answered its refresh probe in the current cycle.
    responded: AtomicBool,

    active: AtomicBool,

    /// Last partition-ownership generation merged from this node.
    partition_generation: AtomicI64,

    /// Rack id per namespace, refreshed during tending.
    racks: RwLock<HashMap<String, u32>>,
}

impl Node {
    /// Create an active node.
    pub fn new(name: impl Into<String>, host: Host, address: SocketAddr, config: &ClientConfig) -> Self {
        let mut aliases = HashSet::new();
        aliases.insert(host.clone());

        Self {
            name: name.into(),
            host,
            address,
            aliases: RwLock::new(aliases),
            pool: ConnectionPool::new(config.max_conns_per_node),
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
            health: AtomicU32::new(FULL_HEALTH),
            peer_refs: AtomicUsize::new(0),
            responded: AtomicBool::new(false),
            active: AtomicBool::new(true),
            partition_generation: AtomicI64::new(-1),
            racks: RwLock::new(HashMap::new()),
        }
    }

    /// Stable node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The primary host this node was created from.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Socket address used for new connections.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Whether the node is accepting new work.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------- pool

    /// Get a pooled or fresh connection.
    ///
    /// Invalid pooled entries are discarded along the way. When the pool is
    /// empty a new connection is opened capacity-permitting; otherwise the
    /// caller gets a pool-exhausted error.
    pub async fn get_connection(&self) -> Result<Connection> {
        if !self.is_active() {
            return Err(Error::Inactive(self.name.clone()));
        }

        while let Some(mut conn) = self.pool.try_pop() {
            if conn.is_valid(self.idle_timeout) {
                conn.touch();
                return Ok(conn);
            }
            self.pool.discard(conn).await;
        }

        if !self.pool.try_reserve() {
            return Err(Error::PoolExhausted {
                node: self.name.clone(),
            });
        }

        match Connection::connect(self.address, self.connect_timeout).await {
            Ok(conn) => {
                self.pool.record_opened();
                Ok(conn)
            }
            Err(e) => {
                self.pool.cancel_reservation();
                self.decrease_health();
                Err(e)
            }
        }
    }

    /// Return a connection to the pool, or close it when the node is
    /// inactive or the pool is full.
    pub async fn put_connection(&self, conn: Connection) {
        if !self.is_active() {
            self.pool.discard(conn).await;
            return;
        }
        if let Err(conn) = self.pool.try_push(conn) {
            self.pool.discard(conn).await;
        }
    }

    /// Close a connection that must not be reused (I/O error, parse desync).
    pub async fn discard_connection(&self, conn: Connection) {
        self.pool.discard(conn).await;
    }

    /// Evict pooled connections idle past the configured budget.
    pub async fn sweep_idle_connections(&self) -> usize {
        self.pool.sweep_idle(self.idle_timeout).await
    }

    /// Open connections until the pool holds at least `min` of them.
    /// Best-effort: stops quietly at the capacity bound.
    pub async fn fill_min_connections(&self, min: usize) -> Result<()> {
        loop {
            if !self.is_active() {
                return Ok(());
            }
            let stats = self.pool.stats();
            if stats.pooled + stats.in_use >= min {
                return Ok(());
            }
            if !self.pool.try_reserve() {
                return Ok(());
            }
            match Connection::connect(self.address, self.connect_timeout).await {
                Ok(conn) => {
                    self.pool.record_opened();
                    if let Err(conn) = self.pool.try_push(conn) {
                        self.pool.discard(conn).await;
                        return Ok(());
                    }
                }
                Err(e) => {
                    self.pool.cancel_reservation();
                    self.decrease_health();
                    return Err(e);
                }
            }
        }
    }

    /// Pool counter snapshot.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    // -------------------------------------------------------------- health

    /// Restore the health score to full after a successful exchange.
    pub fn restore_health(&self) {
        self.health.store(FULL_HEALTH, Ordering::Relaxed);
    }

    /// Lower the health score after a connection or timeout error.
    pub fn decrease_health(&self) {
        let _ = self
            .health
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |h| {
                Some(h.saturating_sub(1))
            });
    }

    /// Current health score.
    pub fn health(&self) -> u32 {
        self.health.load(Ordering::Relaxed)
    }

    /// Whether the health score is exhausted.
    pub fn is_unhealthy(&self) -> bool {
        self.health() == 0
    }

    // ------------------------------------------------------------- aliases

    /// Hosts known to map to this node.
    pub fn aliases(&self) -> Vec<Host> {
        self.aliases.read().iter().cloned().collect()
    }

    /// Register an additional host for this node.
    pub fn add_alias(&self, host: Host) {
        self.aliases.write().insert(host);
    }

    // ---------------------------------------------------------- tend state

    /// Reset per-cycle probe bookkeeping. Called at the top of every tend
    /// cycle.
    pub fn reset_tend_state(&self) {
        self.peer_refs.store(0, Ordering::Relaxed);
        self.responded.store(false, Ordering::Relaxed);
    }

    /// Count a peer referencing this node in the current cycle.
    pub fn inc_peer_refs(&self) {
        self.peer_refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Peer references accumulated in the current cycle.
    pub fn peer_refs(&self) -> usize {
        self.peer_refs.load(Ordering::Relaxed)
    }

    /// Mark that this node answered its refresh probe.
    pub fn set_responded(&self) {
        self.responded.store(true, Ordering::Relaxed);
    }

    /// Whether this node answered its refresh probe this cycle.
    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::Relaxed)
    }

    /// Store a newly reported partition generation; returns true when it
    /// differs from the last merged one.
    pub fn update_partition_generation(&self, generation: i64) -> bool {
        self.partition_generation.swap(generation, Ordering::Relaxed) != generation
    }

    /// Last merged partition generation.
    pub fn partition_generation(&self) -> i64 {
        self.partition_generation.load(Ordering::Relaxed)
    }

    /// Replace the per-namespace rack ids.
    pub fn set_racks(&self, racks: Vec<(String, u32)>) {
        *self.racks.write() = racks.into_iter().collect();
    }

    /// Rack id this node reports for a namespace.
    pub fn rack_for(&self, namespace: &str) -> Option<u32> {
        self.racks.read().get(namespace).copied()
    }

    // ------------------------------------------------------------ lifetime

    /// Mark inactive and drain the pool. An inactive node never accepts new
    /// pooled connections.
    pub async fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.pool.drain().await;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("active", &self.is_active())
            .field("health", &self.health())
            .finish()
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.name, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn sink_listener() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    fn test_node(addr: SocketAddr, max_conns: usize) -> Node {
        let config = ClientConfig {
            max_conns_per_node: max_conns,
            ..Default::default()
        };
        Node::new("TEST0001", Host::new("127.0.0.1", addr.port()), addr, &config)
    }

    #[test]
    fn test_health_transitions() {
        let node = test_node("127.0.0.1:3000".parse().unwrap(), 4);
        assert_eq!(node.health(), FULL_HEALTH);
        assert!(!node.is_unhealthy());

        for _ in 0..FULL_HEALTH {
            node.decrease_health();
        }
        assert!(node.is_unhealthy());

        // Score saturates at zero.
        node.decrease_health();
        assert_eq!(node.health(), 0);

        node.restore_health();
        assert_eq!(node.health(), FULL_HEALTH);
    }

    #[test]
    fn test_tend_state_reset() {
        let node = test_node("127.0.0.1:3000".parse().unwrap(), 4);
        node.inc_peer_refs();
        node.inc_peer_refs();
        node.set_responded();
        assert_eq!(node.peer_refs(), 2);
        assert!(node.responded());

        node.reset_tend_state();
        assert_eq!(node.peer_refs(), 0);
        assert!(!node.responded());
    }

    #[test]
    fn test_partition_generation_change_detection() {
        let node = test_node("127.0.0.1:3000".parse().unwrap(), 4);
        assert!(node.update_partition_generation(1));
        assert!(!node.update_partition_generation(1));
        assert!(node.update_partition_generation(2));
    }

    #[tokio::test]
    async fn test_connection_reuse_and_exhaustion() {
        let addr = sink_listener().await;
        let node = test_node(addr, 1);

        let conn = node.get_connection().await.unwrap();
        let first_id = conn.id();

        // Capacity 1 and one connection out: next request fails.
        let err = node.get_connection().await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));

        node.put_connection(conn).await;
        let again = node.get_connection().await.unwrap();
        assert_eq!(again.id(), first_id, "pooled connection is reused");
        node.put_connection(again).await;
    }

    #[tokio::test]
    async fn test_closed_node_rejects_and_drains() {
        let addr = sink_listener().await;
        let node = test_node(addr, 2);

        let conn = node.get_connection().await.unwrap();
        node.put_connection(conn).await;
        assert_eq!(node.pool_stats().pooled, 1);

        node.close().await;
        assert!(!node.is_active());
        assert_eq!(node.pool_stats().pooled, 0);
        assert!(matches!(
            node.get_connection().await,
            Err(Error::Inactive(_))
        ));
    }

    #[tokio::test]
    async fn test_put_on_inactive_node_closes_connection() {
        let addr = sink_listener().await;
        let node = test_node(addr, 2);

        let conn = node.get_connection().await.unwrap();
        node.close().await;
        node.put_connection(conn).await;
        assert_eq!(node.pool_stats().pooled, 0);
    }

    #[tokio::test]
    async fn test_failed_connect_lowers_health() {
        // Port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let node = test_node(addr, 2);
        let before = node.health();
        let _ = node.get_connection().await.unwrap_err();
        assert_eq!(node.health(), before - 1);
        // The failed reservation is released.
        assert_eq!(node.pool_stats().in_use, 0);
    }
}
