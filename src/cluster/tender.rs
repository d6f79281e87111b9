//! The background tend task: periodic cluster rediscovery.
//!
//! The tender is the sole writer of the node list, alias table and
//! partition maps for the client's lifetime. Each cycle it re-probes every
//! known node, cross-checks the peer lists they report, admits new peers
//! after an identity probe, applies the tiered removal policy and merges
//! changed partition ownership, publishing every change as a wholesale
//! copy-on-write swap. Per-node failures are logged and never abort a
//! cycle.

use crate::cluster::host::Host;
use crate::cluster::node::Node;
use crate::cluster::topology::Topology;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::net::connection::Connection;
use crate::net::info::{self, Peer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info as tinfo, warn};

/// Control messages for the tend loop.
enum TendCommand {
    /// Stop the loop and acknowledge.
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running tend task.
pub struct TendHandle {
    command_tx: mpsc::UnboundedSender<TendCommand>,
    handle: tokio::task::JoinHandle<()>,
}

impl TendHandle {
    /// Stop the tend loop and wait for it to acknowledge.
    pub async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.command_tx.send(TendCommand::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let _ = self.handle.await;
    }
}

/// Periodic topology refresher.
pub struct Tender {
    topology: Arc<Topology>,
    config: Arc<ClientConfig>,

    /// Consecutive refresh rounds in which at least one node answered,
    /// reset whenever cluster membership changes. Gates the removal policy.
    rounds: AtomicU64,
}

impl Tender {
    /// Create a tender over a topology directory.
    pub fn new(topology: Arc<Topology>, config: Arc<ClientConfig>) -> Arc<Self> {
        Arc::new(Self {
            topology,
            config,
            rounds: AtomicU64::new(0),
        })
    }

    /// Completed successful refresh rounds since the last membership change.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Repeat discovery until the node count stops changing or the startup
    /// deadline elapses. Never blocks startup indefinitely on a partially
    /// reachable cluster.
    pub async fn warm_up(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.tend.warmup_deadline;
        let mut previous = 0usize;

        loop {
            self.tend().await;
            let count = self.topology.node_count();
            if count > 0 && count == previous {
                break;
            }
            previous = count;

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if self.topology.node_count() == 0 {
            return Err(Error::NoAvailableNode);
        }
        Ok(())
    }

    /// Spawn the background tend loop.
    pub fn spawn(self: &Arc<Self>) -> TendHandle {
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let tender = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tender.config.tend.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tender.tend().await;
                    }
                    command = command_rx.recv() => {
                        match command {
                            Some(TendCommand::Shutdown(ack)) => {
                                let _ = ack.send(());
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("tend task stopped");
        });

        TendHandle { command_tx, handle }
    }

    /// Run one tend cycle.
    pub async fn tend(&self) {
        // With nothing left to ask, fall back to the original seeds.
        if self.topology.node_count() == 0 {
            self.seed().await;
        }

        let nodes = self.topology.nodes();
        for node in nodes.iter() {
            node.reset_tend_state();
        }

        // Probe every active node; collect previously unknown peers.
        let mut candidates: HashMap<String, Peer> = HashMap::new();
        let mut refreshed = 0usize;

        for node in nodes.iter().filter(|n| n.is_active()) {
            match self.refresh_node(node).await {
                Ok(peers) => {
                    refreshed += 1;
                    for peer in peers {
                        self.track_peer(peer, &mut candidates);
                    }
                }
                Err(e) => {
                    node.decrease_health();
                    warn!(node = %node, error = %e, "node refresh failed");
                }
            }
        }

        let rounds = if refreshed > 0 {
            self.rounds.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.rounds.load(Ordering::Relaxed)
        };

        // A brand-new peer becomes a node only after its own probe succeeds.
        let mut additions = Vec::new();
        for peer in candidates.into_values() {
            if let Some(node) = self.create_node_from_peer(&peer).await {
                additions.push(node);
            }
        }

        let removals: Vec<Arc<Node>> = nodes
            .iter()
            .filter(|node| self.should_drop(nodes.len(), rounds, node))
            .cloned()
            .collect();

        // Removals first, additions second; each is one wholesale swap.
        if !removals.is_empty() {
            for node in &removals {
                tinfo!(node = %node, "removing node from cluster");
                node.close().await;
            }
            self.topology.apply_removals(&removals);
        }
        if !additions.is_empty() {
            for node in &additions {
                tinfo!(node = %node, "adding node to cluster");
            }
            self.topology.apply_additions(&additions);
        }
        if !removals.is_empty() || !additions.is_empty() {
            self.rounds.store(0, Ordering::Relaxed);
        }

        // Pool upkeep on the surviving set.
        for node in self.topology.nodes().iter() {
            node.sweep_idle_connections().await;
            if let Err(e) = node.fill_min_connections(self.config.min_conns_per_node).await {
                debug!(node = %node, error = %e, "min pool fill failed");
            }
        }
    }

    /// Probe the configured seed hosts and register every distinct node
    /// that answers.
    async fn seed(&self) {
        let mut additions: HashMap<String, Arc<Node>> = HashMap::new();

        for host in &self.config.seeds {
            match self.probe_host(host).await {
                Ok(node) => {
                    additions.entry(node.name().to_string()).or_insert(node);
                }
                Err(e) => {
                    warn!(seed = %host, error = %e, "seed probe failed");
                }
            }
        }

        if !additions.is_empty() {
            let additions: Vec<_> = additions.into_values().collect();
            tinfo!(count = additions.len(), "seeded cluster from configured hosts");
            self.topology.apply_additions(&additions);
        }
    }

    /// Refresh one node: verify identity, pull peers, rack ids and, when
    /// the ownership generation moved, its partition bitmaps.
    async fn refresh_node(&self, node: &Arc<Node>) -> Result<Vec<Peer>> {
        let timeout = self.config.tend.info_timeout;
        let mut conn = node.get_connection().await?;

        let mut values = match info::request(
            &mut conn,
            &["node", "peers", "partition-generation", "racks"],
            timeout,
        )
        .await
        {
            Ok(values) => values,
            Err(e) => {
                node.discard_connection(conn).await;
                return Err(e);
            }
        };
        node.put_connection(conn).await;

        // A different name on the same address means the process was
        // replaced; stop trusting this node and let the policy reap it.
        match values.remove("node") {
            Some(name) if name == node.name() => {}
            Some(name) => {
                return Err(Error::Parse(format!(
                    "node identity changed from {} to {name}",
                    node.name()
                )));
            }
            None => return Err(Error::Parse("refresh response missing node name".into())),
        }

        node.set_responded();
        node.restore_health();

        if let Some(racks) = values.remove("racks") {
            node.set_racks(info::parse_racks(&racks));
        }

        let generation = values
            .remove("partition-generation")
            .and_then(|g| g.parse::<i64>().ok())
            .ok_or_else(|| Error::Parse("refresh response missing partition generation".into()))?;
        if node.update_partition_generation(generation) {
            self.refresh_partitions(node).await?;
        }

        let peers = values
            .remove("peers")
            .ok_or_else(|| Error::Parse("refresh response missing peers".into()))?;
        Ok(info::parse_peers(&peers)?.peers)
    }

    /// Pull and merge a node's ownership bitmaps.
    async fn refresh_partitions(&self, node: &Arc<Node>) -> Result<()> {
        let timeout = self.config.tend.info_timeout;
        let mut conn = node.get_connection().await?;

        let value = match info::request_single(&mut conn, "replicas", timeout).await {
            Ok(value) => value,
            Err(e) => {
                node.discard_connection(conn).await;
                return Err(e);
            }
        };
        node.put_connection(conn).await;

        let namespaces = info::parse_replicas(&value)?;
        debug!(node = %node, namespaces = namespaces.len(), "merging partition maps");
        self.topology.merge_partitions(node, &namespaces);
        Ok(())
    }

    /// Account one reported peer: a known node gains a peer reference (and
    /// any newly learned aliases); an unknown one becomes a probe candidate.
    fn track_peer(&self, peer: Peer, candidates: &mut HashMap<String, Peer>) {
        if let Some(existing) = self.topology.node_by_name(&peer.name) {
            existing.inc_peer_refs();
            for host in &peer.hosts {
                if self.topology.node_by_host(host).is_none() {
                    self.topology.add_alias(host.clone(), &existing);
                }
            }
            return;
        }
        candidates.entry(peer.name.clone()).or_insert(peer);
    }

    /// Probe a new peer's hosts until one confirms the expected identity.
    async fn create_node_from_peer(&self, peer: &Peer) -> Option<Arc<Node>> {
        for host in &peer.hosts {
            match self.probe_host(host).await {
                Ok(node) if node.name() == peer.name => {
                    for alias in &peer.hosts {
                        node.add_alias(alias.clone());
                    }
                    return Some(node);
                }
                Ok(node) => {
                    warn!(
                        host = %host,
                        expected = %peer.name,
                        reported = %node.name(),
                        "peer identity mismatch"
                    );
                }
                Err(e) => {
                    debug!(host = %host, error = %e, "peer probe failed");
                }
            }
        }
        None
    }

    /// Resolve a host, connect and run the identity probe.
    async fn probe_host(&self, host: &Host) -> Result<Arc<Node>> {
        let addr = resolve_address(host).await?;
        let mut conn = Connection::connect(addr, self.config.connect_timeout).await?;

        let probe = info::request(
            &mut conn,
            &["node", "features", "cluster-name"],
            self.config.tend.info_timeout,
        )
        .await;
        conn.close().await;
        let mut values = probe?;

        let name = values
            .remove("node")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::Parse(format!("host {host} did not report a node name")))?;

        let features = values.remove("features").unwrap_or_default();
        if !features.split(';').any(|f| f == "peers") {
            return Err(Error::Parse(format!(
                "host {host} lacks the peers protocol capability"
            )));
        }

        if let Some(expected) = &self.config.cluster_name {
            match values.remove("cluster-name") {
                Some(actual) if actual == *expected => {}
                other => {
                    return Err(Error::Parse(format!(
                        "host {host} belongs to cluster {other:?}, expected {expected}"
                    )));
                }
            }
        }

        Ok(Arc::new(Node::new(name, host.clone(), addr, &self.config)))
    }

    /// The tiered removal decision.
    ///
    /// Probing happens before removal so a transient error cannot flap a
    /// node out, and peer references protect a node its peers still claim
    /// even when this client's own probe failed.
    fn should_drop(&self, cluster_size: usize, rounds: u64, node: &Arc<Node>) -> bool {
        match cluster_size {
            0 => false,
            // Sole node: only give it up once its health is exhausted.
            1 => node.is_unhealthy(),
            2 => {
                rounds >= self.config.tend.two_node_removal_rounds
                    && node.peer_refs() == 0
                    && !node.responded()
            }
            _ => {
                rounds >= self.config.tend.removal_rounds
                    && node.peer_refs() == 0
                    && (!node.responded() || !self.topology.owns_any_partition(node))
            }
        }
    }
}

async fn resolve_address(host: &Host) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(host.address())
        .await
        .map_err(|e| Error::connection(host.address(), e))?;
    addrs
        .next()
        .ok_or_else(|| Error::connection(host.address(), "no addresses resolved"))
}
