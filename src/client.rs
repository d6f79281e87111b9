//! The client entry point.

use crate::cluster::node::Node;
use crate::cluster::tender::{TendHandle, Tender};
use crate::cluster::topology::Topology;
use crate::command::batch::{BatchExecutor, BatchOutcome, BatchRouter};
use crate::command::executor::{Command, Executor};
use crate::config::{BatchPolicy, ClientConfig, CommandPolicy};
use crate::error::Result;
use crate::metrics::ClientStats;
use crate::types::Key;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// A connected client for one cluster.
///
/// Owns the topology directory and the background tend task. Cheap to share
/// behind an `Arc`; all operations take `&self`.
pub struct Client {
    config: Arc<ClientConfig>,
    topology: Arc<Topology>,
    executor: Executor,
    tend_handle: Mutex<Option<TendHandle>>,
}

impl Client {
    /// Connect to the cluster behind the configured seed hosts.
    ///
    /// Discovery is repeated until the membership view stabilizes or the
    /// warm-up deadline passes; the background tend task then keeps the
    /// view fresh until [`Client::close`].
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let topology = Arc::new(Topology::new());

        let tender = Tender::new(topology.clone(), config.clone());
        tender.warm_up().await?;
        let tend_handle = tender.spawn();

        info!(nodes = topology.node_count(), "connected to cluster");

        Ok(Self {
            executor: Executor::new(topology.clone(), config.rack_id),
            config,
            topology,
            tend_handle: Mutex::new(Some(tend_handle)),
        })
    }

    /// The shared topology directory.
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether at least one node is currently usable.
    pub fn is_connected(&self) -> bool {
        self.topology.nodes().iter().any(|n| n.is_active())
    }

    // ------------------------------------------------------------- lookups

    /// All nodes in the current snapshot.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.topology.nodes().as_ref().clone()
    }

    /// A node by its stable name.
    pub fn node_by_name(&self, name: &str) -> Option<Arc<Node>> {
        self.topology.node_by_name(name)
    }

    /// A uniformly random active node.
    pub fn random_node(&self) -> Result<Arc<Node>> {
        self.topology.random_node()
    }

    /// The node mapped for a key at a replica level, if the partition map
    /// has it.
    pub fn node_for_key(&self, key: &Key, replica_index: usize) -> Option<Arc<Node>> {
        self.topology
            .node_for_partition(&key.namespace, key.partition_id(), replica_index)
    }

    // ------------------------------------------------------------ commands

    /// Execute a command under the client's default policy.
    pub async fn execute<C: Command>(&self, cmd: &mut C) -> Result<()> {
        self.executor.execute(&self.config.command, cmd).await
    }

    /// Execute a command under an explicit policy.
    pub async fn execute_with<C: Command>(
        &self,
        policy: &CommandPolicy,
        cmd: &mut C,
    ) -> Result<()> {
        self.executor.execute(policy, cmd).await
    }

    /// Build a batch router around a sub-command executor.
    pub fn batch_router<E: BatchExecutor>(&self, executor: Arc<E>) -> BatchRouter<E> {
        BatchRouter::new(self.topology.clone(), executor, self.config.rack_id)
    }

    /// Execute a multi-key batch under the client's default batch policy.
    pub async fn execute_batch<E: BatchExecutor>(
        &self,
        executor: Arc<E>,
        keys: &[Key],
    ) -> Result<Vec<BatchOutcome<E::Record>>> {
        self.batch_router(executor)
            .execute(&self.config.batch, keys)
            .await
    }

    /// Execute a multi-key batch under an explicit policy.
    pub async fn execute_batch_with<E: BatchExecutor>(
        &self,
        policy: &BatchPolicy,
        executor: Arc<E>,
        keys: &[Key],
    ) -> Result<Vec<BatchOutcome<E::Record>>> {
        self.batch_router(executor).execute(policy, keys).await
    }

    // --------------------------------------------------------------- misc

    /// Statistics snapshot across all nodes.
    pub fn stats(&self) -> ClientStats {
        ClientStats::collect(&self.topology)
    }

    /// Stop the tend task and release every node's connections. Idempotent.
    pub async fn close(&self) {
        let handle = self.tend_handle.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;

            let nodes = self.topology.nodes();
            for node in nodes.iter() {
                node.close().await;
            }
            self.topology.apply_removals(&nodes);
            info!("client closed");
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("nodes", &self.topology.node_count())
            .field("connected", &self.is_connected())
            .finish()
    }
}
