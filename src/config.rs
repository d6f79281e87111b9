//! Configuration types for the client.

use crate::cluster::host::Host;
use crate::routing::{ReadModeSc, Replica};
use std::time::Duration;

/// Main configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seed hosts used for the initial cluster discovery and for reseeding
    /// when every known node has been lost.
    pub seeds: Vec<Host>,

    /// Expected cluster name. When set, nodes reporting a different name are
    /// rejected during the identity probe.
    pub cluster_name: Option<String>,

    /// Minimum number of pooled connections kept per node.
    pub min_conns_per_node: usize,

    /// Maximum number of connections (pooled plus in-use) per node.
    pub max_conns_per_node: usize,

    /// Pooled connections idle longer than this are evicted.
    pub idle_timeout: Duration,

    /// Timeout for establishing a TCP connection to a node.
    pub connect_timeout: Duration,

    /// Rack id of this client, used by [`Replica::PreferRack`].
    pub rack_id: Option<u32>,

    /// Background tend (topology refresh) configuration.
    pub tend: TendConfig,

    /// Default per-command policy.
    pub command: CommandPolicy,

    /// Default batch policy.
    pub batch: BatchPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            cluster_name: None,
            min_conns_per_node: 1,
            max_conns_per_node: 100,
            idle_timeout: Duration::from_secs(55),
            connect_timeout: Duration::from_secs(5),
            rack_id: None,
            tend: TendConfig::default(),
            command: CommandPolicy::default(),
            batch: BatchPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration from a seed host string such as
    /// `"10.0.0.1:3000,10.0.0.2:3000"`.
    pub fn new(seeds: &str) -> crate::Result<Self> {
        let seeds = Host::parse_list(seeds)?;
        Ok(Self {
            seeds,
            ..Default::default()
        })
    }

    /// Create a configuration from pre-built seed hosts.
    pub fn with_seeds(seeds: Vec<Host>) -> Self {
        Self {
            seeds,
            ..Default::default()
        }
    }

    /// Set the expected cluster name.
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = Some(name.into());
        self
    }

    /// Set the per-node connection pool bounds.
    pub fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.min_conns_per_node = min;
        self.max_conns_per_node = max;
        self
    }

    /// Set the pooled-connection idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set this client's rack id.
    pub fn with_rack_id(mut self, rack_id: u32) -> Self {
        self.rack_id = Some(rack_id);
        self
    }

    /// Set the tend configuration.
    pub fn with_tend_config(mut self, tend: TendConfig) -> Self {
        self.tend = tend;
        self
    }

    /// Set the default command policy.
    pub fn with_command_policy(mut self, command: CommandPolicy) -> Self {
        self.command = command;
        self
    }

    /// Set the default batch policy.
    pub fn with_batch_policy(mut self, batch: BatchPolicy) -> Self {
        self.batch = batch;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.seeds.is_empty() {
            return Err(crate::Error::Config("no seed hosts configured".into()));
        }
        if self.max_conns_per_node == 0 {
            return Err(crate::Error::Config(
                "max_conns_per_node must be at least 1".into(),
            ));
        }
        if self.min_conns_per_node > self.max_conns_per_node {
            return Err(crate::Error::Config(format!(
                "min_conns_per_node {} exceeds max_conns_per_node {}",
                self.min_conns_per_node, self.max_conns_per_node
            )));
        }
        Ok(())
    }
}

/// Configuration for the background tend task.
#[derive(Debug, Clone)]
pub struct TendConfig {
    /// Interval between tend cycles.
    pub interval: Duration,

    /// Timeout applied to each admin info exchange during tending.
    pub info_timeout: Duration,

    /// Warm-up deadline: startup stops repeating discovery after this much
    /// time even if the cluster is only partially reachable.
    pub warmup_deadline: Duration,

    /// Successful refresh rounds required before an unreferenced node may be
    /// dropped from a two-node cluster. Tuning value co-designed with
    /// server-side migration behaviour.
    pub two_node_removal_rounds: u64,

    /// Successful refresh rounds required before an unreferenced node may be
    /// dropped from a cluster of three or more nodes.
    pub removal_rounds: u64,
}

impl Default for TendConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            info_timeout: Duration::from_secs(1),
            warmup_deadline: Duration::from_secs(3),
            two_node_removal_rounds: 1,
            removal_rounds: 2,
        }
    }
}

/// Per-command execution policy.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    /// Timeout applied to each socket I/O phase of an attempt.
    pub socket_timeout: Duration,

    /// Total operation deadline, fixed once at operation start and consumed
    /// across all retries.
    pub total_timeout: Duration,

    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,

    /// Delay between consecutive attempts.
    pub sleep_between_retries: Duration,

    /// Replica selection policy.
    pub replica: Replica,

    /// Read mode for strong-consistency namespaces.
    pub read_mode_sc: ReadModeSc,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(60),
            max_retries: 2,
            sleep_between_retries: Duration::from_millis(100),
            replica: Replica::Sequence,
            read_mode_sc: ReadModeSc::Session,
        }
    }
}

impl CommandPolicy {
    /// Set socket and total timeouts. The socket timeout is clamped to the
    /// total so per-attempt waits never outlive the operation deadline.
    pub fn with_timeouts(mut self, socket: Duration, total: Duration) -> Self {
        self.socket_timeout = socket.min(total);
        self.total_timeout = total;
        self
    }

    /// Set the retry budget.
    pub fn with_retries(mut self, max_retries: u32, sleep_between: Duration) -> Self {
        self.max_retries = max_retries;
        self.sleep_between_retries = sleep_between;
        self
    }

    /// Set the replica selection policy.
    pub fn with_replica(mut self, replica: Replica) -> Self {
        self.replica = replica;
        self
    }

    /// Set the strong-consistency read mode.
    pub fn with_read_mode_sc(mut self, mode: ReadModeSc) -> Self {
        self.read_mode_sc = mode;
        self
    }
}

/// Policy for multi-key batch operations.
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    /// Base per-attempt policy shared with single-key commands.
    pub base: CommandPolicy,

    /// Maximum number of node sub-commands in flight at once.
    pub max_concurrent_nodes: usize,

    /// Legacy wire form: split each node's sub-command further by namespace.
    pub split_by_namespace: bool,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            base: CommandPolicy::default(),
            max_concurrent_nodes: 16,
            split_by_namespace: false,
        }
    }
}

impl BatchPolicy {
    /// Set the fan-out concurrency bound.
    pub fn with_max_concurrent_nodes(mut self, max: usize) -> Self {
        self.max_concurrent_nodes = max.max(1);
        self
    }

    /// Enable or disable the legacy per-namespace grouping.
    pub fn with_split_by_namespace(mut self, split: bool) -> Self {
        self.split_by_namespace = split;
        self
    }
}
