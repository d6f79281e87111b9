//! Rust client for the Keel distributed key-value store.
//!
//! This crate owns the cluster-facing core of the client:
//! - **Topology tending**: a background task that continuously rediscovers
//!   cluster membership and partition ownership
//! - **Connection pooling**: a bounded LIFO pool of reusable connections
//!   per node, with idle eviction
//! - **Partition routing**: key digest to partition to node resolution
//!   under configurable replica policies, including rack awareness
//! - **Retrying execution**: a bounded retry loop with deadline budgeting,
//!   health scoring and in-doubt tracking for writes
//! - **Batch fan-out**: multi-key operations split per node and re-routed
//!   across retry rounds
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_client::{Client, ClientConfig, Key};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("127.0.0.1:3000,127.0.0.2:3000")?
//!         .with_pool_size(1, 64)
//!         .with_rack_id(2);
//!
//!     let client = Client::connect(config).await?;
//!
//!     // Partition-aware lookups for building commands on top.
//!     let key = Key::new("users", "profiles", b"alice");
//!     if let Some(node) = client.node_for_key(&key, 0) {
//!         println!("master for {:?} is {}", key.digest, node);
//!     }
//!
//!     println!("pooled connections: {}", client.stats().pooled());
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  Client                     │
//! │   execute / execute_batch / lookups         │
//! └─────────────────────────────────────────────┘
//!          │                │
//!          ▼                ▼
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Executor   │   │ BatchRouter  │──▶│ PartitionMaps │
//! └─────────────┘   └──────────────┘   └───────────────┘
//!          │                                   ▲
//!          ▼                                   │ merges
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │    Node     │◀──│   Topology   │◀──│    Tender     │
//! │  (+ pool)   │   │  (snapshots) │   │ (background)  │
//! └─────────────┘   └──────────────┘   └───────────────┘
//! ```
//!
//! # Consistency model
//!
//! The tend task is the sole writer of the shared topology; readers work on
//! copy-on-write snapshots and never block it. Replica policies trade
//! locality and staleness per command; strong-consistency read modes refuse
//! partitions whose ownership is mid-migration instead of guessing.

pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod metrics;
pub mod net;
pub mod routing;
pub mod testing;
pub mod types;

pub use client::Client;
pub use cluster::host::Host;
pub use cluster::node::Node;
pub use cluster::tender::{TendHandle, Tender};
pub use cluster::topology::Topology;
pub use command::batch::{BatchEntry, BatchExecutor, BatchOutcome, BatchRouter};
pub use command::executor::{Command, Executor};
pub use config::{BatchPolicy, ClientConfig, CommandPolicy, TendConfig};
pub use error::{result_code, Error, Result};
pub use metrics::{ClientStats, NodeStats};
pub use net::connection::Connection;
pub use net::pool::PoolStats;
pub use routing::{PartitionStatus, PartitionTracker, ReadModeSc, Replica};
pub use types::{Key, KeyDigest, PARTITIONS};
