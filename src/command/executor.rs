//! Single-command execution with bounded retries.
//!
//! Each attempt walks prepare → send → receive; the outer loop re-enters
//! prepare on retryable failures until success, the retry budget runs out,
//! or the operation deadline (fixed once at start) can no longer fit
//! another attempt.

use crate::cluster::topology::Topology;
use crate::config::CommandPolicy;
use crate::error::{Error, Result};
use crate::net::connection::Connection;
use crate::routing::resolve_node;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One request/response exchange the engine can drive.
///
/// Implementations own the wire encoding; the engine owns node resolution,
/// connection lifecycle, health bookkeeping and retries.
#[async_trait]
pub trait Command: Send {
    /// Namespace the command targets.
    fn namespace(&self) -> &str;

    /// Partition the command targets.
    fn partition_id(&self) -> usize;

    /// Whether this command mutates data. Failed writes that may have been
    /// transmitted are reported in-doubt, never assumed failed.
    fn is_write(&self) -> bool;

    /// Encode and send the request over the connection.
    async fn write_request(&mut self, conn: &mut Connection, timeout: Duration) -> Result<()>;

    /// Read and decode the response. Server-reported failures surface as
    /// [`Error::Server`]; the connection itself is still considered good.
    async fn read_response(&mut self, conn: &mut Connection, timeout: Duration) -> Result<()>;
}

/// Drives commands against the cluster.
pub struct Executor {
    topology: Arc<Topology>,
    rack_id: Option<u32>,
}

impl Executor {
    /// Create an executor over a topology directory.
    pub fn new(topology: Arc<Topology>, rack_id: Option<u32>) -> Self {
        Self { topology, rack_id }
    }

    /// Execute a command to completion under the given policy.
    pub async fn execute<C: Command>(&self, policy: &CommandPolicy, cmd: &mut C) -> Result<()> {
        let start = Instant::now();
        let deadline = start + policy.total_timeout;

        let mut attempts: u32 = 0;
        let mut failed_nodes: u32 = 0;
        let mut failed_conns: u32 = 0;
        let mut in_doubt = false;
        let mut sequence: usize = 0;

        loop {
            attempts += 1;
            let error = match self.attempt(policy, cmd, sequence).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            in_doubt |= error.in_doubt();

            if !error.is_retryable() {
                debug!(error = %error, attempts, "command failed fatally");
                return Err(error);
            }

            match &error {
                Error::Connection { .. } => failed_conns += 1,
                _ => failed_nodes += 1,
            }

            let give_up = attempts > policy.max_retries
                || deadline
                    .checked_duration_since(Instant::now())
                    .map_or(true, |remaining| remaining <= policy.sleep_between_retries);

            if give_up {
                warn!(
                    attempts,
                    failed_nodes,
                    failed_conns,
                    last_error = %error,
                    "command retries exhausted"
                );
                return Err(Error::Timeout {
                    attempts,
                    failed_nodes,
                    failed_conns,
                    elapsed: start.elapsed(),
                    in_doubt,
                });
            }

            if !policy.sleep_between_retries.is_zero() {
                tokio::time::sleep(policy.sleep_between_retries).await;
            }
            sequence += 1;
        }
    }

    /// One attempt: resolve a node, run the exchange, settle the connection
    /// and the node's health according to the outcome.
    async fn attempt<C: Command>(
        &self,
        policy: &CommandPolicy,
        cmd: &mut C,
        sequence: usize,
    ) -> Result<()> {
        let node = resolve_node(
            &self.topology,
            policy,
            cmd.namespace(),
            cmd.partition_id(),
            self.rack_id,
            sequence,
        )?;

        let mut conn = node.get_connection().await?;

        if let Err(mut e) = cmd.write_request(&mut conn, policy.socket_timeout).await {
            // The request may be sitting partially on the wire.
            node.discard_connection(conn).await;
            if matches!(e, Error::Connection { .. }) {
                node.decrease_health();
                if cmd.is_write() {
                    e.set_in_doubt();
                }
            }
            return Err(e);
        }

        match cmd.read_response(&mut conn, policy.socket_timeout).await {
            Ok(()) => {
                node.restore_health();
                node.put_connection(conn).await;
                Ok(())
            }
            Err(mut e) => {
                match &e {
                    // The exchange itself completed; the server said no.
                    Error::Server { .. } => {
                        node.restore_health();
                        node.put_connection(conn).await;
                    }
                    Error::Connection { .. } => {
                        node.decrease_health();
                        node.discard_connection(conn).await;
                        if cmd.is_write() {
                            e.set_in_doubt();
                        }
                    }
                    // Parse desync and anything else: the stream can no
                    // longer be trusted.
                    _ => {
                        node.discard_connection(conn).await;
                    }
                }
                Err(e)
            }
        }
    }
}
