//! Multi-key batch fan-out with per-round re-routing.
//!
//! Keys are resolved to their target nodes, grouped into one sub-command per
//! node (per node and namespace in the legacy wire form) and executed
//! concurrently under a bounded permit pool. Keys left without a definitive
//! result by a retryable sub-command failure are re-resolved with an
//! advanced replica sequence and regrouped into a fresh round; a slot that
//! already holds a definitive outcome is never overwritten.

use crate::cluster::node::Node;
use crate::cluster::topology::Topology;
use crate::config::BatchPolicy;
use crate::error::{Error, Result};
use crate::routing::resolve_node;
use crate::types::Key;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// One key of a batch, tagged with its position in the caller's request.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    /// Index into the caller's key list; results are reported under it.
    pub index: usize,

    /// The key to operate on.
    pub key: Key,
}

/// Definitive per-key outcome of a batch.
#[derive(Debug, Clone)]
pub enum BatchOutcome<R> {
    /// The sub-command produced a record-level result for this key.
    Done(R),

    /// The key failed with a terminal error.
    Failed(Arc<Error>),
}

/// Executes one grouped sub-command against one node.
///
/// The wire encoding of multi-key requests lives behind this seam. The
/// returned list holds per-entry results keyed by the caller index; entries
/// missing from it stay undecided and are re-routed in the next round. A
/// group-level retryable error leaves the whole group undecided; a fatal
/// error aborts the batch.
///
/// Implementations must check `stop` at their I/O boundaries and bail out
/// early once it reads true; an in-flight blocking read is only cut short
/// by its own socket timeout.
#[async_trait]
pub trait BatchExecutor: Send + Sync + 'static {
    /// Record-level result type.
    type Record: Send + 'static;

    /// Run the sub-command for `entries` against `node`.
    async fn execute_group(
        &self,
        node: Arc<Node>,
        entries: &[BatchEntry],
        stop: watch::Receiver<bool>,
    ) -> Result<Vec<(usize, Result<Self::Record>)>>;
}

/// Splits multi-key operations across nodes and re-routes partial failures.
pub struct BatchRouter<E: BatchExecutor> {
    topology: Arc<Topology>,
    executor: Arc<E>,
    rack_id: Option<u32>,
}

type Group = (Arc<Node>, Vec<BatchEntry>);

impl<E: BatchExecutor> BatchRouter<E> {
    /// Create a batch router over a topology directory.
    pub fn new(topology: Arc<Topology>, executor: Arc<E>, rack_id: Option<u32>) -> Self {
        Self {
            topology,
            executor,
            rack_id,
        }
    }

    /// Execute a batch, returning one definitive outcome per key, in key
    /// order.
    ///
    /// Returns an error only when a sub-command fails fatally (remaining
    /// sub-commands are told to stop and drained first) or when no key can
    /// be routed at all.
    pub async fn execute(
        &self,
        policy: &BatchPolicy,
        keys: &[Key],
    ) -> Result<Vec<BatchOutcome<E::Record>>> {
        let start = Instant::now();
        let deadline = start + policy.base.total_timeout;

        let mut slots: Vec<Option<BatchOutcome<E::Record>>> =
            (0..keys.len()).map(|_| None).collect();
        let (stop_tx, stop_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(policy.max_concurrent_nodes.max(1)));

        let mut attempts: u32 = 0;
        let mut sequence: usize = 0;

        loop {
            let pending: Vec<usize> = slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.is_none())
                .map(|(i, _)| i)
                .collect();
            if pending.is_empty() {
                break;
            }

            attempts += 1;
            let groups = self.group(policy, keys, &pending, sequence);

            debug!(
                round = attempts,
                pending = pending.len(),
                groups = groups.len(),
                "dispatching batch round"
            );

            let mut join = JoinSet::new();
            for (node, entries) in groups {
                let executor = self.executor.clone();
                let semaphore = semaphore.clone();
                let stop_rx = stop_rx.clone();
                join.spawn(async move {
                    // Closed only if the semaphore is, which it never is here.
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    let result = executor.execute_group(node, &entries, stop_rx).await;
                    (entries, result)
                });
            }

            // Drain every sub-command; one group's failure never touches its
            // siblings' results.
            let mut fatal: Option<Error> = None;
            while let Some(joined) = join.join_next().await {
                let (entries, result) = match joined {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(error = %e, "batch sub-command panicked");
                        continue;
                    }
                };

                match result {
                    Ok(records) => {
                        for (index, record) in records {
                            let Some(slot) = slots.get_mut(index) else {
                                continue;
                            };
                            // Definitive outcomes are write-once.
                            if slot.is_some() {
                                continue;
                            }
                            match record {
                                Ok(r) => *slot = Some(BatchOutcome::Done(r)),
                                Err(e) if e.is_retryable() => {}
                                Err(e) => *slot = Some(BatchOutcome::Failed(Arc::new(e))),
                            }
                        }
                    }
                    Err(e) if e.is_retryable() && fatal.is_none() => {
                        debug!(error = %e, keys = entries.len(), "sub-batch will be re-routed");
                    }
                    Err(e) => {
                        if fatal.is_none() {
                            // Tell the remaining sub-commands to wind down.
                            let _ = stop_tx.send(true);
                            fatal = Some(e);
                        }
                    }
                }
            }

            if let Some(fatal) = fatal {
                return Err(fatal);
            }

            let undecided = slots.iter().filter(|slot| slot.is_none()).count();
            if undecided == 0 {
                break;
            }

            let give_up = attempts > policy.base.max_retries
                || deadline
                    .checked_duration_since(Instant::now())
                    .map_or(true, |remaining| {
                        remaining <= policy.base.sleep_between_retries
                    });
            if give_up {
                let timeout = Arc::new(Error::Timeout {
                    attempts,
                    failed_nodes: undecided as u32,
                    failed_conns: 0,
                    elapsed: start.elapsed(),
                    in_doubt: false,
                });
                for slot in slots.iter_mut().filter(|slot| slot.is_none()) {
                    *slot = Some(BatchOutcome::Failed(timeout.clone()));
                }
                break;
            }

            if !policy.base.sleep_between_retries.is_zero() {
                tokio::time::sleep(policy.base.sleep_between_retries).await;
            }
            sequence += 1;
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.expect("every batch slot decided"))
            .collect())
    }

    /// Resolve each pending key and group by target node (and namespace in
    /// the legacy wire form). Unroutable keys stay undecided for the next
    /// round.
    fn group(
        &self,
        policy: &BatchPolicy,
        keys: &[Key],
        pending: &[usize],
        sequence: usize,
    ) -> Vec<Group> {
        let mut nodes: HashMap<String, Arc<Node>> = HashMap::new();
        let mut groups: HashMap<(String, Option<String>), Vec<BatchEntry>> = HashMap::new();

        for &index in pending {
            let key = &keys[index];
            let node = match resolve_node(
                &self.topology,
                &policy.base,
                &key.namespace,
                key.partition_id(),
                self.rack_id,
                sequence,
            ) {
                Ok(node) => node,
                Err(e) => {
                    debug!(error = %e, index, "batch key unroutable this round");
                    continue;
                }
            };

            let group_ns = policy.split_by_namespace.then(|| key.namespace.clone());
            nodes.insert(node.name().to_string(), node.clone());
            groups
                .entry((node.name().to_string(), group_ns))
                .or_default()
                .push(BatchEntry {
                    index,
                    key: key.clone(),
                });
        }

        groups
            .into_iter()
            .map(|((name, _), entries)| (nodes[&name].clone(), entries))
            .collect()
    }
}
