//! Error types for the client.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Server result codes this client cares about.
///
/// The full code space belongs to the wire layer; these are the codes the
/// retry engine has to recognise.
pub mod result_code {
    /// Operation succeeded.
    pub const OK: i32 = 0;
    /// Record does not exist.
    pub const KEY_NOT_FOUND: i32 = 2;
    /// Record was excluded by a predicate filter.
    pub const FILTERED_OUT: i32 = 27;
    /// Server asked the client to retry elsewhere.
    pub const PARTITION_UNAVAILABLE: i32 = 30;
}

/// Main error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket-level failure. Always retryable; the connection carrying the
    /// request is closed, never returned to the pool.
    #[error("connection error to {addr}: {reason}")]
    Connection {
        addr: String,
        reason: String,
        /// True when a write request may have reached the server before the
        /// connection failed, so its outcome is unknown.
        in_doubt: bool,
    },

    /// No reachable node could be resolved for the requested partition.
    /// Retryable once the fallback path or the next tend pass repairs the map.
    #[error("no node available for namespace {namespace} partition {partition_id}")]
    InvalidNode {
        namespace: String,
        partition_id: usize,
    },

    /// The active node list is empty.
    #[error("no nodes available in cluster")]
    NoAvailableNode,

    /// The operation deadline or retry budget was exhausted.
    #[error(
        "operation timed out after {attempts} attempts \
         ({failed_nodes} node failures, {failed_conns} connection failures)"
    )]
    Timeout {
        attempts: u32,
        failed_nodes: u32,
        failed_conns: u32,
        elapsed: Duration,
        in_doubt: bool,
    },

    /// The server returned an error code for the request.
    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    /// A response could not be parsed. Fatal for the attempt; the connection
    /// is discarded since its framing can no longer be trusted.
    #[error("parse error: {0}")]
    Parse(String),

    /// The node's connection pool is at capacity with no idle connection.
    #[error("no more connections available for node {node}")]
    PoolExhausted { node: String },

    /// The node or client has been closed.
    #[error("node {0} is inactive")]
    Inactive(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error outside an established connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a connection error from an I/O failure against an address.
    pub fn connection(addr: impl ToString, err: impl ToString) -> Self {
        Error::Connection {
            addr: addr.to_string(),
            reason: err.to_string(),
            in_doubt: false,
        }
    }

    /// Whether the execution engine may retry after this error.
    ///
    /// Server errors are terminal here except the benign allow-list handled
    /// by callers via [`Error::is_benign`].
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection { .. }
            | Error::InvalidNode { .. }
            | Error::NoAvailableNode
            | Error::PoolExhausted { .. } => true,
            Error::Server { code, .. } => *code == result_code::PARTITION_UNAVAILABLE,
            _ => false,
        }
    }

    /// Server errors that callers commonly treat as success-shaped outcomes:
    /// deleting an absent record, or a record filtered out by a predicate.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Error::Server { code, .. }
                if *code == result_code::KEY_NOT_FOUND || *code == result_code::FILTERED_OUT
        )
    }

    /// Whether a write's outcome is unknown (it may have been applied by the
    /// server even though the client saw a failure).
    pub fn in_doubt(&self) -> bool {
        match self {
            Error::Connection { in_doubt, .. } | Error::Timeout { in_doubt, .. } => *in_doubt,
            _ => false,
        }
    }

    /// Mark this error as in-doubt. No-op for variants that cannot carry the
    /// flag.
    pub fn set_in_doubt(&mut self) {
        match self {
            Error::Connection { in_doubt, .. } | Error::Timeout { in_doubt, .. } => {
                *in_doubt = true;
            }
            _ => {}
        }
    }
}
