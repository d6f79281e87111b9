//! Core types shared across the client.

use sha2::{Digest as _, Sha256};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Number of partitions every namespace is divided into.
///
/// Fixed by the server's hashing scheme; every record falls into exactly one
/// of these buckets by key digest.
pub const PARTITIONS: usize = 4096;

/// Length of a key digest in bytes.
pub const DIGEST_LEN: usize = 20;

/// A record's digest: the server-side identity of a key.
pub type KeyDigest = [u8; DIGEST_LEN];

/// A fully qualified record key.
///
/// The digest is computed once at construction and is the only part of the
/// key the routing layer looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    /// Namespace the record lives in.
    pub namespace: String,

    /// Set within the namespace (may be empty).
    pub set: String,

    /// 20-byte digest identifying the record.
    pub digest: KeyDigest,
}

impl Key {
    /// Create a key from user key bytes, computing its digest.
    pub fn new(namespace: impl Into<String>, set: impl Into<String>, user_key: &[u8]) -> Self {
        let set = set.into();
        let digest = compute_digest(&set, user_key);
        Self {
            namespace: namespace.into(),
            set,
            digest,
        }
    }

    /// Create a key directly from an existing digest.
    pub fn from_digest(
        namespace: impl Into<String>,
        set: impl Into<String>,
        digest: KeyDigest,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            set: set.into(),
            digest,
        }
    }

    /// The partition this key falls into.
    pub fn partition_id(&self) -> usize {
        partition_id(&self.digest)
    }
}

/// Compute the digest for a set/key pair.
///
/// SHA-256 over `set || 0x00 || user_key`, truncated to 20 bytes. The server
/// applies the same function, so digests computed here are addressable
/// cluster-wide.
pub fn compute_digest(set: &str, user_key: &[u8]) -> KeyDigest {
    let mut hasher = Sha256::new();
    hasher.update(set.as_bytes());
    hasher.update([0u8]);
    hasher.update(user_key);
    let full = hasher.finalize();

    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&full[..DIGEST_LEN]);
    digest
}

/// Map a digest to its partition id.
///
/// Low 16 bits of XxHash64 over the digest, folded into the partition count.
/// Pure and deterministic: identical digests always land on the same
/// partition, across calls and across processes.
pub fn partition_id(digest: &KeyDigest) -> usize {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(digest);
    (hasher.finish() & 0xFFFF) as usize % PARTITIONS
}
