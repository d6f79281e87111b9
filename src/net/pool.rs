//! Bounded LIFO connection pool.
//!
//! The pool holds idle connections newest-first and tracks the total number
//! of connections it has accounted for (idle plus handed-out plus opens in
//! flight) against a fixed capacity. The lock guards only the backing store
//! and counters; socket close always happens after the lock is released so
//! I/O never blocks other pool operations.

use crate::net::connection::Connection;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently handed out or being opened.
    pub in_use: usize,
    /// Idle connections sitting in the pool.
    pub pooled: usize,
    /// Connections opened over the pool's lifetime.
    pub opened: usize,
    /// Connections closed over the pool's lifetime.
    pub closed: usize,
}

struct PoolInner {
    /// Idle connections, oldest at the front, newest at the back.
    idle: VecDeque<Connection>,

    /// Idle + handed-out + reserved. Never exceeds capacity.
    total: usize,
}

/// A bounded LIFO stack of reusable connections for one node.
pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl ConnectionPool {
    /// Create a pool with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                idle: VecDeque::with_capacity(capacity),
                total: 0,
            }),
            capacity,
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    /// The fixed capacity bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pop the most recently pushed idle connection, if any. The connection
    /// stays accounted in the total until returned or discarded.
    pub fn try_pop(&self) -> Option<Connection> {
        self.inner.lock().idle.pop_back()
    }

    /// Reserve a slot for a new connection about to be opened. Fails when
    /// the pool is at capacity.
    pub fn try_reserve(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.total < self.capacity {
            inner.total += 1;
            true
        } else {
            false
        }
    }

    /// Release a reservation whose connect attempt failed.
    pub fn cancel_reservation(&self) {
        let mut inner = self.inner.lock();
        inner.total = inner.total.saturating_sub(1);
    }

    /// Record a successful open against an existing reservation.
    pub fn record_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a handed-out connection to the pool. Fails (handing the
    /// connection back to the caller, state untouched) when the idle stack
    /// is full.
    pub fn try_push(&self, conn: Connection) -> Result<(), Connection> {
        let mut inner = self.inner.lock();
        if inner.idle.len() < self.capacity {
            inner.idle.push_back(conn);
            Ok(())
        } else {
            Err(conn)
        }
    }

    /// Drop a handed-out (or just-popped) connection from the accounting and
    /// close it. The close happens outside the lock.
    pub async fn discard(&self, conn: Connection) {
        {
            let mut inner = self.inner.lock();
            inner.total = inner.total.saturating_sub(1);
        }
        self.closed.fetch_add(1, Ordering::Relaxed);
        conn.close().await;
    }

    /// Evict idle connections that have outlived `max_idle`.
    ///
    /// Entries are ordered oldest to newest from the front, so the scan
    /// stops at the first still-fresh entry. Returns the number evicted.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let evicted = {
            let mut inner = self.inner.lock();
            let mut evicted = Vec::new();
            while let Some(front) = inner.idle.front() {
                if front.is_valid(max_idle) {
                    break;
                }
                // Unwrap is fine: front() just proved non-empty.
                evicted.push(inner.idle.pop_front().unwrap());
            }
            inner.total = inner.total.saturating_sub(evicted.len());
            evicted
        };

        let count = evicted.len();
        self.closed.fetch_add(count, Ordering::Relaxed);
        for conn in evicted {
            conn.close().await;
        }
        count
    }

    /// Remove every idle connection, closing each outside the lock. Used on
    /// node shutdown.
    pub async fn drain(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            let drained: Vec<_> = inner.idle.drain(..).collect();
            inner.total = inner.total.saturating_sub(drained.len());
            drained
        };

        self.closed.fetch_add(drained.len(), Ordering::Relaxed);
        for conn in drained {
            conn.close().await;
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        let (pooled, total) = {
            let inner = self.inner.lock();
            (inner.idle.len(), inner.total)
        };
        PoolStats {
            in_use: total - pooled,
            pooled,
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.capacity)
            .field("pooled", &stats.pooled)
            .field("in_use", &stats.in_use)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Spawn a listener that accepts and parks connections so test sockets
    /// stay open.
    async fn sink_listener() -> std::net::SocketAddr {
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

    async fn open(addr: std::net::SocketAddr) -> Connection {
        Connection::connect(addr, Duration::from_secs(1)).await.unwrap()
    }

    #[tokio::test]
    async fn test_lifo_order() {
        let addr = sink_listener().await;
        let pool = ConnectionPool::new(4);

        let mut ids = Vec::new();
        for _ in 0..4 {
            assert!(pool.try_reserve());
            let conn = open(addr).await;
            ids.push(conn.id());
            pool.try_push(conn).unwrap();
        }

        // Pops come back newest first.
        for expected in ids.iter().rev() {
            let conn = pool.try_pop().unwrap();
            assert_eq!(conn.id(), *expected);
            pool.discard(conn).await;
        }
        assert!(pool.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let addr = sink_listener().await;
        let pool = ConnectionPool::new(2);

        assert!(pool.try_reserve());
        assert!(pool.try_reserve());
        assert!(!pool.try_reserve(), "third reservation must fail");

        let a = open(addr).await;
        let b = open(addr).await;
        pool.try_push(a).unwrap();
        pool.try_push(b).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.pooled, 2);
        assert_eq!(stats.in_use, 0);

        // A push beyond the idle bound fails without mutating state.
        assert!(!pool.try_reserve());
        let extra = Connection::connect(addr, Duration::from_secs(1)).await.unwrap();
        let rejected = pool.try_push(extra);
        assert!(rejected.is_err());
        assert_eq!(pool.stats().pooled, 2);
        rejected.unwrap_err().close().await;
    }

    #[tokio::test]
    async fn test_idle_sweep_stops_at_fresh_entry() {
        let addr = sink_listener().await;
        let pool = ConnectionPool::new(4);

        for _ in 0..2 {
            assert!(pool.try_reserve());
            pool.try_push(open(addr).await).unwrap();
        }

        // Let the first two age, then add a fresh one.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.try_reserve());
        pool.try_push(open(addr).await).unwrap();

        let evicted = pool.sweep_idle(Duration::from_millis(25)).await;
        assert_eq!(evicted, 2);

        let stats = pool.stats();
        assert_eq!(stats.pooled, 1);
        assert_eq!(stats.closed, 2);

        // Nothing fresh gets evicted on a second pass.
        assert_eq!(pool.sweep_idle(Duration::from_millis(25)).await, 0);
    }

    #[tokio::test]
    async fn test_drain_closes_everything() {
        let addr = sink_listener().await;
        let pool = ConnectionPool::new(3);

        for _ in 0..3 {
            assert!(pool.try_reserve());
            pool.try_push(open(addr).await).unwrap();
        }

        pool.drain().await;
        let stats = pool.stats();
        assert_eq!(stats.pooled, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.closed, 3);
        assert!(pool.try_reserve(), "capacity is free again after drain");
    }
}
