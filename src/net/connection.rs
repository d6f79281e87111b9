//! A single client connection with length-prefixed framing.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Upper bound on a single frame. Anything larger is treated as a framing
/// desync rather than a legitimate response.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// One TCP connection to a server node.
///
/// Frames are a u32 big-endian length prefix followed by the payload. The
/// connection tracks when it was last used so the pool can evict idle
/// entries.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
    id: u64,
    last_used: Instant,
}

impl Connection {
    /// Open a connection, bounded by `timeout`.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::connection(addr, "connect timed out"))?
            .map_err(|e| Error::connection(addr, e))?;

        // Admin exchanges and small commands dominate; batching hurts latency.
        let _ = stream.set_nodelay(true);

        Ok(Self {
            stream,
            addr,
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            last_used: Instant::now(),
        })
    }

    /// Wrap an accepted stream. Used by in-process test servers.
    pub(crate) fn from_stream(stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            last_used: Instant::now(),
        }
    }

    /// The remote address this connection points at.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// How long this connection has sat unused.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Whether the connection is still fit for reuse.
    pub fn is_valid(&self, max_idle: Duration) -> bool {
        self.idle_for() <= max_idle
    }

    /// Record a use, resetting the idle clock.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Write one framed payload, bounded by `timeout`.
    pub async fn write_frame(&mut self, payload: &[u8], timeout: Duration) -> Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::Parse(format!(
                "outgoing frame of {} bytes exceeds limit",
                payload.len()
            )));
        }

        let mut framed = BytesMut::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);

        let addr = self.addr;
        let write = async {
            self.stream.write_all(&framed).await?;
            self.stream.flush().await
        };
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| Error::connection(addr, "write timed out"))?
            .map_err(|e| Error::connection(addr, e))?;

        self.last_used = Instant::now();
        Ok(())
    }

    /// Read one framed payload, bounded by `timeout`.
    pub async fn read_frame(&mut self, timeout: Duration) -> Result<Bytes> {
        let addr = self.addr;

        let mut len_buf = [0u8; 4];
        tokio::time::timeout(timeout, self.stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| Error::connection(addr, "read timed out"))?
            .map_err(|e| Error::connection(addr, e))?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Parse(format!(
                "incoming frame of {len} bytes exceeds limit"
            )));
        }

        let mut payload = vec![0u8; len];
        tokio::time::timeout(timeout, self.stream.read_exact(&mut payload))
            .await
            .map_err(|_| Error::connection(addr, "read timed out"))?
            .map_err(|e| Error::connection(addr, e))?;

        self.last_used = Instant::now();
        Ok(Bytes::from(payload))
    }

    /// Close the connection, flushing any pending shutdown handshake.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
