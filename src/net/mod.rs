//! Network layer: pooled connections, framing and the admin info protocol.

pub mod connection;
pub mod info;
pub mod pool;

pub use connection::Connection;
pub use pool::{ConnectionPool, PoolStats};
