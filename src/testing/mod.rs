//! Testing support: in-process fake cluster nodes.
//!
//! A [`FakeNode`] is a real TCP listener speaking the admin info protocol,
//! so discovery, tending, routing and execution can be exercised end to end
//! without a server install. Values it serves are plain strings keyed by
//! info command name and can be mutated mid-test to simulate topology
//! changes.

#[cfg(test)]
mod cluster_tests;

use crate::cluster::host::Host;
use crate::net::connection::Connection;
use crate::types::PARTITIONS;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// An in-process server node for tests.
pub struct FakeNode {
    name: String,
    addr: SocketAddr,
    values: Arc<RwLock<HashMap<String, String>>>,
    handle: tokio::task::JoinHandle<()>,
    handlers: Arc<parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl FakeNode {
    /// Bind a listener on an OS-assigned port and start serving info
    /// requests under the given node name.
    pub async fn start(name: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut defaults = HashMap::new();
        defaults.insert("node".to_string(), name.to_string());
        defaults.insert("features".to_string(), "peers;replicas".to_string());
        defaults.insert("partition-generation".to_string(), "0".to_string());
        defaults.insert("peers".to_string(), format!("1,{},[]", addr.port()));
        defaults.insert("replicas".to_string(), String::new());
        let values = Arc::new(RwLock::new(defaults));

        let served = values.clone();
        let handlers = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handler_registry = handlers.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                let served = served.clone();
                let handler = tokio::spawn(async move {
                    let mut conn = Connection::from_stream(stream, peer);
                    loop {
                        let Ok(frame) = conn.read_frame(Duration::from_secs(60)).await else {
                            break;
                        };
                        let request = String::from_utf8_lossy(&frame).into_owned();

                        let mut response = String::new();
                        {
                            let values = served.read();
                            for name in request.lines().filter(|l| !l.is_empty()) {
                                if let Some(value) = values.get(name) {
                                    response.push_str(name);
                                    response.push('\t');
                                    response.push_str(value);
                                    response.push('\n');
                                }
                            }
                        }

                        if conn
                            .write_frame(response.as_bytes(), Duration::from_secs(5))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
                handler_registry.lock().push(handler);
            }
        });

        Self {
            name: name.to_string(),
            addr,
            values,
            handle,
            handlers,
        }
    }

    /// Node name this fake reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Listener address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The host seeds and peer lists should use for this node.
    pub fn host(&self) -> Host {
        Host::new("127.0.0.1", self.addr.port())
    }

    /// Set one info value.
    pub fn set(&self, name: &str, value: impl Into<String>) {
        self.values.write().insert(name.to_string(), value.into());
    }

    /// Remove an info value so requests for it go unanswered.
    pub fn unset(&self, name: &str) {
        self.values.write().remove(name);
    }

    /// Report the given nodes as this node's peers.
    pub fn set_peers(&self, generation: i64, peers: &[&FakeNode]) {
        let entries: Vec<String> = peers
            .iter()
            .map(|peer| format!("[{},,[127.0.0.1:{}]]", peer.name, peer.addr.port()))
            .collect();
        self.set(
            "peers",
            format!("{generation},{},[{}]", self.addr.port(), entries.join(",")),
        );
    }

    /// Report partition ownership: for each namespace, one set of owned
    /// partition ids per replica level. Bumps the partition generation so
    /// the next refresh merges the bitmaps.
    pub fn set_ownership(&self, generation: i64, namespaces: &[(&str, &[&[usize]])]) {
        let sections: Vec<String> = namespaces
            .iter()
            .map(|(ns, levels)| {
                let bitmaps: Vec<String> = levels.iter().map(|p| encode_bitmap(p)).collect();
                format!("{ns}:{},{}", levels.len(), bitmaps.join(","))
            })
            .collect();
        self.set("replicas", sections.join(";"));
        self.set("partition-generation", generation.to_string());
    }

    /// Stop serving: closes the listener and every open connection.
    pub fn stop(&self) {
        self.handle.abort();
        for handler in self.handlers.lock().drain(..) {
            handler.abort();
        }
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Base64 ownership bitmap with the given partitions set.
pub fn encode_bitmap(partitions: &[usize]) -> String {
    let mut bytes = vec![0u8; PARTITIONS / 8];
    for &p in partitions {
        bytes[p >> 3] |= 0x80 >> (p & 7);
    }
    BASE64.encode(bytes)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for<F: FnMut() -> bool>(mut condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
