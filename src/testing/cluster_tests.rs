//! End-to-end tests against in-process fake nodes.

use super::{wait_for, FakeNode};
use crate::client::Client;
use crate::cluster::host::Host;
use crate::cluster::tender::Tender;
use crate::cluster::topology::Topology;
use crate::command::executor::{Command, Executor};
use crate::config::{ClientConfig, CommandPolicy, TendConfig};
use crate::error::{Error, Result};
use crate::net::connection::Connection;
use crate::net::info;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Route test logs through the env filter; repeated calls are no-ops.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config(seeds: Vec<Host>) -> ClientConfig {
    init_logging();
    ClientConfig {
        seeds,
        tend: TendConfig {
            interval: Duration::from_millis(100),
            info_timeout: Duration::from_secs(1),
            warmup_deadline: Duration::from_secs(3),
            ..Default::default()
        },
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

fn tender_for(seeds: Vec<Host>) -> (Arc<Topology>, Arc<Tender>) {
    let topology = Arc::new(Topology::new());
    let tender = Tender::new(topology.clone(), Arc::new(test_config(seeds)));
    (topology, tender)
}

/// Wire three fakes into a full mesh.
fn full_mesh(a: &FakeNode, b: &FakeNode, c: &FakeNode) {
    a.set_peers(2, &[b, c]);
    b.set_peers(2, &[a, c]);
    c.set_peers(2, &[a, b]);
}

#[tokio::test]
async fn test_seed_discovers_whole_cluster() {
    let a = FakeNode::start("A1").await;
    let b = FakeNode::start("B1").await;
    let c = FakeNode::start("C1").await;
    full_mesh(&a, &b, &c);

    let (topology, tender) = tender_for(vec![a.host()]);
    tender.warm_up().await.unwrap();

    assert_eq!(topology.node_count(), 3);
    for name in ["A1", "B1", "C1"] {
        let node = topology.node_by_name(name).expect(name);
        assert!(node.is_active());
    }
    // Aliases point back at the right nodes.
    let via_host = topology.node_by_host(&b.host()).unwrap();
    assert_eq!(via_host.name(), "B1");
}

#[tokio::test]
async fn test_seed_from_empty_topology_reseeds() {
    let a = FakeNode::start("A2").await;
    let (topology, tender) = tender_for(vec![a.host()]);

    assert_eq!(topology.node_count(), 0);
    tender.tend().await;
    assert_eq!(topology.node_count(), 1);
    assert_eq!(topology.nodes()[0].name(), "A2");
}

#[tokio::test]
async fn test_unreachable_seed_fails_warmup() {
    // Bind and drop to get a dead port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = Host::new("127.0.0.1", listener.local_addr().unwrap().port());
    drop(listener);

    let (_, tender) = tender_for(vec![host]);
    let err = tender.warm_up().await.unwrap_err();
    assert!(matches!(err, Error::NoAvailableNode));
}

#[tokio::test]
async fn test_cluster_name_mismatch_rejects_seed() {
    let a = FakeNode::start("A3").await;
    a.set("cluster-name", "staging");

    let topology = Arc::new(Topology::new());
    let config = test_config(vec![a.host()]).with_cluster_name("prod");
    let tender = Tender::new(topology, Arc::new(config));

    assert!(tender.warm_up().await.is_err());
}

#[tokio::test]
async fn test_ownership_merge_and_resolution() {
    let a = FakeNode::start("A4").await;
    let b = FakeNode::start("B4").await;
    a.set_peers(2, &[&b]);
    b.set_peers(2, &[&a]);

    // A masters the even partitions and backs up the odd ones; B mirrors.
    let evens: Vec<usize> = (0..16).step_by(2).collect();
    let odds: Vec<usize> = (0..16).skip(1).step_by(2).collect();
    a.set_ownership(5, &[("test", &[&evens[..], &odds[..]])]);
    b.set_ownership(5, &[("test", &[&odds[..], &evens[..]])]);

    let (topology, tender) = tender_for(vec![a.host()]);
    tender.warm_up().await.unwrap();

    let node_a = topology.node_by_name("A4").unwrap();
    let node_b = topology.node_by_name("B4").unwrap();

    for pid in 0..16usize {
        let master = topology.node_for_partition("test", pid, 0).unwrap();
        let replica = topology.node_for_partition("test", pid, 1).unwrap();
        if pid % 2 == 0 {
            assert!(Arc::ptr_eq(&master, &node_a), "partition {pid}");
            assert!(Arc::ptr_eq(&replica, &node_b), "partition {pid}");
        } else {
            assert!(Arc::ptr_eq(&master, &node_b), "partition {pid}");
            assert!(Arc::ptr_eq(&replica, &node_a), "partition {pid}");
        }
    }

    // A generation bump with reshuffled ownership is picked up.
    a.set_ownership(6, &[("test", &[&odds[..], &evens[..]])]);
    b.set_ownership(6, &[("test", &[&evens[..], &odds[..]])]);
    tender.tend().await;
    let master = topology.node_for_partition("test", 1, 0).unwrap();
    assert!(Arc::ptr_eq(&master, &node_a));
}

#[tokio::test]
async fn test_unreferenced_nonowner_is_removed() {
    let a = FakeNode::start("A5").await;
    let b = FakeNode::start("B5").await;
    let c = FakeNode::start("C5").await;
    full_mesh(&a, &b, &c);
    a.set_ownership(3, &[("test", &[&(0..2048).collect::<Vec<_>>()[..]])]);
    b.set_ownership(3, &[("test", &[&(2048..4096).collect::<Vec<_>>()[..]])]);

    let (topology, tender) = tender_for(vec![a.host()]);
    tender.warm_up().await.unwrap();
    assert_eq!(topology.node_count(), 3);

    // The cluster stops referencing C; C keeps answering probes but owns
    // no partitions anywhere.
    a.set_peers(3, &[&b]);
    b.set_peers(3, &[&a]);
    c.set_peers(3, &[&a, &b]);

    // Two successful rounds after the membership view settles.
    for _ in 0..4 {
        tender.tend().await;
    }

    assert_eq!(topology.node_count(), 2);
    assert!(topology.node_by_name("C5").is_none());
    assert!(topology.node_by_host(&c.host()).is_none());
    // A and B survive: they reference each other.
    assert!(topology.node_by_name("A5").is_some());
    assert!(topology.node_by_name("B5").is_some());
}

#[tokio::test]
async fn test_dead_node_health_decay_and_reseed() {
    let a = FakeNode::start("A6").await;
    let (topology, tender) = tender_for(vec![a.host()]);
    tender.warm_up().await.unwrap();
    let node = topology.node_by_name("A6").unwrap();

    // Kill the only node; refreshes now fail and bleed its health dry.
    a.stop();
    let removed = {
        for _ in 0..8 {
            tender.tend().await;
            if topology.node_count() == 0 {
                break;
            }
        }
        topology.node_count() == 0
    };
    assert!(removed, "sole unhealthy node must eventually be dropped");
    assert!(!node.is_active());
}

/// A minimal info-backed command for driving the executor over real sockets.
struct StatusCommand {
    response: Option<String>,
}

#[async_trait]
impl Command for StatusCommand {
    fn namespace(&self) -> &str {
        "test"
    }

    fn partition_id(&self) -> usize {
        0
    }

    fn is_write(&self) -> bool {
        false
    }

    async fn write_request(&mut self, conn: &mut Connection, timeout: Duration) -> Result<()> {
        conn.write_frame(b"node\n", timeout).await
    }

    async fn read_response(&mut self, conn: &mut Connection, timeout: Duration) -> Result<()> {
        let frame = conn.read_frame(timeout).await?;
        let text = String::from_utf8_lossy(&frame).into_owned();
        match text.split_once('\t') {
            Some((_, value)) => {
                self.response = Some(value.trim_end().to_string());
                Ok(())
            }
            None => Err(Error::Parse(format!("unexpected status response '{text}'"))),
        }
    }
}

#[tokio::test]
async fn test_executor_round_trip_over_wire() {
    let a = FakeNode::start("A7").await;
    let (topology, tender) = tender_for(vec![a.host()]);
    tender.warm_up().await.unwrap();

    let executor = Executor::new(topology.clone(), None);
    let policy = CommandPolicy::default()
        .with_timeouts(Duration::from_secs(1), Duration::from_secs(5));

    let mut cmd = StatusCommand { response: None };
    executor.execute(&policy, &mut cmd).await.unwrap();
    assert_eq!(cmd.response.as_deref(), Some("A7"));

    // The exchange's connection went back into the pool.
    let node = topology.node_by_name("A7").unwrap();
    assert!(node.pool_stats().pooled >= 1);
}

#[tokio::test]
async fn test_client_lifecycle() {
    let a = FakeNode::start("A8").await;
    let b = FakeNode::start("B8").await;
    a.set_peers(2, &[&b]);
    b.set_peers(2, &[&a]);

    let client = Client::connect(test_config(vec![a.host()])).await.unwrap();
    assert!(client.is_connected());
    assert_eq!(client.nodes().len(), 2);
    assert!(client.node_by_name("B8").is_some());
    assert!(client.random_node().is_ok());

    let stats = client.stats();
    assert_eq!(stats.nodes.len(), 2);
    assert!(stats.opened() >= 2, "tending opened pooled connections");

    client.close().await;
    assert!(!client.is_connected());
    assert_eq!(client.nodes().len(), 0);
    // Closing twice is harmless.
    client.close().await;
}

#[tokio::test]
async fn test_background_tend_tracks_new_peer() {
    let a = FakeNode::start("A9").await;
    let client = Client::connect(test_config(vec![a.host()])).await.unwrap();
    assert_eq!(client.nodes().len(), 1);

    // A new node joins and A starts reporting it.
    let b = FakeNode::start("B9").await;
    a.set_peers(2, &[&b]);
    b.set_peers(2, &[&a]);

    let seen = wait_for(|| client.node_by_name("B9").is_some(), Duration::from_secs(3)).await;
    assert!(seen, "background tend should admit the new peer");

    client.close().await;
}

#[tokio::test]
async fn test_info_request_against_fake_node() {
    let a = FakeNode::start("A10").await;
    let mut conn = Connection::connect(a.addr(), Duration::from_secs(1))
        .await
        .unwrap();
    let values = info::request(
        &mut conn,
        &["node", "features", "unknown-command"],
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    conn.close().await;

    assert_eq!(values.get("node").map(String::as_str), Some("A10"));
    assert!(values["features"].contains("peers"));
    assert!(!values.contains_key("unknown-command"));
}
