//! Integration tests for cluster operations.
//!
//! These tests run against the in-process mock cluster and only use the
//! public API.
//!
//! Run tests:
//! ```bash
//! cargo test --test cluster_integration --features test-utils
//! ```

#![cfg(feature = "test-utils")]

use std::time::Duration;

use bytes::Bytes;
use slotmux::cluster::{predicates, NodeFlag};
use slotmux::testing::MockCluster;
use slotmux::{key_slot, ClusterClient, Error, Result};

/// Helper function to create a cluster client for testing.
async fn create_test_client(cluster: &MockCluster) -> Result<ClusterClient> {
    ClusterClient::connect(&cluster.seeds()).await
}

#[tokio::test]
async fn test_cluster_connect() {
    let cluster = MockCluster::start().await.expect("failed to start cluster");
    let client = create_test_client(&cluster).await.expect("failed to connect");

    let table = client.partitions().snapshot();
    assert_eq!(table.len(), 3, "expected 3 nodes");
    assert_eq!(table.assigned_slots(), 16384, "cluster should cover all slots");
}

#[tokio::test]
async fn test_cluster_basic_operations() {
    let cluster = MockCluster::start().await.expect("failed to start cluster");
    let client = create_test_client(&cluster).await.expect("failed to connect");

    let key = "integration:test:basic";
    let value = Bytes::from("Hello, Cluster!");

    client.set(key, value.clone()).await.expect("SET failed");
    let retrieved = client.get(key).await.expect("GET failed");
    assert_eq!(retrieved, Some(value), "retrieved value should match");

    assert_eq!(client.exists([key]).await.expect("EXISTS failed"), 1);
    assert_eq!(client.del([key]).await.expect("DEL failed"), 1);
    assert_eq!(client.get(key).await.expect("GET failed"), None);
}

#[tokio::test]
async fn test_cluster_multi_key_operations() {
    let cluster = MockCluster::start().await.expect("failed to start cluster");
    let client = create_test_client(&cluster).await.expect("failed to connect");

    let pairs: Vec<(String, String)> = (0..50)
        .map(|i| (format!("multi:{}", i), format!("v{}", i)))
        .collect();
    client.mset(pairs.clone()).await.expect("MSET failed");

    let keys: Vec<String> = pairs.iter().map(|(k, _)| k.clone()).collect();
    let values = client.mget(keys.clone()).await.expect("MGET failed");
    for ((_, expected), value) in pairs.iter().zip(values) {
        assert_eq!(value, Some(Bytes::from(expected.clone())));
    }

    assert_eq!(client.dbsize().await.expect("DBSIZE failed"), 50);
    assert_eq!(client.del(keys).await.expect("DEL failed"), 50);
    assert_eq!(client.dbsize().await.expect("DBSIZE failed"), 0);
}

#[tokio::test]
async fn test_cluster_hash_tags_share_a_node() {
    let cluster = MockCluster::start().await.expect("failed to start cluster");
    let client = create_test_client(&cluster).await.expect("failed to connect");

    assert_eq!(key_slot("{user:1}:name"), key_slot("{user:1}:email"));
    let reply = client
        .transaction(
            vec!["{user:1}:name", "{user:1}:email"],
            vec![
                slotmux::core::command::set("{user:1}:name", "ada"),
                slotmux::core::command::set("{user:1}:email", "ada@example.com"),
            ],
        )
        .await
        .expect("transaction failed");
    assert_eq!(reply.map(|r| r.len()), Some(2));

    let owner = cluster.owner_of("user:1").expect("slot should be owned");
    let stored = cluster.keys_on(owner);
    assert!(stored.contains(&Bytes::from("{user:1}:name")));
    assert!(stored.contains(&Bytes::from("{user:1}:email")));
}

#[tokio::test]
async fn test_cluster_redirects_are_transparent() {
    let cluster = MockCluster::start().await.expect("failed to start cluster");
    let client = create_test_client(&cluster).await.expect("failed to connect");

    let slot = key_slot("moving");
    let target = (cluster.owner_of("moving").expect("owned") + 1) % 3;
    cluster.move_slot(slot, target);

    client.set("moving", "1").await.expect("SET after MOVED failed");
    assert_eq!(
        client.partitions().node_for_slot(slot).map(|n| n.id),
        Some(cluster.node_id(target))
    );

    cluster.set_bouncing(slot, true);
    assert!(matches!(
        client.get("moving").await,
        Err(Error::RedirectExhausted { .. })
    ));
}

#[tokio::test]
async fn test_cluster_selections() {
    let cluster = MockCluster::with_replicas(3).await.expect("failed to start cluster");
    let client = create_test_client(&cluster).await.expect("failed to connect");

    assert_eq!(client.masters().size(), 3);
    assert_eq!(client.slaves().size(), 3);

    let live = client.nodes(predicates::has_flag(NodeFlag::Slave), true);
    client
        .partitions()
        .modify(0, |node| node.flags.insert(NodeFlag::Slave))
        .expect("node 0 exists");
    assert_eq!(live.size(), 4);

    let mut pings = client.all().commands().ping();
    assert!(pings.await_all(Duration::from_secs(5)).await);
    for (node, result) in pings.into_results().await {
        assert_eq!(result.expect("PING failed"), "PONG", "node {}", node.id);
    }
}

#[tokio::test]
async fn test_cluster_pipelining() {
    let cluster = MockCluster::start().await.expect("failed to start cluster");
    let client = create_test_client(&cluster).await.expect("failed to connect");

    client.set_auto_flush(false);
    let pending: Vec<_> = (0..100)
        .map(|i| client.set(format!("pipe:{}", i), "x"))
        .collect();
    client.flush_commands();
    for result in futures::future::join_all(pending).await {
        result.expect("pipelined SET failed");
    }
    client.set_auto_flush(true);

    assert_eq!(client.keys("pipe:*").await.expect("KEYS failed").len(), 100);
}
