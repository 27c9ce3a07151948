//! Internal stress tests for pipelining.
//!
//! These tests push large batches of commands through node connections and
//! the cluster client without awaiting them one by one.

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;

use crate::core::future::{await_all, CommandFuture};
use crate::testing::MockCluster;

/// `{tag}:N` keys; all share the slot of `tag`.
fn tagged_keys(tag: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{{{}}}:{}", tag, i)).collect()
}

#[tokio::test]
async fn test_manual_flush_defers_thousand_sets() {
    let cluster = MockCluster::start().await.unwrap();
    let client = cluster.builder().build().await.unwrap();
    let owner = cluster.owner_of("pipe").unwrap();
    let keys = tagged_keys("pipe", 1000);

    let writer = client.get_connection(&cluster.node_id(owner)).await.unwrap();
    let reader = client
        .get_connection_by_address("127.0.0.1", cluster.port(owner))
        .await
        .unwrap();
    assert!(!writer.same_connection(&reader));

    writer.set_auto_flush(false);
    let mut sets: Vec<CommandFuture<()>> = keys
        .iter()
        .enumerate()
        .map(|(i, key)| writer.set(key.clone(), i.to_string()))
        .collect();

    for key in &keys {
        assert_eq!(reader.get(key.clone()).await.unwrap(), None);
    }
    assert!(!await_all(Duration::from_millis(50), sets.iter_mut()).await);

    writer.flush_commands();
    assert!(await_all(Duration::from_secs(10), sets.iter_mut()).await);
    assert!(sets
        .iter()
        .all(|set| matches!(set.result(), Some(Ok(())))));

    for (i, key) in keys.iter().enumerate() {
        assert_eq!(
            reader.get(key.clone()).await.unwrap(),
            Some(Bytes::from(i.to_string()))
        );
    }
}

#[tokio::test]
async fn test_manual_flush_across_masters() {
    let cluster = MockCluster::start().await.unwrap();
    let writer = cluster.builder().auto_flush(false).build().await.unwrap();
    let reader = cluster.builder().build().await.unwrap();
    let keys: Vec<String> = (0..1000).map(|i| format!("spread:{}", i)).collect();
    let owners: HashSet<usize> = keys.iter().filter_map(|key| cluster.owner_of(key)).collect();
    assert_eq!(owners.len(), 3);

    let mut sets: Vec<CommandFuture<()>> = keys
        .iter()
        .map(|key| writer.set(key.clone(), key.clone()))
        .collect();
    assert!(!await_all(Duration::from_millis(50), sets.iter_mut()).await);
    assert_eq!(reader.dbsize().await.unwrap(), 0);
    let values = reader.mget(keys.clone()).await.unwrap();
    assert!(values.iter().all(Option::is_none));

    writer.flush_commands();
    assert!(await_all(Duration::from_secs(10), sets.iter_mut()).await);
    assert!(sets
        .iter()
        .all(|set| matches!(set.result(), Some(Ok(())))));

    assert_eq!(reader.dbsize().await.unwrap(), 1000);
    let values = reader.mget(keys.clone()).await.unwrap();
    for (key, value) in keys.iter().zip(values) {
        assert_eq!(value, Some(Bytes::from(key.clone())));
    }
}

#[tokio::test]
async fn test_concurrent_routed_commands() {
    let cluster = MockCluster::start().await.unwrap();
    let client = cluster.builder().build().await.unwrap();

    let sets: Vec<_> = (0..2000)
        .map(|i| client.set(format!("key:{}", i), format!("value:{}", i)))
        .collect();
    for result in futures::future::join_all(sets).await {
        result.unwrap();
    }

    let mut handles = Vec::new();
    for task in 0..8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let keys: Vec<String> = (task * 250..(task + 1) * 250)
                .map(|i| format!("key:{}", i))
                .collect();
            let values = client.mget(keys).await.unwrap();
            for (offset, value) in values.into_iter().enumerate() {
                let expected = format!("value:{}", task * 250 + offset);
                assert_eq!(value, Some(Bytes::from(expected)));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(client.dbsize().await.unwrap(), 2000);
    assert_eq!(client.keys("key:*").await.unwrap().len(), 2000);
}
