//! Per-node connection cache.
//!
//! Connections are keyed either by node id or by `host:port`; the two are
//! separate entries even when they point at the same node. Lookups and
//! inserts happen under one lock so concurrent callers never open two
//! connections for the same key. Connections open lazily, so a lookup never
//! waits on the network.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::core::multiplexed::{ConnectOptions, MultiplexedConnection};
use crate::{Error, Result};

use super::partitions::Partitions;
use super::topology::{ClusterNode, NodeId};

/// Cache key for a node connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ConnectionKey {
    Node(NodeId),
    Address(String),
}

pub(crate) struct ConnectionRegistry {
    partitions: Partitions,
    validate_membership: bool,
    options: RwLock<ConnectOptions>,
    connections: Mutex<HashMap<ConnectionKey, MultiplexedConnection>>,
}

impl ConnectionRegistry {
    pub(crate) fn new(
        partitions: Partitions,
        validate_membership: bool,
        options: ConnectOptions,
    ) -> Self {
        Self {
            partitions,
            validate_membership,
            options: RwLock::new(options),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Connection to the node with `id`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownNode`] if the id is not in the partition table.
    pub(crate) fn by_node_id(&self, id: &NodeId) -> Result<MultiplexedConnection> {
        let node = self
            .partitions
            .node_by_id(id)
            .ok_or_else(|| Error::UnknownNode {
                node_id: id.to_string(),
            })?;
        Ok(self.for_node(&node))
    }

    /// Connection to `host:port`.
    ///
    /// # Errors
    ///
    /// [`Error::Connection`] if the address is malformed, and
    /// [`Error::Membership`] if membership validation is on and no known node
    /// listens there.
    pub(crate) fn by_address(&self, host: &str, port: u16) -> Result<MultiplexedConnection> {
        let address = format!("{}:{}", host, port);
        if host.trim().is_empty() || host.contains(char::is_whitespace) {
            return Err(Error::connection(address, "invalid host"));
        }
        if port == 0 {
            return Err(Error::connection(address, "invalid port"));
        }
        if self.validate_membership && !self.partitions.contains_address(host, port) {
            return Err(Error::Membership { address });
        }
        Ok(self.get_or_open(ConnectionKey::Address(address.clone()), address))
    }

    /// Connection used for routing to `node`.
    pub(crate) fn for_node(&self, node: &ClusterNode) -> MultiplexedConnection {
        self.get_or_open(ConnectionKey::Node(node.id.clone()), node.address())
    }

    fn get_or_open(&self, key: ConnectionKey, address: String) -> MultiplexedConnection {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(&key) {
            if !existing.is_closed() && existing.address() == address {
                return existing.clone();
            }
            existing.close();
        }

        let connection = MultiplexedConnection::open(address, self.options.read().clone());
        debug!(?key, id = connection.id(), "opened node connection");
        connections.insert(key, connection.clone());
        connection
    }

    /// Drops `connection` from the cache if it is still cached.
    pub(crate) fn evict(&self, connection: &MultiplexedConnection) {
        self.connections
            .lock()
            .retain(|_, cached| !cached.same_connection(connection));
    }

    /// Closes and drops connections to nodes no longer in the topology.
    pub(crate) fn prune(&self) {
        let table = self.partitions.snapshot();
        self.connections.lock().retain(|key, connection| {
            let known = match key {
                ConnectionKey::Node(id) => table.node_by_id(id).is_some(),
                ConnectionKey::Address(_) => table
                    .nodes()
                    .iter()
                    .any(|node| node.address() == connection.address()),
            };
            if !known {
                debug!(?key, "closing connection to departed node");
                connection.close();
            }
            known
        });
    }

    /// Closes every cached connection.
    pub(crate) fn close_all(&self) {
        for (_, connection) in self.connections.lock().drain() {
            connection.close();
        }
    }

    /// Sets the flush mode of every cached and future connection.
    pub(crate) fn set_auto_flush(&self, enabled: bool) {
        self.options.write().auto_flush = enabled;
        for connection in self.connections.lock().values() {
            connection.set_auto_flush(enabled);
        }
    }

    /// Flushes every cached connection.
    pub(crate) fn flush_all(&self) {
        for connection in self.connections.lock().values() {
            connection.flush();
        }
    }

    /// Name applied to connections opened from now on.
    pub(crate) fn set_client_name(&self, name: Option<String>) {
        self.options.write().client_name = name;
    }

    pub(crate) fn client_name(&self) -> Option<String> {
        self.options.read().client_name.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.lock().len()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("validate_membership", &self.validate_membership)
            .field("connections", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::topology::NodeFlag;
    use tokio::net::TcpListener;

    struct Fixture {
        registry: ConnectionRegistry,
        ports: [u16; 2],
        _listeners: Vec<TcpListener>,
    }

    async fn fixture(validate: bool) -> Fixture {
        let mut listeners = Vec::new();
        let mut ports = [0u16; 2];
        for port in ports.iter_mut() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            *port = listener.local_addr().unwrap().port();
            listeners.push(listener);
        }
        let partitions = Partitions::from_nodes(vec![
            ClusterNode::new("n1", "127.0.0.1", ports[0])
                .with_flag(NodeFlag::Master)
                .with_slots(0, 16383),
            ClusterNode::new("n2", "127.0.0.1", ports[1]).with_flag(NodeFlag::Slave),
        ]);
        Fixture {
            registry: ConnectionRegistry::new(partitions, validate, ConnectOptions::default()),
            ports,
            _listeners: listeners,
        }
    }

    #[tokio::test]
    async fn test_unknown_node_id() {
        for validate in [true, false] {
            let fx = fixture(validate).await;
            let result = fx.registry.by_node_id(&NodeId::new("nope"));
            assert!(matches!(result, Err(Error::UnknownNode { .. })));
        }
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let fx = fixture(false).await;
        assert!(matches!(
            fx.registry.by_address("", 7000),
            Err(Error::Connection { .. })
        ));
        assert!(matches!(
            fx.registry.by_address("invalid-host", 0),
            Err(Error::Connection { .. })
        ));
    }

    #[tokio::test]
    async fn test_membership_validation() {
        let fx = fixture(true).await;
        assert!(matches!(
            fx.registry.by_address("10.255.255.1", 7999),
            Err(Error::Membership { .. })
        ));
        assert!(fx.registry.by_address("127.0.0.1", fx.ports[1]).is_ok());

        let fx = fixture(false).await;
        assert!(fx.registry.by_address("10.255.255.1", 7999).is_ok());
    }

    #[tokio::test]
    async fn test_cache_keys_are_distinct() {
        let fx = fixture(true).await;
        let by_id = fx.registry.by_node_id(&NodeId::new("n1")).unwrap();
        by_id.ready().await.unwrap();
        let again = fx.registry.by_node_id(&NodeId::new("n1")).unwrap();
        let by_addr = fx.registry.by_address("127.0.0.1", fx.ports[0]).unwrap();

        assert!(by_id.same_connection(&again));
        assert!(!by_id.same_connection(&by_addr));
        assert_eq!(fx.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let fx = fixture(true).await;
        let first = fx.registry.by_node_id(&NodeId::new("n1")).unwrap();
        first.close();
        let second = fx.registry.by_node_id(&NodeId::new("n1")).unwrap();
        assert!(!first.same_connection(&second));
        assert_ne!(first.id(), second.id());
        second.ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_evict() {
        let fx = fixture(true).await;
        let conn = fx.registry.by_node_id(&NodeId::new("n1")).unwrap();
        fx.registry.evict(&conn);
        assert_eq!(fx.registry.len(), 0);
    }

    #[tokio::test]
    async fn test_prune_drops_departed_nodes() {
        let fx = fixture(true).await;
        let n2 = fx.registry.by_node_id(&NodeId::new("n2")).unwrap();
        fx.registry.by_node_id(&NodeId::new("n1")).unwrap();

        fx.registry
            .partitions
            .load(vec![ClusterNode::new("n1", "127.0.0.1", fx.ports[0])]);
        fx.registry.prune();
        assert_eq!(fx.registry.len(), 1);
        assert!(n2.is_closed());
    }

    #[tokio::test]
    async fn test_auto_flush_applies_to_new_connections() {
        let fx = fixture(true).await;
        let before = fx.registry.by_node_id(&NodeId::new("n1")).unwrap();
        fx.registry.set_auto_flush(false);
        assert!(!before.is_auto_flush());
        let after = fx.registry.by_address("127.0.0.1", fx.ports[1]).unwrap();
        assert!(!after.is_auto_flush());
    }

    #[tokio::test]
    async fn test_client_name_option() {
        let fx = fixture(true).await;
        assert!(fx.registry.client_name().is_none());
        fx.registry.set_client_name(Some("worker".to_string()));
        assert_eq!(fx.registry.client_name().as_deref(), Some("worker"));
        let conn = fx.registry.by_node_id(&NodeId::new("n2")).unwrap();
        assert!(!conn.is_closed());
    }
}
