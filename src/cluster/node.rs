//! Handle for issuing commands to one specific node.

use bytes::Bytes;

use crate::core::command::{self, Cmd};
use crate::core::future::CommandFuture;
use crate::core::multiplexed::{ConnectionState, MultiplexedConnection};
use crate::proto::frame::Frame;
use crate::Result;

use super::commands;

/// A connection to a single cluster node.
///
/// Commands sent through this handle go straight to the node without slot
/// routing or redirect handling. Every command is queued when the method is
/// called; the returned [`CommandFuture`] only observes the reply.
///
/// Cloning shares the underlying connection.
#[derive(Debug, Clone)]
pub struct NodeConnection {
    connection: MultiplexedConnection,
}

impl NodeConnection {
    pub(crate) fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    /// Process-unique id of the underlying connection.
    pub fn id(&self) -> u64 {
        self.connection.id()
    }

    /// `host:port` of the node.
    pub fn address(&self) -> &str {
        self.connection.address()
    }

    /// Returns true if both handles share one underlying connection.
    pub fn same_connection(&self, other: &NodeConnection) -> bool {
        self.connection.same_connection(&other.connection)
    }

    /// Lifecycle state of the underlying connection.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Returns true once the connection was closed or failed.
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Closes the connection. The registry opens a fresh one on next access.
    pub fn close(&self) {
        self.connection.close();
    }

    /// Switches between immediate writes and manual flushing.
    ///
    /// With auto-flush off, commands are buffered and their futures do not
    /// complete until [`flush_commands`](NodeConnection::flush_commands).
    pub fn set_auto_flush(&self, enabled: bool) {
        self.connection.set_auto_flush(enabled);
    }

    /// Writes every buffered command.
    pub fn flush_commands(&self) {
        self.connection.flush();
    }

    /// Sends an arbitrary command and returns the raw reply.
    ///
    /// Error replies resolve to the matching [`crate::Error`] variant.
    pub fn dispatch(&self, cmd: Cmd) -> CommandFuture<Frame> {
        self.send(cmd, command::frame_to_frame)
    }

    pub(crate) fn send<T>(&self, cmd: Cmd, convert: fn(Frame) -> Result<T>) -> CommandFuture<T>
    where
        T: Send + 'static,
    {
        CommandFuture::from_reply(self.connection.dispatch(cmd.into_frame()), convert)
    }

    /// PING.
    pub fn ping(&self) -> CommandFuture<String> {
        self.send(command::ping(), command::frame_to_string)
    }

    /// GET.
    pub fn get(&self, key: impl Into<Bytes>) -> CommandFuture<Option<Bytes>> {
        self.send(command::get(key), command::frame_to_bytes)
    }

    /// SET.
    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> CommandFuture<()> {
        self.send(command::set(key, value), command::frame_to_ok)
    }

    /// DEL; returns the number of removed keys.
    pub fn del<I, K>(&self, keys: I) -> CommandFuture<i64>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        self.send(command::del(keys), command::frame_to_int)
    }

    /// MGET. All keys must hash to one slot.
    pub fn mget<I, K>(&self, keys: I) -> CommandFuture<Vec<Option<Bytes>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        self.send(command::mget(keys), command::frame_to_vec_bytes)
    }

    /// KEYS local to this node.
    pub fn keys(&self, pattern: impl Into<Bytes>) -> CommandFuture<Vec<Bytes>> {
        self.send(command::keys(pattern), command::frame_to_keys)
    }

    /// DBSIZE of this node.
    pub fn dbsize(&self) -> CommandFuture<i64> {
        self.send(command::dbsize(), command::frame_to_int)
    }

    /// FLUSHALL on this node.
    pub fn flushall(&self) -> CommandFuture<()> {
        self.send(command::flushall(), command::frame_to_ok)
    }

    /// FLUSHDB on this node.
    pub fn flushdb(&self) -> CommandFuture<()> {
        self.send(command::flushdb(), command::frame_to_ok)
    }

    /// RANDOMKEY from this node.
    pub fn randomkey(&self) -> CommandFuture<Option<Bytes>> {
        self.send(command::randomkey(), command::frame_to_bytes)
    }

    /// SCRIPT FLUSH on this node.
    pub fn script_flush(&self) -> CommandFuture<()> {
        self.send(command::script_flush(), command::frame_to_ok)
    }

    /// SCRIPT KILL on this node.
    pub fn script_kill(&self) -> CommandFuture<()> {
        self.send(command::script_kill(), command::frame_to_ok)
    }

    /// CLIENT SETNAME for this connection only.
    pub fn client_setname(&self, name: impl Into<Bytes>) -> CommandFuture<()> {
        self.send(command::client_setname(name), command::frame_to_ok)
    }

    /// CLIENT GETNAME.
    pub fn client_getname(&self) -> CommandFuture<Option<Bytes>> {
        self.send(command::client_getname(), command::frame_to_bytes)
    }

    /// CLIENT LIST.
    pub fn client_list(&self) -> CommandFuture<String> {
        self.send(command::client_list(), command::frame_to_string)
    }

    /// CONFIG SET.
    pub fn config_set(
        &self,
        parameter: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> CommandFuture<()> {
        self.send(command::config_set(parameter, value), command::frame_to_ok)
    }

    /// CLUSTER MYID.
    pub fn cluster_myid(&self) -> CommandFuture<String> {
        self.send(commands::cluster_myid(), command::frame_to_string)
    }

    /// CLUSTER NODES, as raw text.
    pub fn cluster_nodes(&self) -> CommandFuture<String> {
        self.send(commands::cluster_nodes(), command::frame_to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::parse_cluster_nodes;
    use crate::core::multiplexed::ConnectOptions;
    use crate::testing::MockCluster;
    use crate::Error;

    async fn node_connection(cluster: &MockCluster, index: usize) -> NodeConnection {
        let connection = MultiplexedConnection::open(cluster.address(index), ConnectOptions::default());
        connection.ready().await.unwrap();
        NodeConnection::new(connection)
    }

    #[tokio::test]
    async fn test_commands_go_straight_to_node() {
        let cluster = MockCluster::start().await.unwrap();
        let node = node_connection(&cluster, 2).await;

        node.set("foo", "bar").await.unwrap();
        assert_eq!(node.get("foo").await.unwrap(), Some(Bytes::from("bar")));
        assert_eq!(node.mget(["foo"]).await.unwrap(), vec![Some(Bytes::from("bar"))]);
        assert_eq!(node.keys("*").await.unwrap(), vec![Bytes::from("foo")]);
        assert_eq!(node.dbsize().await.unwrap(), 1);
        assert_eq!(node.randomkey().await.unwrap(), Some(Bytes::from("foo")));
        assert_eq!(node.del(["foo"]).await.unwrap(), 1);

        // Not the owner: no redirect is followed.
        let other = node_connection(&cluster, 0).await;
        assert!(matches!(
            other.get("foo").await,
            Err(Error::Moved { slot: 12182, .. })
        ));
    }

    #[tokio::test]
    async fn test_admin_commands() {
        let cluster = MockCluster::start().await.unwrap();
        let node = node_connection(&cluster, 1).await;

        assert_eq!(node.cluster_myid().await.unwrap(), cluster.node_id(1).to_string());
        let nodes = parse_cluster_nodes(&node.cluster_nodes().await.unwrap()).unwrap();
        assert_eq!(nodes.len(), 3);

        node.config_set("maxmemory", "100mb").await.unwrap();
        node.flushall().await.unwrap();
        node.flushdb().await.unwrap();
        node.script_flush().await.unwrap();
        assert!(matches!(node.script_kill().await, Err(Error::Server { .. })));

        let raw = node.dispatch(Cmd::new("PING")).await.unwrap();
        assert_eq!(raw, Frame::SimpleString(b"PONG".to_vec()));
        assert!(matches!(
            node.dispatch(Cmd::new("NOPE")).await,
            Err(Error::Server { .. })
        ));
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let cluster = MockCluster::start().await.unwrap();
        let node = node_connection(&cluster, 0).await;
        assert_eq!(node.address(), cluster.address(0));
        assert_eq!(node.state(), ConnectionState::Connected);
        assert!(node.same_connection(&node.clone()));

        node.set_auto_flush(false);
        let mut pending = node.ping();
        assert!(!pending.poll_done());
        node.flush_commands();
        assert_eq!(pending.await.unwrap(), "PONG");

        node.close();
        assert!(node.is_closed());
        assert!(node.ping().await.is_err());
    }
}
