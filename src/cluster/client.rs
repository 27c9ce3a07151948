//! The cluster-aware client.
//!
//! [`ClusterClient`] ties the partition table, the connection registry and
//! the slot router together. Every command is queued on its node
//! connection when the method is called and comes back as a
//! [`CommandFuture`], so callers can issue thousands of commands before
//! awaiting any of them.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, FuturesUnordered};
use futures::StreamExt;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};

use crate::core::command::{self, Cmd};
use crate::core::connection::Connection;
use crate::core::future::CommandFuture;
use crate::proto::frame::Frame;
use crate::{Error, Result};

use super::aggregate::{AllSucceeded, LogicalAnd, Reducer, Sum, Union};
use super::builder::{ClusterClientBuilder, ClusterOptions};
use super::commands::cluster_nodes;
use super::executions::AsyncExecutions;
use super::node::NodeConnection;
use super::partitions::Partitions;
use super::registry::ConnectionRegistry;
use super::router::{parse_address, single_slot, split_by_slot, SlotRouter};
use super::selection::{predicates, NodePredicate, NodeSelection};
use super::slot::{key_slot, SLOT_COUNT};
use super::topology::{parse_cluster_nodes, ClusterNode, NodeFlag, NodeId};

/// Redis Cluster client.
///
/// Cloning is cheap and every clone shares the topology and the node
/// connections.
///
/// # Example
///
/// ```no_run
/// use slotmux::ClusterClient;
///
/// # #[tokio::main]
/// # async fn main() -> slotmux::Result<()> {
/// let client = ClusterClient::connect("127.0.0.1:7000,127.0.0.1:7001").await?;
///
/// client.set("key", "value").await?;
/// let value = client.get("key").await?;
/// assert_eq!(value.as_deref(), Some(&b"value"[..]));
///
/// let values = client.mget(["a", "b", "c"]).await?;
/// assert_eq!(values.len(), 3);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClusterClient {
    seeds: Arc<Vec<String>>,
    partitions: Partitions,
    registry: Arc<ConnectionRegistry>,
    router: Arc<SlotRouter>,
    connect_timeout: Duration,
}

impl ClusterClient {
    /// Connects to a cluster with default options.
    ///
    /// # Arguments
    ///
    /// * `seeds` - Comma-separated seed addresses, e.g. `"127.0.0.1:7000,redis://127.0.0.1:7001"`
    ///
    /// # Errors
    ///
    /// Returns an error if no seed is given or none of them can report the
    /// topology.
    pub async fn connect(seeds: &str) -> Result<Self> {
        Self::builder().seeds(seeds).build().await
    }

    /// Returns a builder for custom options.
    #[inline]
    pub fn builder() -> ClusterClientBuilder {
        ClusterClientBuilder::new()
    }

    pub(crate) async fn with_options(seeds: Vec<String>, options: ClusterOptions) -> Result<Self> {
        let partitions = Partitions::new();
        let registry = Arc::new(ConnectionRegistry::new(
            partitions.clone(),
            options.validate_cluster_node_membership,
            options.connect_options(),
        ));
        let router = Arc::new(SlotRouter {
            partitions: partitions.clone(),
            registry: Arc::clone(&registry),
            max_redirects: options.max_redirects,
        });
        let client = Self {
            seeds: Arc::new(seeds),
            partitions,
            registry,
            router,
            connect_timeout: options.connect_timeout,
        };
        client.refresh_topology().await?;
        Ok(client)
    }

    /// Queries the topology again and republishes the partition table.
    ///
    /// Known nodes are asked first, then the seeds. Connections to nodes
    /// that left the cluster are closed.
    ///
    /// # Errors
    ///
    /// Returns the last error if no node could answer `CLUSTER NODES`.
    #[instrument(skip(self))]
    pub async fn refresh_topology(&self) -> Result<()> {
        let mut candidates: Vec<String> = self.partitions.nodes().iter().map(ClusterNode::address).collect();
        for seed in self.seeds.iter() {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }

        let mut last_error = Error::InvalidArgument {
            message: "no seed nodes provided".to_string(),
        };
        for address in &candidates {
            match fetch_topology(address, self.connect_timeout).await {
                Ok(nodes) => {
                    debug!(%address, nodes = nodes.len(), "topology refreshed");
                    self.partitions.load(nodes);
                    self.registry.prune();
                    return Ok(());
                }
                Err(e) => {
                    warn!(%address, error = %e, "topology query failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// The live partition table.
    pub fn partitions(&self) -> &Partitions {
        &self.partitions
    }

    /// Connection to the node with `id`, once it is established.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownNode`] if the id is not in the topology, or the dial
    /// error if the node cannot be reached.
    pub async fn get_connection(&self, id: &NodeId) -> Result<NodeConnection> {
        let connection = self.registry.by_node_id(id)?;
        if let Err(e) = connection.ready().await {
            self.registry.evict(&connection);
            return Err(e);
        }
        Ok(NodeConnection::new(connection))
    }

    /// Connection to `host:port`, once it is established.
    ///
    /// This is a separate connection from the one returned by
    /// [`get_connection`](ClusterClient::get_connection) for the same node.
    ///
    /// # Errors
    ///
    /// [`Error::Membership`] if membership validation is enabled and no
    /// known node listens there; [`Error::Connection`] if the address is
    /// invalid or unreachable.
    pub async fn get_connection_by_address(&self, host: &str, port: u16) -> Result<NodeConnection> {
        let connection = self.registry.by_address(host, port)?;
        if let Err(e) = connection.ready().await {
            self.registry.evict(&connection);
            return Err(e);
        }
        Ok(NodeConnection::new(connection))
    }

    /// Nodes matching `predicate`.
    ///
    /// A static selection (`dynamic == false`) keeps the nodes matching
    /// now; a dynamic one re-evaluates `predicate` on every access.
    pub fn nodes(&self, predicate: NodePredicate, dynamic: bool) -> NodeSelection {
        NodeSelection::new(&self.partitions, Arc::clone(&self.registry), predicate, dynamic)
    }

    /// Every known node.
    pub fn all(&self) -> NodeSelection {
        self.nodes(predicates::all(), false)
    }

    /// Nodes flagged `master`.
    pub fn masters(&self) -> NodeSelection {
        self.nodes(predicates::masters(), false)
    }

    /// Nodes flagged `slave`.
    pub fn slaves(&self) -> NodeSelection {
        self.nodes(predicates::slaves(), false)
    }

    /// The node that answered the last topology query.
    pub fn myself(&self) -> NodeSelection {
        self.nodes(predicates::myself(), false)
    }

    /// Gets the value of `key`.
    pub fn get(&self, key: impl Into<Bytes>) -> CommandFuture<Option<Bytes>> {
        let key = key.into();
        self.router
            .execute_keyed(&key, command::get(key.clone()), command::frame_to_bytes)
    }

    /// Sets `key` to `value`.
    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> CommandFuture<()> {
        let key = key.into();
        self.router
            .execute_keyed(&key, command::set(key.clone(), value), command::frame_to_ok)
    }

    /// Deletes keys on whichever nodes own them and returns the total
    /// number removed.
    pub fn del<I, K>(&self, keys: I) -> CommandFuture<i64>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        self.per_slot_keys(keys, command::del)
    }

    /// Counts how many of `keys` exist.
    pub fn exists<I, K>(&self, keys: I) -> CommandFuture<i64>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        self.per_slot_keys(keys, command::exists)
    }

    fn per_slot_keys<I, K>(&self, keys: I, build: fn(Vec<Bytes>) -> Cmd) -> CommandFuture<i64>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        let keys: Vec<Bytes> = keys.into_iter().map(Into::into).collect();
        let parts = split_by_slot(keys, |k| k.as_ref())
            .into_iter()
            .map(|batch| {
                let keys = batch.entries.into_iter().map(|(_, key)| key).collect();
                self.router.execute(batch.slot, build(keys), command::frame_to_int)
            })
            .collect();
        reduce(parts, Sum)
    }

    /// Gets several keys, split per slot.
    ///
    /// Values come back in the order the keys were given, whatever order
    /// the nodes answer in.
    pub fn mget<I, K>(&self, keys: I) -> CommandFuture<Vec<Option<Bytes>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        let keys: Vec<Bytes> = keys.into_iter().map(Into::into).collect();
        let total = keys.len();
        let parts: Vec<(Vec<usize>, CommandFuture<Vec<Option<Bytes>>>)> =
            split_by_slot(keys, |k| k.as_ref())
                .into_iter()
                .map(|batch| {
                    let (positions, keys): (Vec<usize>, Vec<Bytes>) =
                        batch.entries.into_iter().unzip();
                    let fut = self.router.execute(
                        batch.slot,
                        command::mget(keys),
                        command::frame_to_vec_bytes,
                    );
                    (positions, fut)
                })
                .collect();

        CommandFuture::new(async move {
            let mut values = vec![None; total];
            for (positions, fut) in parts {
                let part = fut.await?;
                if part.len() != positions.len() {
                    return Err(Error::Protocol {
                        message: format!(
                            "MGET returned {} values for {} keys",
                            part.len(),
                            positions.len()
                        ),
                    });
                }
                for (position, value) in positions.into_iter().zip(part) {
                    values[position] = value;
                }
            }
            Ok(values)
        })
    }

    /// Sets several keys, split per slot. Fails with the first error if any
    /// part fails.
    pub fn mset<I, K, V>(&self, pairs: I) -> CommandFuture<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Bytes>,
        V: Into<Bytes>,
    {
        let parts = self.per_slot_pairs(pairs, |pairs| command::mset(pairs), command::frame_to_ok);
        reduce(parts, AllSucceeded)
    }

    /// Sets several keys only where absent, split per slot.
    ///
    /// True only if every part set all of its keys. The parts are
    /// independent: a part that succeeded is not undone when another part
    /// finds an existing key.
    pub fn msetnx<I, K, V>(&self, pairs: I) -> CommandFuture<bool>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Bytes>,
        V: Into<Bytes>,
    {
        let parts = self.per_slot_pairs(pairs, |pairs| command::msetnx(pairs), command::frame_to_bool);
        reduce(parts, LogicalAnd)
    }

    fn per_slot_pairs<I, K, V, T>(
        &self,
        pairs: I,
        build: fn(Vec<(Bytes, Bytes)>) -> Cmd,
        convert: fn(Frame) -> Result<T>,
    ) -> Vec<CommandFuture<T>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Bytes>,
        V: Into<Bytes>,
        T: Send + 'static,
    {
        let pairs: Vec<(Bytes, Bytes)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        split_by_slot(pairs, |(k, _)| k.as_ref())
            .into_iter()
            .map(|batch| {
                let pairs = batch.entries.into_iter().map(|(_, pair)| pair).collect();
                self.router.execute(batch.slot, build(pairs), convert)
            })
            .collect()
    }

    /// Keys matching `pattern` on every master, without duplicates.
    pub fn keys(&self, pattern: impl Into<Bytes>) -> CommandFuture<Vec<Bytes>> {
        let executions = self.masters().commands().keys(pattern);
        CommandFuture::new(async move { Union.reduce(executions.into_outcomes().await) })
    }

    /// Keys matching `pattern`, yielded as each master answers.
    ///
    /// Order across nodes is unspecified. A failing node yields its error
    /// in place of its keys.
    pub fn keys_stream(&self, pattern: impl Into<Bytes>) -> BoxStream<'static, Result<Bytes>> {
        let pending: FuturesUnordered<CommandFuture<Vec<Bytes>>> = self
            .masters()
            .commands()
            .keys(pattern)
            .into_iter()
            .map(|(_, fut)| fut)
            .collect();
        pending
            .flat_map(|outcome| {
                let items: Vec<Result<Bytes>> = match outcome {
                    Ok(keys) => keys.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .boxed()
    }

    /// Hands every key matching `pattern` to `callback` and returns how many
    /// keys were delivered.
    ///
    /// # Errors
    ///
    /// Stops at the first node that fails and returns its error.
    pub async fn keys_streaming<F>(&self, pattern: impl Into<Bytes>, mut callback: F) -> Result<u64>
    where
        F: FnMut(Bytes),
    {
        let mut keys = self.keys_stream(pattern);
        let mut count = 0;
        while let Some(key) = keys.next().await {
            callback(key?);
            count += 1;
        }
        Ok(count)
    }

    /// Total number of keys across masters.
    pub fn dbsize(&self) -> CommandFuture<i64> {
        let executions = self.masters().commands().dbsize();
        CommandFuture::new(async move { Sum.reduce(executions.into_outcomes().await) })
    }

    /// FLUSHALL on every master.
    pub fn flushall(&self) -> CommandFuture<()> {
        self.on_all_masters(NodeConnection::flushall)
    }

    /// FLUSHDB on every master.
    pub fn flushdb(&self) -> CommandFuture<()> {
        self.on_all_masters(NodeConnection::flushdb)
    }

    /// SCRIPT FLUSH on every master.
    pub fn script_flush(&self) -> CommandFuture<()> {
        self.on_all_masters(NodeConnection::script_flush)
    }

    fn on_all_masters(&self, send: fn(&NodeConnection) -> CommandFuture<()>) -> CommandFuture<()> {
        let executions = self.masters().commands().fan_out(send);
        CommandFuture::new(async move { AllSucceeded.reduce(executions.into_outcomes().await) })
    }

    /// SCRIPT KILL on every master.
    ///
    /// Nodes not running a script answer with an error; each node's outcome
    /// is kept separately.
    pub fn script_kill(&self) -> AsyncExecutions<()> {
        self.masters().commands().script_kill()
    }

    /// A random key from a randomly picked master, or `None` if that master
    /// is empty or no master is known.
    pub fn randomkey(&self) -> CommandFuture<Option<Bytes>> {
        let masters = self.partitions.nodes_matching(|node| node.is(NodeFlag::Master));
        match masters.choose(&mut rand::thread_rng()) {
            Some(node) => NodeConnection::new(self.registry.for_node(node)).randomkey(),
            None => CommandFuture::ready(Ok(None)),
        }
    }

    /// Names every node connection.
    ///
    /// Sent to all nodes; the first node that rejects the name fails the
    /// whole call. On success, connections opened later get the same name.
    pub fn client_setname(&self, name: impl Into<String>) -> CommandFuture<()> {
        let name = name.into();
        let executions = self
            .all()
            .commands()
            .client_setname(Bytes::from(name.clone()));
        let registry = Arc::clone(&self.registry);
        CommandFuture::new(async move {
            AllSucceeded.reduce(executions.into_outcomes().await)?;
            registry.set_client_name(Some(name));
            Ok(())
        })
    }

    /// Runs a Lua script.
    ///
    /// Fails with [`Error::CrossSlot`] without sending anything if `keys`
    /// span several slots. A script without keys runs on a random slot's
    /// owner.
    pub fn eval<K, A>(&self, script: impl Into<Bytes>, keys: Vec<K>, args: Vec<A>) -> CommandFuture<Frame>
    where
        K: Into<Bytes>,
        A: Into<Bytes>,
    {
        let keys: Vec<Bytes> = keys.into_iter().map(Into::into).collect();
        match script_slot(&keys) {
            Ok(slot) => self.router.execute(
                slot,
                command::eval(script, keys, args),
                command::frame_to_frame,
            ),
            Err(e) => CommandFuture::ready(Err(e)),
        }
    }

    /// Runs a cached script by SHA1 digest. Same routing as
    /// [`eval`](ClusterClient::eval).
    pub fn evalsha<K, A>(&self, sha: impl Into<Bytes>, keys: Vec<K>, args: Vec<A>) -> CommandFuture<Frame>
    where
        K: Into<Bytes>,
        A: Into<Bytes>,
    {
        let keys: Vec<Bytes> = keys.into_iter().map(Into::into).collect();
        match script_slot(&keys) {
            Ok(slot) => self.router.execute(
                slot,
                command::evalsha(sha, keys, args),
                command::frame_to_frame,
            ),
            Err(e) => CommandFuture::ready(Err(e)),
        }
    }

    /// Runs `commands` inside MULTI/EXEC on the node owning `keys`.
    ///
    /// The whole block is written as one batch. Returns the EXEC replies,
    /// or `None` if the server aborted the transaction.
    ///
    /// # Errors
    ///
    /// [`Error::CrossSlot`] if `keys` span several slots and
    /// [`Error::InvalidArgument`] if `keys` is empty. Redirects are not
    /// followed inside a transaction.
    pub fn transaction<K>(&self, keys: Vec<K>, commands: Vec<Cmd>) -> CommandFuture<Option<Vec<Frame>>>
    where
        K: Into<Bytes>,
    {
        let keys: Vec<Bytes> = keys.into_iter().map(Into::into).collect();
        let slot = match single_slot(&keys) {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                return CommandFuture::ready(Err(Error::InvalidArgument {
                    message: "transaction needs at least one key".to_string(),
                }))
            }
            Err(e) => return CommandFuture::ready(Err(e)),
        };
        let connection = match self.router.route(slot) {
            Ok(connection) => connection,
            Err(e) => return CommandFuture::ready(Err(e)),
        };

        let mut frames = Vec::with_capacity(commands.len() + 2);
        frames.push(command::multi().into_frame());
        frames.extend(commands.into_iter().map(Cmd::into_frame));
        frames.push(command::exec().into_frame());
        let replies = connection.dispatch_batch(frames);

        CommandFuture::new(async move {
            let mut replies = futures::future::join_all(replies).await;
            let exec = replies.pop().ok_or_else(|| Error::Protocol {
                message: "transaction lost its EXEC reply".to_string(),
            })??;
            for reply in replies {
                command::parse_frame_response(reply?)?;
            }
            match exec {
                Frame::Array(items) => Ok(Some(items)),
                Frame::Null | Frame::BulkString(None) => Ok(None),
                Frame::Error(e) => Err(command::server_error(&e)),
                _ => Err(Error::Protocol {
                    message: "unexpected EXEC reply".to_string(),
                }),
            }
        })
    }

    /// Sends `cmd` to the owner of `key`'s slot, following redirects.
    pub fn dispatch(&self, key: impl AsRef<[u8]>, cmd: Cmd) -> CommandFuture<Frame> {
        self.router.execute(key_slot(key), cmd, command::frame_to_frame)
    }

    /// Name sent with `CLIENT SETNAME` when a node connection opens.
    pub fn client_name(&self) -> Option<String> {
        self.registry.client_name()
    }

    /// Switches every node connection between immediate writes and manual
    /// flushing. Applies to connections opened later too.
    pub fn set_auto_flush(&self, enabled: bool) {
        self.registry.set_auto_flush(enabled);
    }

    /// Writes the buffered commands of every node connection.
    pub fn flush_commands(&self) {
        self.registry.flush_all();
    }

    /// Closes every node connection. Outstanding commands fail with
    /// [`Error::ConnectionClosed`].
    pub fn close(&self) {
        self.registry.close_all();
    }
}

fn reduce<T, R>(parts: Vec<CommandFuture<T>>, reducer: R) -> CommandFuture<R::Output>
where
    T: Send + 'static,
    R: Reducer<T> + Send + 'static,
    R::Output: Send + 'static,
{
    CommandFuture::new(async move {
        let results = futures::future::join_all(parts).await;
        reducer.reduce(results)
    })
}

fn script_slot(keys: &[Bytes]) -> Result<u16> {
    match single_slot(keys)? {
        Some(slot) => Ok(slot),
        None => Ok(rand::thread_rng().gen_range(0..SLOT_COUNT)),
    }
}

/// Asks the node at `address` for the topology over a short-lived
/// connection.
async fn fetch_topology(address: &str, timeout: Duration) -> Result<Vec<ClusterNode>> {
    let (host, port) = parse_address(address)?;
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| Error::connection(address, "connect timed out"))?
        .map_err(|e| Error::connection(address, e))?;
    stream.set_nodelay(true)?;

    let mut connection = Connection::new(stream);
    let reply = tokio::time::timeout(timeout, async {
        connection.write_frame(&cluster_nodes().into_frame()).await?;
        connection.read_frame().await
    })
    .await
    .map_err(|_| Error::Timeout)??;

    let mut nodes = parse_cluster_nodes(&command::frame_to_string(reply)?)?;
    for node in nodes.iter_mut().filter(|node| node.is(NodeFlag::Myself)) {
        // A node that has never met a peer does not know its own address.
        if node.host.is_empty() {
            node.host = host.to_string();
        }
        if node.port == 0 {
            node.port = port;
        }
    }
    Ok(nodes)
}
