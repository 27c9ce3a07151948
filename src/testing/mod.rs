//! In-process mock cluster for tests.
//!
//! [`MockCluster`] runs a handful of fake nodes on loopback TCP. They speak
//! RESP through the crate's own codec, own slot ranges like real masters,
//! answer `CLUSTER NODES`, and reply with `MOVED`, `ASK` and `CROSSSLOT`
//! the way a real cluster does. Hooks let tests move slots, start a
//! migration or make a slot bounce between nodes forever.
//!
//! ```no_run
//! use slotmux::testing::MockCluster;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = MockCluster::start().await?;
//! let client = cluster.builder().build().await?;
//! client.set("foo", "bar").await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::cluster::{key_slot, ClusterClientBuilder, NodeId};
use crate::core::command::Cmd;
use crate::core::connection::Connection;
use crate::proto::frame::Frame;

const MASTER_RANGES: [(u16, u16); 3] = [(0, 5460), (5461, 10922), (10923, 16383)];

struct MockNode {
    id: String,
    port: u16,
    replica_of: Option<usize>,
    slots: Vec<(u16, u16)>,
    data: HashMap<Bytes, Bytes>,
    migrating: HashMap<u16, usize>,
    importing: HashSet<u16>,
    clients: HashMap<u64, Option<Bytes>>,
    commands: u64,
}

impl MockNode {
    fn owns(&self, slot: u16) -> bool {
        self.replica_of.is_none() && self.slots.iter().any(|&(s, e)| s <= slot && slot <= e)
    }

    fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

#[derive(Default)]
struct ClusterState {
    nodes: Vec<MockNode>,
    bouncing: HashSet<u16>,
    next_client: u64,
}

impl ClusterState {
    fn owner(&self, slot: u16) -> Option<usize> {
        self.nodes.iter().position(|node| node.owns(slot))
    }

    fn masters(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].replica_of.is_none())
            .collect()
    }

    /// Decides whether node `index` may serve `keys`, or which error it
    /// answers with instead.
    fn check_keys(&self, index: usize, keys: &[Bytes], asking: bool) -> Result<(), Frame> {
        let Some(first) = keys.first() else {
            return Ok(());
        };
        let slot = key_slot(first);
        if keys.iter().any(|key| key_slot(key) != slot) {
            return Err(Frame::error(
                "CROSSSLOT Keys in request don't hash to the same slot",
            ));
        }

        if self.bouncing.contains(&slot) {
            let masters = self.masters();
            let next = masters
                .iter()
                .position(|&m| m == index)
                .map_or(0, |pos| (pos + 1) % masters.len());
            let target = &self.nodes[masters[next]];
            return Err(Frame::error(format!("MOVED {} {}", slot, target.address())));
        }

        let node = &self.nodes[index];
        match self.owner(slot) {
            Some(owner) if owner == index => {
                if let Some(&target) = node.migrating.get(&slot) {
                    if keys.iter().any(|key| !node.data.contains_key(key)) {
                        let target = self.nodes[target].address();
                        return Err(Frame::error(format!("ASK {} {}", slot, target)));
                    }
                }
                Ok(())
            }
            _ if asking && node.importing.contains(&slot) => Ok(()),
            Some(owner) => Err(Frame::error(format!(
                "MOVED {} {}",
                slot,
                self.nodes[owner].address()
            ))),
            None => Err(Frame::error("CLUSTERDOWN Hash slot not served")),
        }
    }

    fn cluster_nodes(&self, index: usize) -> String {
        let mut text = String::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let role = if node.replica_of.is_some() { "slave" } else { "master" };
            let flags = if i == index {
                format!("myself,{}", role)
            } else {
                role.to_string()
            };
            let master = node
                .replica_of
                .map_or("-".to_string(), |m| self.nodes[m].id.clone());
            text.push_str(&format!(
                "{} 127.0.0.1:{}@{} {} {} 0 0 {} connected",
                node.id,
                node.port,
                u32::from(node.port) + 10000,
                flags,
                master,
                i + 1
            ));
            for &(start, end) in &node.slots {
                if start == end {
                    text.push_str(&format!(" {}", start));
                } else {
                    text.push_str(&format!(" {}-{}", start, end));
                }
            }
            for (slot, target) in &node.migrating {
                text.push_str(&format!(" [{}->-{}]", slot, self.nodes[*target].id));
            }
            text.push('\n');
        }
        text
    }
}

/// A set of fake cluster nodes listening on loopback.
///
/// Nodes `0..3` are masters serving `0-5460`, `5461-10922` and
/// `10923-16383`; replicas, if any, follow. Dropping the cluster stops
/// every node.
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockCluster {
    /// Starts three masters.
    pub async fn start() -> io::Result<Self> {
        Self::with_replicas(0).await
    }

    /// Starts three masters plus `replicas` replicas, assigned to the
    /// masters round-robin.
    pub async fn with_replicas(replicas: usize) -> io::Result<Self> {
        let mut listeners = Vec::new();
        let mut state = ClusterState::default();
        for index in 0..MASTER_RANGES.len() + replicas {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let replica_of = index
                .checked_sub(MASTER_RANGES.len())
                .map(|r| r % MASTER_RANGES.len());
            state.nodes.push(MockNode {
                id: format!("{:040x}", 0xc1u64 * 0x1000 + index as u64),
                port: listener.local_addr()?.port(),
                replica_of,
                slots: MASTER_RANGES.get(index).map(|&r| vec![r]).unwrap_or_default(),
                data: HashMap::new(),
                migrating: HashMap::new(),
                importing: HashSet::new(),
                clients: HashMap::new(),
                commands: 0,
            });
            listeners.push(listener);
        }

        let state = Arc::new(Mutex::new(state));
        let tasks = listeners
            .into_iter()
            .enumerate()
            .map(|(index, listener)| tokio::spawn(accept_loop(Arc::clone(&state), index, listener)))
            .collect();
        Ok(Self { state, tasks })
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Returns true if the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `host:port` of every node, comma-separated.
    pub fn seeds(&self) -> String {
        let state = self.state.lock();
        state
            .nodes
            .iter()
            .map(MockNode::address)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// A client builder seeded with this cluster.
    pub fn builder(&self) -> ClusterClientBuilder {
        ClusterClientBuilder::new().seeds(self.seeds())
    }

    /// `host:port` of node `index`.
    pub fn address(&self, index: usize) -> String {
        self.state.lock().nodes[index].address()
    }

    /// Port of node `index`.
    pub fn port(&self, index: usize) -> u16 {
        self.state.lock().nodes[index].port
    }

    /// Id of node `index`.
    pub fn node_id(&self, index: usize) -> NodeId {
        NodeId::new(self.state.lock().nodes[index].id.clone())
    }

    /// Index of the master currently serving `key`.
    pub fn owner_of(&self, key: impl AsRef<[u8]>) -> Option<usize> {
        self.state.lock().owner(key_slot(key))
    }

    /// Commands node `index` has processed so far.
    pub fn command_count(&self, index: usize) -> u64 {
        self.state.lock().nodes[index].commands
    }

    /// Keys stored on node `index`.
    pub fn keys_on(&self, index: usize) -> Vec<Bytes> {
        self.state.lock().nodes[index].data.keys().cloned().collect()
    }

    /// Stores `key` on node `index` directly, ignoring slot ownership.
    pub fn insert(&self, index: usize, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.state.lock().nodes[index]
            .data
            .insert(key.into(), value.into());
    }

    /// Hands `slot` and its keys to node `to` for good.
    pub fn move_slot(&self, slot: u16, to: usize) {
        let mut state = self.state.lock();
        let mut moved = Vec::new();
        for node in state.nodes.iter_mut() {
            node.slots = node
                .slots
                .iter()
                .flat_map(|&(start, end)| split_range(start, end, slot))
                .collect();
            node.migrating.remove(&slot);
            node.importing.remove(&slot);
            let keys: Vec<Bytes> = node
                .data
                .keys()
                .filter(|key| key_slot(key) == slot)
                .cloned()
                .collect();
            for key in keys {
                if let Some(value) = node.data.remove(&key) {
                    moved.push((key, value));
                }
            }
        }
        let target = &mut state.nodes[to];
        target.slots.push((slot, slot));
        target.data.extend(moved);
    }

    /// Marks `slot` as migrating from its owner to node `to`.
    ///
    /// The owner keeps serving keys it still holds and answers `ASK` for
    /// the rest; node `to` serves the slot only after `ASKING`.
    pub fn start_migration(&self, slot: u16, to: usize) {
        let mut state = self.state.lock();
        if let Some(owner) = state.owner(slot) {
            state.nodes[owner].migrating.insert(slot, to);
            state.nodes[to].importing.insert(slot);
        }
    }

    /// Makes every master answer `MOVED` to the next master for `slot`.
    pub fn set_bouncing(&self, slot: u16, enabled: bool) {
        let mut state = self.state.lock();
        if enabled {
            state.bouncing.insert(slot);
        } else {
            state.bouncing.remove(&slot);
        }
    }

    /// Stops node `index`; its open connections are dropped.
    pub fn stop_node(&self, index: usize) {
        if let Some(task) = self.tasks.get(index) {
            task.abort();
        }
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for MockCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCluster")
            .field("seeds", &self.seeds())
            .finish()
    }
}

fn split_range(start: u16, end: u16, slot: u16) -> Vec<(u16, u16)> {
    if slot < start || slot > end {
        return vec![(start, end)];
    }
    let mut parts = Vec::new();
    if slot > start {
        parts.push((start, slot - 1));
    }
    if slot < end {
        parts.push((slot + 1, end));
    }
    parts
}

async fn accept_loop(state: Arc<Mutex<ClusterState>>, index: usize, listener: TcpListener) {
    let mut clients = Vec::new();
    while let Ok((socket, _)) = listener.accept().await {
        clients.push(AbortOnDrop(tokio::spawn(serve(Arc::clone(&state), index, socket))));
    }
}

/// Stops a per-client task when the node's accept loop goes away.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Default)]
struct Session {
    client: u64,
    asking: bool,
    multi: Option<Vec<Cmd>>,
    aborted: bool,
}

async fn serve(state: Arc<Mutex<ClusterState>>, index: usize, socket: TcpStream) {
    let mut session = Session::default();
    {
        let mut state = state.lock();
        state.next_client += 1;
        session.client = state.next_client;
        state.nodes[index].clients.insert(session.client, None);
    }

    let mut connection = Connection::new(socket);
    while let Ok(frame) = connection.read_frame().await {
        let reply = match Cmd::from_frame(frame) {
            Some(cmd) => {
                trace!(node = index, command = %cmd.name(), "mock request");
                handle(&mut state.lock(), index, &mut session, cmd)
            }
            None => Frame::error("ERR Protocol error: expected array of bulk strings"),
        };
        if connection.write_frame(&reply).await.is_err() {
            break;
        }
    }

    state.lock().nodes[index].clients.remove(&session.client);
}

/// Keys a command touches.
fn command_keys(name: &str, args: &[Bytes]) -> Vec<Bytes> {
    match name {
        "GET" | "SET" => args.get(1).cloned().into_iter().collect(),
        "MGET" | "DEL" | "EXISTS" => args[1..].to_vec(),
        "MSET" | "MSETNX" => args[1..].iter().step_by(2).cloned().collect(),
        "EVAL" | "EVALSHA" => {
            let count = args
                .get(2)
                .and_then(|n| std::str::from_utf8(n).ok()?.parse::<usize>().ok())
                .unwrap_or(0);
            args.iter().skip(3).take(count).cloned().collect()
        }
        _ => Vec::new(),
    }
}

fn handle(state: &mut ClusterState, index: usize, session: &mut Session, cmd: Cmd) -> Frame {
    state.nodes[index].commands += 1;
    let asking = std::mem::take(&mut session.asking);
    let name = cmd.name();

    match name.as_str() {
        "MULTI" if session.multi.is_some() => return Frame::error("ERR MULTI calls can not be nested"),
        "MULTI" => {
            session.multi = Some(Vec::new());
            session.aborted = false;
            return Frame::ok();
        }
        "EXEC" => {
            let Some(queued) = session.multi.take() else {
                return Frame::error("ERR EXEC without MULTI");
            };
            if std::mem::take(&mut session.aborted) {
                return Frame::error("EXECABORT Transaction discarded because of previous errors.");
            }
            let replies = queued
                .into_iter()
                .map(|cmd| {
                    let name = cmd.name();
                    execute(state, index, session, &name, cmd.args())
                })
                .collect();
            return Frame::Array(replies);
        }
        _ => {}
    }

    if let Err(reply) = state.check_keys(index, &command_keys(&name, cmd.args()), asking) {
        if session.multi.is_some() {
            session.aborted = true;
        }
        return reply;
    }

    if let Some(queued) = session.multi.as_mut() {
        queued.push(cmd);
        return Frame::SimpleString(b"QUEUED".to_vec());
    }
    execute(state, index, session, &name, cmd.args())
}

fn wrong_args(name: &str) -> Frame {
    Frame::error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

fn execute(state: &mut ClusterState, index: usize, session: &mut Session, name: &str, args: &[Bytes]) -> Frame {
    let sub = args
        .get(1)
        .map(|s| String::from_utf8_lossy(s).to_ascii_uppercase())
        .unwrap_or_default();

    if name == "CLUSTER" && sub == "NODES" && args.len() == 2 {
        return Frame::bulk(state.cluster_nodes(index));
    }

    let node = &mut state.nodes[index];
    match (name, args.len()) {
        ("PING", _) => Frame::SimpleString(b"PONG".to_vec()),
        ("ASKING", 1) => {
            session.asking = true;
            Frame::ok()
        }
        ("GET", 2) => Frame::BulkString(node.data.get(&args[1]).cloned()),
        ("SET", 3) => {
            node.data.insert(args[1].clone(), args[2].clone());
            Frame::ok()
        }
        ("MGET", n) if n > 1 => Frame::Array(
            args[1..]
                .iter()
                .map(|key| Frame::BulkString(node.data.get(key).cloned()))
                .collect(),
        ),
        ("MSET", n) if n > 1 && n % 2 == 1 => {
            for pair in args[1..].chunks(2) {
                node.data.insert(pair[0].clone(), pair[1].clone());
            }
            Frame::ok()
        }
        ("MSETNX", n) if n > 1 && n % 2 == 1 => {
            if args[1..].iter().step_by(2).any(|key| node.data.contains_key(key)) {
                return Frame::Integer(0);
            }
            for pair in args[1..].chunks(2) {
                node.data.insert(pair[0].clone(), pair[1].clone());
            }
            Frame::Integer(1)
        }
        ("DEL", n) if n > 1 => Frame::Integer(
            args[1..]
                .iter()
                .filter(|key| node.data.remove(*key).is_some())
                .count() as i64,
        ),
        ("EXISTS", n) if n > 1 => Frame::Integer(
            args[1..]
                .iter()
                .filter(|key| node.data.contains_key(*key))
                .count() as i64,
        ),
        ("KEYS", 2) => Frame::Array(
            node.data
                .keys()
                .filter(|key| glob_match(&args[1], key))
                .map(|key| Frame::bulk(key.clone()))
                .collect(),
        ),
        ("DBSIZE", 1) => Frame::Integer(node.data.len() as i64),
        ("FLUSHALL", 1) | ("FLUSHDB", 1) => {
            node.data.clear();
            Frame::ok()
        }
        ("RANDOMKEY", 1) => Frame::BulkString(node.data.keys().next().cloned()),
        ("SCRIPT", 2) if sub == "FLUSH" => Frame::ok(),
        ("SCRIPT", 2) if sub == "KILL" => Frame::error("NOTBUSY No scripts in execution right now."),
        ("CLIENT", 3) if sub == "SETNAME" => {
            if args[2].iter().any(|b| b.is_ascii_whitespace() || !b.is_ascii_graphic()) {
                return Frame::error(
                    "ERR Client names cannot contain spaces, newlines or special characters.",
                );
            }
            node.clients.insert(session.client, Some(args[2].clone()));
            Frame::ok()
        }
        ("CLIENT", 2) if sub == "GETNAME" => {
            Frame::BulkString(node.clients.get(&session.client).cloned().flatten())
        }
        ("CLIENT", 2) if sub == "LIST" => {
            let mut ids: Vec<_> = node.clients.keys().copied().collect();
            ids.sort_unstable();
            let list: String = ids
                .into_iter()
                .map(|id| {
                    let name = node.clients[&id]
                        .as_ref()
                        .map(|n| String::from_utf8_lossy(n).into_owned())
                        .unwrap_or_default();
                    format!("id={} addr=127.0.0.1 name={}\n", id, name)
                })
                .collect();
            Frame::bulk(list)
        }
        ("CONFIG", 4) if sub == "SET" => Frame::ok(),
        ("CLUSTER", 2) if sub == "MYID" => Frame::bulk(node.id.clone()),
        ("EVAL", n) if n >= 3 => Frame::Array(args[3..].iter().cloned().map(Frame::bulk).collect()),
        ("EVALSHA", n) if n >= 3 => Frame::error("NOSCRIPT No matching script. Please use EVAL."),
        (
            "GET" | "SET" | "MGET" | "MSET" | "MSETNX" | "DEL" | "EXISTS" | "KEYS" | "DBSIZE"
            | "FLUSHALL" | "FLUSHDB" | "RANDOMKEY" | "ASKING" | "EVAL" | "EVALSHA",
            _,
        ) => wrong_args(name),
        _ => Frame::error(format!("ERR unknown command '{}'", name)),
    }
}

/// Glob matching with `*` and `?`.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}
