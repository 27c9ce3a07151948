//! Predicate-based node selections.
//!
//! A static selection fixes its members when it is created. A dynamic one
//! keeps the predicate and re-filters the live partition table on every
//! call, so node edits show up without building a new selection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::core::command::{self, Cmd};
use crate::core::future::CommandFuture;
use crate::proto::frame::Frame;
use crate::Result;

use super::executions::AsyncExecutions;
use super::node::NodeConnection;
use super::partitions::Partitions;
use super::registry::ConnectionRegistry;
use super::topology::{ClusterNode, NodeFlag, NodeId};

/// Shared node predicate.
pub type NodePredicate = Arc<dyn Fn(&ClusterNode) -> bool + Send + Sync>;

/// Built-in predicates.
pub mod predicates {
    use super::*;

    /// Every node.
    pub fn all() -> NodePredicate {
        Arc::new(|_| true)
    }

    /// Nodes flagged `master`.
    pub fn masters() -> NodePredicate {
        has_flag(NodeFlag::Master)
    }

    /// Nodes flagged `slave`.
    pub fn slaves() -> NodePredicate {
        has_flag(NodeFlag::Slave)
    }

    /// The node flagged `myself`.
    pub fn myself() -> NodePredicate {
        has_flag(NodeFlag::Myself)
    }

    /// Nodes carrying `flag`.
    pub fn has_flag(flag: NodeFlag) -> NodePredicate {
        Arc::new(move |node| node.is(flag))
    }
}

#[derive(Clone)]
enum Members {
    Static(Vec<ClusterNode>),
    Dynamic {
        partitions: Partitions,
        predicate: NodePredicate,
    },
}

/// An ordered set of nodes plus access to a connection per node.
#[derive(Clone)]
pub struct NodeSelection {
    members: Members,
    registry: Arc<ConnectionRegistry>,
}

impl NodeSelection {
    pub(crate) fn new(
        partitions: &Partitions,
        registry: Arc<ConnectionRegistry>,
        predicate: NodePredicate,
        dynamic: bool,
    ) -> Self {
        let members = if dynamic {
            Members::Dynamic {
                partitions: partitions.clone(),
                predicate,
            }
        } else {
            Members::Static(partitions.nodes_matching(|node| predicate(node)))
        };
        Self { members, registry }
    }

    /// Returns true if membership tracks the live topology.
    pub fn is_dynamic(&self) -> bool {
        matches!(self.members, Members::Dynamic { .. })
    }

    /// Current members.
    pub fn nodes(&self) -> Vec<ClusterNode> {
        match &self.members {
            Members::Static(nodes) => nodes.clone(),
            Members::Dynamic {
                partitions,
                predicate,
            } => partitions.nodes_matching(|node| predicate(node)),
        }
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        match &self.members {
            Members::Static(nodes) => nodes.len(),
            Members::Dynamic {
                partitions,
                predicate,
            } => partitions
                .snapshot()
                .nodes()
                .iter()
                .filter(|node| predicate(node))
                .count(),
        }
    }

    /// Returns true if nothing matches.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Member at `index`.
    pub fn node(&self, index: usize) -> Option<ClusterNode> {
        match &self.members {
            Members::Static(nodes) => nodes.get(index).cloned(),
            Members::Dynamic { .. } => self.nodes().into_iter().nth(index),
        }
    }

    /// Connection to the member at `index`, or `None` if out of range.
    pub fn connection(&self, index: usize) -> Option<Result<NodeConnection>> {
        self.node(index).map(|node| self.connect(&node))
    }

    /// Connection to the member with `id`, or `None` if it is not a member.
    pub fn connection_for(&self, id: &NodeId) -> Option<Result<NodeConnection>> {
        self.nodes()
            .into_iter()
            .find(|node| &node.id == id)
            .map(|node| self.connect(&node))
    }

    /// Every member with its connection.
    pub fn as_map(&self) -> Result<HashMap<NodeId, (ClusterNode, NodeConnection)>> {
        self.nodes()
            .into_iter()
            .map(|node| {
                let connection = self.connect(&node)?;
                Ok((node.id.clone(), (node, connection)))
            })
            .collect()
    }

    /// Iterates over the members as of this call.
    pub fn iter(&self) -> std::vec::IntoIter<ClusterNode> {
        self.nodes().into_iter()
    }

    /// Commands sent to every member.
    pub fn commands(&self) -> SelectionCommands {
        SelectionCommands {
            selection: self.clone(),
        }
    }

    fn connect(&self, node: &ClusterNode) -> Result<NodeConnection> {
        self.registry
            .by_node_id(&node.id)
            .map(NodeConnection::new)
    }
}

impl IntoIterator for &NodeSelection {
    type Item = ClusterNode;
    type IntoIter = std::vec::IntoIter<ClusterNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Debug for NodeSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSelection")
            .field("dynamic", &self.is_dynamic())
            .field("nodes", &self.nodes())
            .finish()
    }
}

/// Fan-out commands over a [`NodeSelection`].
///
/// Each call sends one sub-command per member and returns the per-node
/// outcomes. A member whose connection cannot be opened gets an
/// already-failed future.
#[derive(Debug, Clone)]
pub struct SelectionCommands {
    selection: NodeSelection,
}

impl SelectionCommands {
    pub(crate) fn fan_out<T, F>(&self, send: F) -> AsyncExecutions<T>
    where
        T: Send + 'static,
        F: Fn(&NodeConnection) -> CommandFuture<T>,
    {
        let entries = self
            .selection
            .nodes()
            .into_iter()
            .map(|node| {
                let fut = match self.selection.connect(&node) {
                    Ok(connection) => send(&connection),
                    Err(e) => CommandFuture::ready(Err(e)),
                };
                (node, fut)
            })
            .collect();
        AsyncExecutions::new(entries)
    }

    /// PING every member.
    pub fn ping(&self) -> AsyncExecutions<String> {
        self.fan_out(NodeConnection::ping)
    }

    /// GET `key` from every member.
    pub fn get(&self, key: impl Into<Bytes>) -> AsyncExecutions<Option<Bytes>> {
        let key = key.into();
        self.fan_out(|c| c.get(key.clone()))
    }

    /// KEYS on every member.
    pub fn keys(&self, pattern: impl Into<Bytes>) -> AsyncExecutions<Vec<Bytes>> {
        let pattern = pattern.into();
        self.fan_out(|c| c.keys(pattern.clone()))
    }

    /// DBSIZE of every member.
    pub fn dbsize(&self) -> AsyncExecutions<i64> {
        self.fan_out(NodeConnection::dbsize)
    }

    /// SCRIPT KILL on every member.
    pub fn script_kill(&self) -> AsyncExecutions<()> {
        self.fan_out(NodeConnection::script_kill)
    }

    /// CONFIG SET on every member.
    pub fn config_set(
        &self,
        parameter: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> AsyncExecutions<()> {
        let (parameter, value) = (parameter.into(), value.into());
        self.fan_out(|c| c.config_set(parameter.clone(), value.clone()))
    }

    /// CLIENT SETNAME on every member.
    pub fn client_setname(&self, name: impl Into<Bytes>) -> AsyncExecutions<()> {
        let name = name.into();
        self.fan_out(|c| c.client_setname(name.clone()))
    }

    /// Sends `cmd` to every member.
    pub fn dispatch(&self, cmd: Cmd) -> AsyncExecutions<Frame> {
        self.fan_out(|c| c.send(cmd.clone(), command::frame_to_frame))
    }
}
