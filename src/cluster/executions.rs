//! Per-node results of a fan-out command.

use std::time::Duration;

use crate::core::future::{self, CommandFuture};
use crate::Result;

use super::topology::{ClusterNode, NodeId};

/// One command sent to several nodes, with a future per target node.
///
/// Sub-commands are already dispatched when the value is created. Nodes
/// keep the order they were selected in.
#[derive(Debug)]
pub struct AsyncExecutions<T> {
    entries: Vec<(ClusterNode, CommandFuture<T>)>,
}

impl<T: Send + 'static> AsyncExecutions<T> {
    pub(crate) fn new(entries: Vec<(ClusterNode, CommandFuture<T>)>) -> Self {
        Self { entries }
    }

    /// Number of target nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no node was targeted.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Target nodes in dispatch order.
    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.entries.iter().map(|(node, _)| node)
    }

    /// Future of the sub-command sent to `id`.
    pub fn get(&self, id: &NodeId) -> Option<&CommandFuture<T>> {
        self.entries
            .iter()
            .find(|(node, _)| &node.id == id)
            .map(|(_, fut)| fut)
    }

    /// Mutable access to the future of the sub-command sent to `id`.
    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut CommandFuture<T>> {
        self.entries
            .iter_mut()
            .find(|(node, _)| &node.id == id)
            .map(|(_, fut)| fut)
    }

    /// Iterates over `(node, future)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&ClusterNode, &CommandFuture<T>)> {
        self.entries.iter().map(|(node, fut)| (node, fut))
    }

    /// Iterates over the futures for manual composition.
    pub fn futures_mut(&mut self) -> impl Iterator<Item = &mut CommandFuture<T>> {
        self.entries.iter_mut().map(|(_, fut)| fut)
    }

    /// Waits for every sub-command, up to `timeout`.
    ///
    /// Returns whether all of them completed. Nothing is cancelled on
    /// timeout; outcomes gathered so far stay in place.
    pub async fn await_all(&mut self, timeout: Duration) -> bool {
        future::await_all(timeout, self.futures_mut()).await
    }

    /// Waits for every sub-command and returns the outcomes in node order.
    pub async fn into_results(self) -> Vec<(ClusterNode, Result<T>)> {
        let (nodes, futures): (Vec<_>, Vec<_>) = self.entries.into_iter().unzip();
        let results = futures::future::join_all(futures).await;
        nodes.into_iter().zip(results).collect()
    }

    /// Waits for every sub-command and returns only the outcomes.
    pub async fn into_outcomes(self) -> Vec<Result<T>> {
        futures::future::join_all(self.entries.into_iter().map(|(_, fut)| fut)).await
    }
}

impl<T> IntoIterator for AsyncExecutions<T> {
    type Item = (ClusterNode, CommandFuture<T>);
    type IntoIter = std::vec::IntoIter<(ClusterNode, CommandFuture<T>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
