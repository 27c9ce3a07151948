//! Key to node routing.
//!
//! Single-key commands go to the owner of the key's slot. Multi-key
//! commands are split into one sub-command per slot, remembering each key's
//! position so replies can be put back in request order. Commands that must
//! run atomically are never split.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::core::command::Cmd;
use crate::core::future::CommandFuture;
use crate::core::multiplexed::MultiplexedConnection;
use crate::proto::frame::Frame;
use crate::{Error, Result};

use super::partitions::Partitions;
use super::registry::ConnectionRegistry;
use super::slot::key_slot;

/// Part of a split command: the items whose keys share `slot`, each with
/// its position in the original request.
#[derive(Debug)]
pub(crate) struct SlotBatch<T> {
    pub(crate) slot: u16,
    pub(crate) entries: Vec<(usize, T)>,
}

/// Groups `items` by the slot of their key, in order of first appearance.
pub(crate) fn split_by_slot<T, F>(items: Vec<T>, key: F) -> Vec<SlotBatch<T>>
where
    F: Fn(&T) -> &[u8],
{
    let mut batches: Vec<SlotBatch<T>> = Vec::new();
    let mut by_slot: HashMap<u16, usize> = HashMap::new();
    for (index, item) in items.into_iter().enumerate() {
        let slot = key_slot(key(&item));
        let batch = *by_slot.entry(slot).or_insert_with(|| {
            batches.push(SlotBatch {
                slot,
                entries: Vec::new(),
            });
            batches.len() - 1
        });
        batches[batch].entries.push((index, item));
    }
    batches
}

/// The one slot all `keys` hash to.
///
/// Returns `None` for an empty key list.
///
/// # Errors
///
/// [`Error::CrossSlot`] if the keys span several slots.
pub(crate) fn single_slot(keys: &[Bytes]) -> Result<Option<u16>> {
    let mut slots = keys.iter().map(key_slot);
    let Some(first) = slots.next() else {
        return Ok(None);
    };
    if slots.any(|slot| slot != first) {
        return Err(Error::CrossSlot);
    }
    Ok(Some(first))
}

/// Splits `host:port`.
pub(crate) fn parse_address(address: &str) -> Result<(&str, u16)> {
    address
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host, port.parse().ok()?)))
        .ok_or_else(|| Error::connection(address, "invalid address"))
}

/// Resolves slots to node connections and runs commands with redirect
/// handling.
#[derive(Debug)]
pub(crate) struct SlotRouter {
    pub(crate) partitions: Partitions,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) max_redirects: usize,
}

impl SlotRouter {
    /// Connection to the owner of `slot`.
    ///
    /// # Errors
    ///
    /// [`Error::SlotUnassigned`] if no node owns the slot.
    pub(crate) fn route(&self, slot: u16) -> Result<MultiplexedConnection> {
        let node = self
            .partitions
            .node_for_slot(slot)
            .ok_or(Error::SlotUnassigned { slot })?;
        Ok(self.registry.for_node(&node))
    }

    /// Connection to the node at `address`.
    ///
    /// Known members share their routing connection; anything else goes
    /// through the registry's address checks.
    pub(crate) fn connection_for_address(&self, address: &str) -> Result<MultiplexedConnection> {
        let (host, port) = parse_address(address)?;
        match self.partitions.node_by_address(host, port) {
            Some(node) => Ok(self.registry.for_node(&node)),
            None => self.registry.by_address(host, port),
        }
    }

    /// Sends `cmd` to the owner of `slot` now and follows redirects when the
    /// reply arrives.
    pub(crate) fn execute<T>(
        self: &Arc<Self>,
        slot: u16,
        cmd: Cmd,
        convert: fn(Frame) -> Result<T>,
    ) -> CommandFuture<T>
    where
        T: Send + 'static,
    {
        let connection = match self.route(slot) {
            Ok(connection) => connection,
            Err(e) => return CommandFuture::ready(Err(e)),
        };
        let frame = cmd.into_frame();
        let reply = connection.dispatch(frame.clone());
        let router = Arc::clone(self);
        CommandFuture::new(async move {
            let first = reply.await?;
            convert(router.follow_redirects(frame, first).await?)
        })
    }

    /// Like [`execute`](SlotRouter::execute) for a command with one key.
    pub(crate) fn execute_keyed<T>(
        self: &Arc<Self>,
        key: &[u8],
        cmd: Cmd,
        convert: fn(Frame) -> Result<T>,
    ) -> CommandFuture<T>
    where
        T: Send + 'static,
    {
        self.execute(key_slot(key), cmd, convert)
    }
}
